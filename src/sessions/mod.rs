//! Session management: conversation event logs, derived state and the
//! storage backends that persist them.

pub mod error;
pub mod event;
pub mod in_memory;
pub mod remote;
pub mod session;
pub mod sqlite;
pub mod state;
pub mod traits;

pub use error::{SessionError, SessionResult};
pub use event::{Content, Event, EventActions, File, Outcome, Part};
pub use in_memory::InMemorySessionService;
pub use remote::RemoteSessionService;
pub use session::{Session, SessionSnapshot};
pub use sqlite::{SqliteOptions, SqliteSessionService};
pub use state::{
    is_temp_key, State, StateMap, KEY_PREFIX_APP, KEY_PREFIX_TEMP, KEY_PREFIX_USER,
};
pub use traits::{EventPage, GetSessionConfig, SessionKey, SessionService};

use crate::config::Config;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// Build the session backend selected by `[storage] backend`.
pub async fn create_session_service(config: &Config) -> Result<Arc<dyn SessionService>> {
    match config.storage.backend.trim() {
        "memory" => Ok(Arc::new(InMemorySessionService::new())),
        "sqlite" => {
            let path = config.resolved_sqlite_path();
            let options = SqliteOptions {
                busy_timeout: Duration::from_millis(config.storage.busy_timeout_ms),
                operation_timeout: Duration::from_secs(config.storage.operation_timeout_secs),
            };
            let service = SqliteSessionService::open(&path, options)
                .await
                .with_context(|| format!("Failed to open session database: {}", path.display()))?;
            Ok(Arc::new(service))
        }
        "remote" => {
            let service = RemoteSessionService::new(&config.remote)
                .context("Failed to configure remote session service")?;
            Ok(Arc::new(service))
        }
        other => anyhow::bail!("Unknown session backend: {other}"),
    }
}

/// Handle `sessionvault sessions <subcommand>`.
pub async fn handle_session_command(
    command: crate::SessionCommands,
    config: &Config,
) -> Result<()> {
    let service = create_session_service(config).await?;
    match command {
        crate::SessionCommands::List { app, user } => {
            let sessions = service.list_sessions(&app, &user).await?;
            if sessions.is_empty() {
                println!("No sessions found for {app}/{user}.");
                return Ok(());
            }
            println!("Sessions for {app}/{user} ({} total):\n", sessions.len());
            for session in &sessions {
                println!(
                    "- {}  created {}  updated {}",
                    session.id(),
                    session.create_time().to_rfc3339(),
                    session.update_time().to_rfc3339()
                );
            }
        }
        crate::SessionCommands::Show {
            app,
            user,
            id,
            recent,
            after,
        } => {
            let window = GetSessionConfig {
                num_recent_events: recent,
                after_timestamp: after,
            };
            let session = service
                .get_session(&SessionKey::new(app, user, id), Some(&window))
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&session.to_snapshot())
                    .context("Failed to render session")?
            );
        }
        crate::SessionCommands::Events { app, user, id } => {
            let page = service.list_events(&SessionKey::new(app, user, id)).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&page.events).context("Failed to render events")?
            );
        }
        crate::SessionCommands::Create {
            app,
            user,
            id,
            state,
        } => {
            let initial_state: StateMap = match state.as_deref() {
                Some(raw) => serde_json::from_str(raw)
                    .context("--state must be a JSON object of key/value pairs")?,
                None => StateMap::new(),
            };
            let session = service
                .create_session(&app, &user, initial_state, id.as_deref())
                .await?;
            println!("✓ Created session {}", session.key());
        }
        crate::SessionCommands::Delete { app, user, id, yes } => {
            let key = SessionKey::new(app, user, id);
            if !yes {
                eprintln!("Use --yes to confirm deletion of session '{key}'.");
                return Ok(());
            }
            service.delete_session(&key).await?;
            println!("✓ Deleted session {key}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionCommands;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir, backend: &str) -> Config {
        let mut config = Config::default();
        config.config_dir = dir.path().to_path_buf();
        config.config_path = dir.path().join("config.toml");
        config.storage.backend = backend.into();
        config
    }

    #[tokio::test]
    async fn factory_builds_each_backend() {
        let tmp = TempDir::new().unwrap();
        for (backend, name) in [("memory", "in_memory"), ("sqlite", "sqlite"), ("remote", "remote")] {
            let service = create_session_service(&config_in(&tmp, backend)).await.unwrap();
            assert_eq!(service.name(), name);
        }
        assert!(tmp.path().join("sessions.db").exists());
    }

    #[tokio::test]
    async fn factory_rejects_unknown_backend() {
        let tmp = TempDir::new().unwrap();
        let err = create_session_service(&config_in(&tmp, "redis")).await.err().unwrap();
        assert!(err.to_string().contains("redis"));
    }

    #[tokio::test]
    async fn cli_handler_creates_and_deletes_sqlite_sessions() {
        let tmp = TempDir::new().unwrap();
        let config = config_in(&tmp, "sqlite");

        handle_session_command(
            SessionCommands::Create {
                app: "app1".into(),
                user: "u1".into(),
                id: Some("s1".into()),
                state: Some(r#"{"x": 1}"#.into()),
            },
            &config,
        )
        .await
        .unwrap();

        let service = create_session_service(&config).await.unwrap();
        let key = SessionKey::new("app1", "u1", "s1");
        let session = service.get_session(&key, None).await.unwrap();
        assert_eq!(session.get_state("x"), Some(serde_json::json!(1)));

        // Without --yes nothing is deleted.
        handle_session_command(
            SessionCommands::Delete {
                app: "app1".into(),
                user: "u1".into(),
                id: "s1".into(),
                yes: false,
            },
            &config,
        )
        .await
        .unwrap();
        assert!(service.get_session(&key, None).await.is_ok());

        handle_session_command(
            SessionCommands::Delete {
                app: "app1".into(),
                user: "u1".into(),
                id: "s1".into(),
                yes: true,
            },
            &config,
        )
        .await
        .unwrap();
        assert!(service
            .get_session(&key, None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn cli_handler_rejects_non_object_state() {
        let tmp = TempDir::new().unwrap();
        let err = handle_session_command(
            SessionCommands::Create {
                app: "app1".into(),
                user: "u1".into(),
                id: None,
                state: Some("[1, 2]".into()),
            },
            &config_in(&tmp, "memory"),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("--state"));
    }

    #[tokio::test]
    async fn cli_handler_reports_missing_session() {
        let tmp = TempDir::new().unwrap();
        let err = handle_session_command(
            SessionCommands::Show {
                app: "app1".into(),
                user: "u1".into(),
                id: "nope".into(),
                recent: None,
                after: None,
            },
            &config_in(&tmp, "sqlite"),
        )
        .await
        .unwrap_err();
        let session_err = err.downcast_ref::<SessionError>().unwrap();
        assert!(session_err.is_not_found());
    }
}
