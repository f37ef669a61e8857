#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_wraps,
    dead_code
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod sessions;

pub use config::Config;

/// Session management subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommands {
    /// List a user's sessions (metadata only)
    List {
        /// Application name
        #[arg(long)]
        app: String,
        /// User ID
        #[arg(long)]
        user: String,
    },
    /// Print a session with its state and events as JSON
    #[command(long_about = "\
Print a session with its state and events as JSON.

Use --recent to keep only the last N events and --after to keep only \
events strictly newer than an RFC 3339 timestamp. Both filters may be \
combined; the timestamp filter applies first.

Examples:
  sessionvault sessions show --app chat --user alice --id s1
  sessionvault sessions show --app chat --user alice --id s1 --recent 10
  sessionvault sessions show --app chat --user alice --id s1 --after 2026-01-01T00:00:00Z")]
    Show {
        #[arg(long)]
        app: String,
        #[arg(long)]
        user: String,
        /// Session ID
        #[arg(long)]
        id: String,
        /// Keep only the most recent N events (0 keeps all)
        #[arg(long)]
        recent: Option<usize>,
        /// Keep only events after this RFC 3339 timestamp
        #[arg(long)]
        after: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Print a session's events as JSON
    Events {
        #[arg(long)]
        app: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: String,
    },
    /// Create a session, optionally with an explicit ID and initial state
    Create {
        #[arg(long)]
        app: String,
        #[arg(long)]
        user: String,
        /// Session ID (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Initial state as a JSON object
        #[arg(long)]
        state: Option<String>,
    },
    /// Delete a session and its events
    Delete {
        #[arg(long)]
        app: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: String,
        /// Skip confirmation
        #[arg(long)]
        yes: bool,
    },
}
