#![no_main]

use libfuzzer_sys::fuzz_target;
use sessionvault::sessions::{Event, Session, SessionSnapshot};

fuzz_target!(|data: &[u8]| {
    if let Ok(event) = serde_json::from_slice::<Event>(data) {
        let stored = event.without_temp_state();
        assert!(stored.actions.state_delta.keys().all(|k| !k.starts_with("temp:")));
        let _ = stored.is_final_response();
    }
    if let Ok(snapshot) = serde_json::from_slice::<SessionSnapshot>(data) {
        let session = Session::from_snapshot(snapshot);
        assert!(session.state_snapshot().keys().all(|k| !k.starts_with("temp:")));
        let _ = session.to_snapshot();
    }
});
