//! Fuzz target for request and config parsing.
//!
//! Tests that arbitrary bytes don't cause panics when parsed as API bodies,
//! push frames or YAML config.

#![no_main]

use libfuzzer_sys::fuzz_target;
use logview::config::Config;
use logview::protocol::{CommandRequest, PushMessage, StartRequest, StopRequest};

fuzz_target!(|data: &[u8]| {
    // Request bodies as they arrive over HTTP - should not panic
    let _ = serde_json::from_slice::<StartRequest>(data);
    let _ = serde_json::from_slice::<StopRequest>(data);
    let _ = serde_json::from_slice::<CommandRequest>(data);
    let _ = serde_json::from_slice::<PushMessage>(data);

    // Config files are text
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = Config::from_yaml(s);
    }
});
