#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;
use waypoint_state::{state_path, StateStore};

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    if fs::write(state_path(td.path()), data).is_ok() {
        let _ = StateStore::new(td.path()).load();
    }
});
