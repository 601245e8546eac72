#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;
use waypoint_lock::{lock_path, read_lock_info};

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    if fs::write(lock_path(td.path()), data).is_ok() {
        let _ = read_lock_info(td.path());
    }
});
