#![no_main]

use libfuzzer_sys::fuzz_target;
use waypoint_encrypt::{decrypt, encrypt};

fuzz_target!(|data: &[u8]| {
    let passphrase = "fuzz-passphrase";

    if let Ok(encrypted) = encrypt(data, passphrase) {
        if let Ok(encrypted_str) = std::str::from_utf8(&encrypted) {
            if let Ok(decrypted) = decrypt(encrypted_str, passphrase) {
                assert_eq!(data.to_vec(), decrypted);
            }
        }
    }
});
