#![no_main]

use libfuzzer_sys::fuzz_target;
use waypoint_types::{BundleIdentity, Package};

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(package) = serde_json::from_str::<Package>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&package) {
            if let Ok(parsed) = serde_json::from_str::<Package>(&roundtripped) {
                assert_eq!(package.id, parsed.id);
                assert_eq!(package.per_machine, parsed.per_machine);
                assert_eq!(package.payload_refs.len(), parsed.payload_refs.len());
            }
        }
    }

    if let Ok(identity) = serde_json::from_str::<BundleIdentity>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&identity) {
            if let Ok(parsed) = serde_json::from_str::<BundleIdentity>(&roundtripped) {
                assert_eq!(identity.id, parsed.id);
                assert_eq!(identity.per_machine, parsed.per_machine);
            }
        }
    }
});
