//! HTTP payload fetching for the Cache Manager's `download`-packaged payloads.
//!
//! `spec.md` §3 and §4.4: a [`Payload`](waypoint_types::Payload) with
//! `packaging: Download` has no local container to extract from — the Cache
//! Manager fetches it over HTTP into the working directory as
//! `<payload>.unverified`, then hands the file to `complete_payload` for
//! hash/signature verification. This crate owns the HTTP leg: streaming the
//! response to disk with a progress callback, and a hash check fast enough
//! to short-circuit a second full read in `complete_payload`.
//!
//! # Example
//!
//! ```no_run
//! use waypoint_fetch::{fetch_to_file, FetchOptions};
//! use std::path::Path;
//!
//! let outcome = fetch_to_file(
//!     "https://example.com/payload.msi",
//!     Path::new("/var/cache/waypoint/work/payload.msi.unverified"),
//!     &FetchOptions::default(),
//!     |_bytes_so_far, _total| {},
//! ).expect("fetch");
//! assert!(outcome.bytes_written > 0 || outcome.bytes_written == 0);
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Default timeout for a single HTTP request.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// User agent sent with every fetch request.
pub const USER_AGENT: &str = concat!("waypoint/", env!("CARGO_PKG_VERSION"));

/// Tuning for a single [`fetch_to_file`] call.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    /// Expected SHA-256 hash, hex-encoded, if known ahead of time. When
    /// present, a mismatch is reported in [`FetchOutcome::hash_matched`]
    /// rather than as an error, so the caller can decide retry-vs-abort.
    pub expected_sha256: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS), expected_sha256: None }
    }
}

/// Outcome of a completed fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub bytes_written: u64,
    pub sha256: String,
    /// `None` if no expected hash was supplied.
    pub hash_matched: Option<bool>,
}

/// Stream `url` to `dest_path`, calling `on_progress(bytes_so_far, total_bytes)`
/// as chunks arrive. `total_bytes` is `None` when the server omits
/// `Content-Length`. The destination's parent directory must already exist —
/// callers are expected to have called `ensure_working_folder` first.
pub fn fetch_to_file(
    url: &str,
    dest_path: &Path,
    options: &FetchOptions,
    mut on_progress: impl FnMut(u64, Option<u64>),
) -> Result<FetchOutcome> {
    let client = reqwest::blocking::Client::builder()
        .timeout(options.timeout)
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build HTTP client")?;

    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to send download request to {url}"))?;

    if !response.status().is_success() {
        anyhow::bail!("download failed with status {} for {url}", response.status());
    }

    let total_bytes = response.content_length();

    let mut file = File::create(dest_path)
        .with_context(|| format!("failed to create destination file {}", dest_path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut bytes_written: u64 = 0;

    loop {
        let n = response.read(&mut buf).context("failed to read from download stream")?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .with_context(|| format!("failed to write to {}", dest_path.display()))?;
        hasher.update(&buf[..n]);
        bytes_written += n as u64;
        on_progress(bytes_written, total_bytes);
    }

    file.sync_all().context("failed to flush destination file")?;

    let sha256 = hex_encode(&hasher.finalize());
    let hash_matched =
        options.expected_sha256.as_ref().map(|expected| expected.eq_ignore_ascii_case(&sha256));

    Ok(FetchOutcome { bytes_written, sha256, hash_matched })
}

/// Compute the SHA-256 of an existing file, used when re-verifying a cached
/// payload without re-downloading it.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open file {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn sha256_file_matches_known_vector() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("sample.bin");
        std::fs::write(&path, b"hello world").expect("write");

        let hash = sha256_file(&path).expect("hash");
        assert_eq!(hash, "b94d27b9934d3e08a52e52d7da7dacefbd9ea866d3935727dd1cccb6ce0c0c1f");
    }

    #[test]
    fn fetch_options_default_has_no_expected_hash() {
        let opts = FetchOptions::default();
        assert!(opts.expected_sha256.is_none());
        assert_eq!(opts.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn hex_encode_matches_sha256_of_empty_input() {
        let hasher = Sha256::new();
        let hash = hex_encode(&hasher.finalize());
        assert_eq!(hash, "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }

    #[test]
    fn user_agent_includes_version() {
        assert!(USER_AGENT.starts_with("waypoint/"));
        assert!(USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn sha256_file_missing_is_error() {
        let td = tempdir().expect("tempdir");
        let result = sha256_file(&td.path().join("missing.bin"));
        assert!(result.is_err());
    }

    #[test]
    fn sha256_file_empty_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("empty.bin");
        File::create(&path).expect("create").flush().expect("flush");

        let hash = sha256_file(&path).expect("hash");
        assert_eq!(hash, "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }
}
