//! Core of the bundle (chained-package installer) engine.
//!
//! A bundle drives `CoreDetect → CorePlan → CoreApply` over a manifest-described
//! set of packages, payloads, and containers, mirroring a WiX Burn-style
//! bootstrapper. This crate owns the parts of that pipeline that are not better
//! expressed as a standalone leaf crate:
//!
//! - [`variables`] — the process-wide Variables store and condition grammar (§4.1).
//! - [`container`] — the attached-container header and streaming cursor (§4.3).
//! - [`cache`] — the Cache Manager, orchestrating [`waypoint_storage`] and
//!   [`waypoint_fetch`] (§4.4).
//! - [`registration`] — Registration & Resume, orchestrating [`waypoint_state`],
//!   [`waypoint_store`], and [`waypoint_encrypt`] (§4.5).
//! - [`plan`] — the Planner (§4.6).
//! - [`executor`] — drives Apply: lock, cache worker, execute list, rollback (§4.7).
//! - [`elevation`] — the parent/child privilege-elevation channel (§4.8).
//! - [`session`] — session modes and the top-level `Core*` lifecycle (§4.9).
//!
//! Ambient concerns — configuration, retry/backoff, structured events, process
//! invocation, the exclusion lock, filesystem storage, payload fetch, and host
//! searches — live in their own `waypoint-*` crates and are re-exported here
//! under short names so callers of this crate see one coherent surface.

pub mod variables;
pub mod container;
pub mod cache;
pub mod registration;
pub mod plan;
pub mod executor;
pub mod elevation;
pub mod session;

pub use waypoint_config as config;
pub use waypoint_encrypt as encrypt;
pub use waypoint_events as events;
pub use waypoint_fetch as fetch;
pub use waypoint_lock as lock;
pub use waypoint_process as process;
pub use waypoint_retry as retry;
pub use waypoint_search as search;
pub use waypoint_state as state;
pub use waypoint_store as store;
pub use waypoint_storage as storage;
pub use waypoint_types as types;
