//! Pipeline stages for PDS download-and-convert.
//!
//! Each submodule implements one step. Keeping stages separate makes each
//! independently testable and lets the orchestrator in [`crate::process`]
//! swap a collaborator (e.g. a scripted [`source::RemoteSource`] in tests)
//! without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! cache ─miss─▶ source ──▶ sniff ──▶ fetch ──▶ gateway ──▶ cache
//! (lookup)     (prefix)   (classify) (resume)  (decode…encode) (commit)
//! ```
//!
//! 1. [`cache`]: URL fingerprint → committed artifact; atomic commit
//! 2. [`source`]: the network seam (probe and ranged streaming GET)
//! 3. [`sniff`]: pure classification of the detection window
//! 4. [`fetch`]: resumable download with [`retry`] backoff
//! 5. [`gateway`]: runs [`decode`], [`enhance`] and [`encode`] on the
//!    blocking pool and reports which stage failed

pub mod cache;
pub mod decode;
pub mod encode;
pub mod enhance;
pub mod fetch;
pub mod gateway;
pub mod retry;
pub mod sniff;
pub mod source;
