//! Integration tests for the zonal gateway
//!
//! End-to-end tests that exercise the full stack below the socket layer:
//! - DoIP framing and routing activation
//! - UDS dispatch and the download service trio
//! - Container validation, bank installs and zone handoff
//!
//! The gateway core performs no I/O of its own, so the tests drive it the
//! way the daemon does: encoded frames go in as link events, and the
//! returned effects carry the response bytes back out.
//!
//! # Test Structure
//!
//! - `update_e2e_test.rs` - Full update flows over encoded DoIP frames
//! - `persistence_test.rs` - File-backed flash, boot markers and the
//!   shipped sample configuration

// This crate only contains tests, no library code
