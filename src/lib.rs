//! Workspace root crate.
//!
//! No runtime code lives here — the message-delivery core is split across
//! `crates/letschat-protocol`, `crates/letschat-sync`,
//! `services/letschat-server`, and `services/letschat-client`. This crate
//! only exists to host the end-to-end integration suite at
//! `tests/integration/letschat_e2e.rs`, which needs a package to attach its
//! `[[test]]` target and dev-dependencies to.
