//! Infrastructure layer: everything that touches the OS.
//!
//! Contains the hub transport (character device, lock-file watch, delivery
//! thread), TOML configuration storage, and the runtime that plugs the
//! transport into the application-layer session engine.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `nanohub_core`, but MUST NOT be imported by the `application` layer.

pub mod runtime;
pub mod storage;
pub mod transport;
