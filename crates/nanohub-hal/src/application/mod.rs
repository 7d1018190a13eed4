//! Application layer: the system-app session engine.
//!
//! # What lives here? (for beginners)
//!
//! This layer knows the firmware-management protocol but nothing about how
//! bytes reach the hub.  Every outbound write and every upstream delivery goes
//! through the [`link::HubLink`] trait, so the whole engine runs in tests
//! without a device or threads.
//!
//! # Sub-modules
//!
//! - **`link`** – the `HubLink` port, the `HubRequest` envelope, and a
//!   recording implementation for scripted tests.
//! - **`session`** – shared life-cycle (`SessionCore`), session keys, and the
//!   `SessionError` type.
//! - **`app_info`**, **`mem_info`**, **`key_info`**, **`app_mgmt`** – the
//!   four concrete sessions.
//! - **`session_manager`** – at most one live session per key; fans response
//!   frames out to live sessions; reboot broadcast.
//! - **`system_comm`** – routes client requests to sessions and device frames
//!   to the manager.

pub mod app_info;
pub mod app_mgmt;
pub mod key_info;
pub mod link;
pub mod mem_info;
pub mod session;
pub mod session_manager;
pub mod system_comm;
