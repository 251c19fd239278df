//! Multi-server session core.
//!
//! Owns one live session per configured server, classifies channel
//! visibility from each join snapshot, reconciles the incremental and
//! absolute unread feeds into a single per-server counter, and exposes the
//! aggregate `{online, unread}` map for a UI layer to render.

pub mod permissions;
pub mod readstate;
pub mod session;
pub mod store;

pub use session::{ConnectionState, ServerConfig, SessionManager};
pub use store::{FileStore, ServerStore};
