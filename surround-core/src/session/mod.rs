//! Client session
//!
//! The entry point for applications: join a room, keep the clock in sync and
//! play along.

mod handlers;
#[allow(clippy::module_inception)]
mod session;
mod types;

pub use session::Session;
pub use types::{SessionCallback, SessionConfig, SessionError};
