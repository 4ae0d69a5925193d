//! Room Model
//!
//! Wire messages and room state shared by the server and clients.

mod protocol;
mod state;

pub use protocol::*;
pub use state::*;
