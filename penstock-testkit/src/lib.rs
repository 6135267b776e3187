//! Test doubles and helpers shared by penstock's integration tests.

pub mod handlers;
pub mod mock;
pub mod queue;

pub use handlers::*;
pub use mock::*;
pub use queue::*;
