//! Network transport for the update client.

pub mod session;

pub use session::{RetryPolicy, UpdateClient};
