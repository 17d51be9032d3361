//! REST API over the broker, database and order executor.

mod server;

pub use server::{serve, AppState};
