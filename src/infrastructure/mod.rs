//! Infrastructure Layer
//!
//! Process-wide concerns shared by every connection.

pub mod shutdown;

pub use shutdown::{shutdown_signal, ShutdownController, TaskGuard};
