//! Host Adapters
//!
//! Implementations of the [`crate::domain::ports`] traits: the real OS
//! (`std::fs`, `glob`, `tokio::process`) and an in-memory host for tests.

pub mod command;
pub mod fake;
pub mod fs;

pub use command::OsCommandRunner;
pub use fake::{FakeCommandRunner, FakeDeviceFs, RecordedCall};
pub use fs::OsDeviceFs;
