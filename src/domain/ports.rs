//! Domain Ports - I/O boundary traits for the connectors
//!
//! Every effect the connectors have on the node goes through one of these
//! two traits: kernel-exposed filesystem namespaces (`/dev`, `/sys`) through
//! [`DeviceFs`] and the iSCSI initiator daemon through [`CommandRunner`].
//! Adapters in [`crate::host`] implement them for the real OS and for tests.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Device Filesystem Port
// =============================================================================

/// Port for the kernel device namespaces under `/dev` and `/sys`
pub trait DeviceFs: Send + Sync {
    /// List the entry names (not full paths) of a directory
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Resolve every symlink component and return the final path
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    /// Check that a path exists
    ///
    /// Returns an error of kind [`io::ErrorKind::NotFound`] when it does not.
    fn stat(&self, path: &Path) -> io::Result<()>;

    /// Expand a shell-style pattern into the sorted list of matching paths
    fn glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>>;

    /// Write `data` to a (sysfs control) file
    fn write(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()>;

    /// Read a whole file as UTF-8
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
}

// =============================================================================
// Command Runner Port
// =============================================================================

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, the way the initiator tools are usually read
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Port for running the initiator-control executable
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and capture its output
    ///
    /// An `Err` means the process could not be spawned at all; a non-zero
    /// exit is reported through [`CommandOutput::status`].
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DeviceFsRef = Arc<dyn DeviceFs>;
pub type CommandRunnerRef = Arc<dyn CommandRunner>;
