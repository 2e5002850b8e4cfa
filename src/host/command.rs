//! OS-backed command runner

use crate::domain::ports::{CommandOutput, CommandRunner};
use async_trait::async_trait;
use std::io;
use tokio::process::Command;
use tracing::debug;

/// [`CommandRunner`] spawning real processes through tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct OsCommandRunner;

impl OsCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for OsCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output().await?;

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!("{} {:?} exited with {:?}", program, args, result.status);

        Ok(result)
    }
}
