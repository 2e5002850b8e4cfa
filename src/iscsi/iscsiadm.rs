//! iscsiadm driver
//!
//! Typed wrappers over the open-iscsi control tool. Every call goes through
//! the [`CommandRunner`](crate::domain::ports::CommandRunner) port.

use crate::domain::ports::{CommandOutput, CommandRunnerRef};
use crate::domain::types::{DiscoveredTarget, Secrets, Session};
use crate::error::{Error, Result};
use crate::iscsi::session::{parse_discovery, parse_sessions};
use tracing::{debug, info};

// =============================================================================
// Exit Codes
// =============================================================================

/// ISCSI_ERR_SESS_EXISTS
pub const EXIT_SESSION_EXISTS: i32 = 15;
/// ISCSI_ERR_NO_OBJS_FOUND
pub const EXIT_NO_OBJECTS: i32 = 21;

const REDACTED: &str = "<redacted>";

fn to_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn node_args(target_iqn: &str, portal: &str) -> Vec<String> {
    to_args(&["-m", "node", "-T", target_iqn, "-p", portal])
}

/// Render a command line with CHAP passwords masked
fn render(program: &str, args: &[String]) -> String {
    let mut rendered = vec![program.to_string()];
    let mut mask_next_value = false;
    let mut previous = "";
    for arg in args {
        if previous == "-n" {
            mask_next_value = arg.contains("password");
        }
        if previous == "-v" && mask_next_value {
            rendered.push(REDACTED.to_string());
            mask_next_value = false;
        } else {
            rendered.push(arg.clone());
        }
        previous = arg.as_str();
    }
    rendered.join(" ")
}

/// Append `-n <name> -v <value>` pairs
fn push_settings(args: &mut Vec<String>, settings: &[(String, &str)]) {
    for (name, value) in settings {
        args.extend(to_args(&["-n", name.as_str(), "-v", *value]));
    }
}

/// CHAP settings under `prefix` (`node.session.auth` or
/// `discovery.sendtargets.auth`); mutual credentials only when a
/// `username_in` is set
fn chap_settings<'a>(prefix: &str, secrets: &'a Secrets) -> Vec<(String, &'a str)> {
    let mut settings = vec![
        (format!("{}.authmethod", prefix), "CHAP"),
        (format!("{}.username", prefix), secrets.username.as_str()),
        (format!("{}.password", prefix), secrets.password.as_str()),
    ];
    if !secrets.username_in.is_empty() {
        settings.push((format!("{}.username_in", prefix), secrets.username_in.as_str()));
        settings.push((format!("{}.password_in", prefix), secrets.password_in.as_str()));
    }
    settings
}

// =============================================================================
// Iscsiadm
// =============================================================================

/// Handle on the `iscsiadm` executable
#[derive(Clone)]
pub struct Iscsiadm {
    runner: CommandRunnerRef,
    program: String,
}

impl Iscsiadm {
    pub fn new(runner: CommandRunnerRef, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    /// Run and capture, whatever the exit status
    ///
    /// Only a spawn failure is an error here.
    async fn exec(&self, args: &[String]) -> Result<CommandOutput> {
        let command = render(&self.program, args);
        debug!("Running {}", command);
        self.runner
            .run(&self.program, args)
            .await
            .map_err(|e| Error::command(command, None, e.to_string()))
    }

    /// Run and require a zero exit status
    async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        let output = self.exec(args).await?;
        if output.is_success() {
            return Ok(output);
        }
        Err(Error::command(
            render(&self.program, args),
            output.status,
            output.combined().trim(),
        ))
    }

    /// `iscsiadm --version`
    pub async fn version(&self) -> Result<String> {
        let output = self.run(&to_args(&["--version"])).await?;
        Ok(output.stdout.trim().to_string())
    }

    /// `iscsiadm -m iface -I <iface> -o show`
    pub async fn show_iface(&self, iface: &str) -> Result<String> {
        let output = self.run(&to_args(&["-m", "iface", "-I", iface, "-o", "show"])).await?;
        Ok(output.stdout)
    }

    /// Active sessions; "no sessions" (exit 21) is an empty list
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let args = to_args(&["-m", "session"]);
        let output = self.exec(&args).await?;
        match output.status {
            Some(0) => Ok(parse_sessions(&output.stdout)),
            Some(EXIT_NO_OBJECTS) => {
                debug!("No active iSCSI sessions");
                Ok(Vec::new())
            }
            status => Err(Error::command(
                render(&self.program, &args),
                status,
                output.combined().trim(),
            )),
        }
    }

    /// Is there a session to `target_iqn` through exactly `portal`
    pub async fn session_exists(&self, portal: &str, target_iqn: &str) -> Result<bool> {
        let sessions = self.list_sessions().await?;
        Ok(sessions
            .iter()
            .any(|s| s.target_iqn == target_iqn && s.portal == portal))
    }

    /// Sessions to `target_iqn` through any portal
    pub async fn sessions_for_target(&self, target_iqn: &str) -> Result<Vec<Session>> {
        let sessions = self.list_sessions().await?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.target_iqn == target_iqn)
            .collect())
    }

    /// Create the node record for `target_iqn` at `portal` bound to `iface`
    pub async fn new_node(&self, target_iqn: &str, portal: &str, iface: &str) -> Result<()> {
        let mut args = node_args(target_iqn, portal);
        args.extend(to_args(&["-I", iface, "-o", "new"]));
        let output = self.run(&args).await?;
        debug!("New node record: {}", output.stdout.trim());
        Ok(())
    }

    /// Store session CHAP credentials on the node record
    pub async fn update_chap(&self, target_iqn: &str, portal: &str, secrets: &Secrets) -> Result<()> {
        let mut args = node_args(target_iqn, portal);
        args.extend(to_args(&["-o", "update"]));
        push_settings(&mut args, &chap_settings("node.session.auth", secrets));
        self.run(&args).await.map(|_| ())
    }

    /// Log in; an already established session counts as success
    pub async fn login(&self, target_iqn: &str, portal: &str) -> Result<()> {
        let mut args = node_args(target_iqn, portal);
        args.push("-l".to_string());
        match self.run(&args).await {
            Err(e) if e.exit_status() == Some(EXIT_SESSION_EXISTS) => {
                info!("Session to {} via {} already exists", target_iqn, portal);
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    pub async fn logout(&self, target_iqn: &str, portal: &str) -> Result<()> {
        let mut args = node_args(target_iqn, portal);
        args.push("-u".to_string());
        self.run(&args).await.map(|_| ())
    }

    /// Remove every node record for `target_iqn`
    pub async fn delete_node(&self, target_iqn: &str) -> Result<()> {
        let args = to_args(&["-m", "node", "-T", target_iqn, "-o", "delete"]);
        self.run(&args).await.map(|_| ())
    }

    /// SendTargets discovery against `portal`
    ///
    /// With credentials, the discovery record is created and given CHAP
    /// settings before discovering through it.
    pub async fn discover(&self, portal: &str, secrets: Option<&Secrets>) -> Result<Vec<DiscoveredTarget>> {
        let output = match secrets.filter(|s| !s.username.is_empty()) {
            None => {
                self.run(&to_args(&["-m", "discovery", "-t", "sendtargets", "-p", portal]))
                    .await?
            }
            Some(secrets) => {
                let base = to_args(&["-m", "discoverydb", "-t", "sendtargets", "-p", portal]);

                let mut args = base.clone();
                args.extend(to_args(&["-o", "new"]));
                self.run(&args).await?;

                let mut args = base.clone();
                args.extend(to_args(&["-o", "update"]));
                push_settings(&mut args, &chap_settings("discovery.sendtargets.auth", secrets));
                self.run(&args).await?;

                let mut args = base;
                args.push("--discover".to_string());
                self.run(&args).await?
            }
        };

        let targets = parse_discovery(&output.stdout);
        debug!("Discovered {} targets at {}", targets.len(), portal);
        Ok(targets)
    }
}
