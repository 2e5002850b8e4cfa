//! block-connectors CLI
//!
//! Thin command-line front end over the library: attach or detach a Fibre
//! Channel or iSCSI volume on this node and print the resulting device.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use block_connectors::{
    AuthType, ConnectorConfig, FcConnector, FcTarget, IscsiConnector, IscsiTarget,
    OsCommandRunner, OsDeviceFs, Secrets, TargetLocks,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Attach and detach Fibre Channel and iSCSI block devices
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Connector configuration file (YAML)
    #[arg(long, env = "BLOCK_CONNECTORS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// iSCSI volumes
    #[command(subcommand)]
    Iscsi(IscsiCommand),

    /// Fibre Channel volumes
    #[command(subcommand)]
    Fc(FcCommand),
}

#[derive(Subcommand, Debug)]
enum IscsiCommand {
    /// Log in to the target and print the device path
    Connect(IscsiTargetArgs),

    /// Detach the device, log out, and delete the node records
    Disconnect {
        #[command(flatten)]
        target: IscsiTargetArgs,

        /// Device to remove from the SCSI subsystem first
        #[arg(long)]
        device: Option<String>,
    },

    /// List active sessions
    Sessions {
        /// Only sessions to this IQN
        #[arg(long)]
        iqn: Option<String>,

        /// Print JSON instead of one line per session
        #[arg(long)]
        json: bool,
    },

    /// SendTargets discovery against a portal
    Discover {
        #[arg(long)]
        portal: String,

        /// Discovery CHAP username
        #[arg(long, env = "ISCSI_DISCOVERY_USERNAME")]
        chap_username: Option<String>,

        /// Discovery CHAP password
        #[arg(long, env = "ISCSI_DISCOVERY_PASSWORD", hide_env_values = true)]
        chap_password: Option<String>,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct IscsiTargetArgs {
    /// Target request file (YAML), used instead of the flags below
    #[arg(long, conflicts_with_all = ["iqn", "portals"])]
    request: Option<PathBuf>,

    /// Target IQN
    #[arg(long, required_unless_present = "request")]
    iqn: Option<String>,

    /// Target portal, ip:port (repeatable)
    #[arg(long = "portal", required_unless_present = "request")]
    portals: Vec<String>,

    #[arg(long, default_value_t = 0)]
    lun: i32,

    /// iSCSI iface, defaults to the configured one
    #[arg(long, default_value = "")]
    iface: String,

    /// Collapse to the multipath device when there is one
    #[arg(long)]
    multipath: bool,

    /// Session CHAP username
    #[arg(long, env = "ISCSI_CHAP_USERNAME")]
    chap_username: Option<String>,

    /// Session CHAP password
    #[arg(long, env = "ISCSI_CHAP_PASSWORD", hide_env_values = true)]
    chap_password: Option<String>,
}

impl IscsiTargetArgs {
    fn into_target(self) -> anyhow::Result<IscsiTarget> {
        if let Some(path) = &self.request {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            return serde_yaml::from_str(&contents)
                .with_context(|| format!("parsing {}", path.display()));
        }

        let mut target = IscsiTarget::new(self.iqn.unwrap_or_default(), self.portals, self.lun);
        target.iface = self.iface;
        target.multipath = self.multipath;
        if let Some(username) = self.chap_username {
            target.auth_type = AuthType::Chap;
            target.session_secrets = Secrets {
                username,
                password: self.chap_password.unwrap_or_default(),
                ..Default::default()
            };
        }
        Ok(target)
    }
}

#[derive(Subcommand, Debug)]
enum FcCommand {
    /// Locate the LUN and print the device path
    Connect(FcTargetArgs),

    /// Remove the SCSI devices behind a device path
    Disconnect {
        #[command(flatten)]
        target: FcTargetArgs,

        #[arg(long)]
        device: String,
    },
}

#[derive(Args, Debug)]
struct FcTargetArgs {
    /// Target port WWN (repeatable)
    #[arg(long = "wwn")]
    wwns: Vec<String>,

    /// SCSI WWID (repeatable), used when no WWN is given
    #[arg(long = "wwid")]
    wwids: Vec<String>,

    #[arg(long, default_value = "0")]
    lun: String,
}

impl FcTargetArgs {
    fn into_target(self) -> anyhow::Result<FcTarget> {
        if self.wwns.is_empty() && self.wwids.is_empty() {
            anyhow::bail!("at least one --wwn or --wwid is required");
        }
        Ok(FcTarget {
            target_wwns: self.wwns,
            wwids: self.wwids,
            lun: self.lun,
            ..Default::default()
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli);

    let config = match &cli.config {
        Some(path) => ConnectorConfig::from_yaml_file(path)?,
        None => ConnectorConfig::default(),
    };
    debug!("Version {}, config: {:?}", block_connectors::VERSION, config);

    let fs = Arc::new(OsDeviceFs::new());
    let locks = TargetLocks::new();

    match cli.command {
        Command::Iscsi(command) => {
            let connector = IscsiConnector::new(config, fs, Arc::new(OsCommandRunner::new()))
                .with_locks(locks);
            run_iscsi(&connector, command).await
        }
        Command::Fc(command) => {
            let connector = FcConnector::new(fs).with_locks(locks);
            run_fc(&connector, command).await
        }
    }
}

async fn run_iscsi(connector: &IscsiConnector, command: IscsiCommand) -> anyhow::Result<()> {
    match command {
        IscsiCommand::Connect(args) => {
            let target = args.into_target()?;
            let device = connector.connect(&target).await?;
            println!("{}", device);
        }
        IscsiCommand::Disconnect { target, device } => {
            let target = target.into_target()?;
            connector.disconnect(&target, device.as_deref()).await?;
            info!("Disconnected {}", target.target_iqn);
        }
        IscsiCommand::Sessions { iqn, json } => {
            let sessions = match iqn {
                Some(iqn) => connector.sessions_for_target(&iqn).await?,
                None => connector.sessions().await?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                for s in &sessions {
                    println!("{}: [{}] {} {}", s.protocol, s.id, s.portal, s.target_iqn);
                }
            }
        }
        IscsiCommand::Discover {
            portal,
            chap_username,
            chap_password,
            json,
        } => {
            let secrets = chap_username.map(|username| Secrets {
                username,
                password: chap_password.unwrap_or_default(),
                ..Default::default()
            });
            let targets = connector.discover_targets(&portal, secrets.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&targets)?);
            } else {
                for t in &targets {
                    println!("{} {}", t.portal, t.target_iqn);
                }
            }
        }
    }
    Ok(())
}

async fn run_fc(connector: &FcConnector, command: FcCommand) -> anyhow::Result<()> {
    match command {
        FcCommand::Connect(args) => {
            let target = args.into_target()?;
            let device = connector.connect(&target).await?;
            println!("{}", device);
        }
        FcCommand::Disconnect { target, device } => {
            let target = target.into_target()?;
            let detached = connector.disconnect(&target, &device).await?;
            info!("Detached {} device(s) behind {}", detached, device);
        }
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr; stdout carries the device path
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
