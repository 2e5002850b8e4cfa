//! Block Connectors - node-local FC and iSCSI attach
//!
//! Given Fibre Channel WWNs/WWIDs, or an iSCSI IQN plus portals, attach the
//! remote LUN to this node and hand back a local device path, collapsing
//! multipath aggregation into a single `dm-*` device. Disconnect tears the
//! same topology down again.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │          FcConnector         │   │        IscsiConnector        │
//! │  locate / detach             │   │  iface, sessions, login,     │
//! │                              │   │  wait for device, logout     │
//! └──────────────┬───────────────┘   └───────┬──────────────┬───────┘
//!                │                           │              │
//!   ┌────────────┴───────────────────────────┴──┐   ┌───────┴───────┐
//!   │ Discovery: DiskLocator, MultipathResolver, │   │   Iscsiadm    │
//!   │            ScsiSubsystem                   │   │               │
//!   └────────────────────┬──────────────────────┘   └───────┬───────┘
//!                        │                                  │
//!               ┌────────┴────────┐               ┌─────────┴────────┐
//!               │    DeviceFs     │               │  CommandRunner   │
//!               │  /dev, /sys     │               │  iscsiadm        │
//!               └─────────────────┘               └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`fc`]: Fibre Channel connector
//! - [`iscsi`]: iSCSI session management and connector
//! - [`discovery`]: Disk location, multipath resolution, rescan and detach
//! - [`domain`]: Core domain types and the I/O port traits
//! - [`host`]: OS and in-memory implementations of the ports
//! - [`config`]: Connector configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod fc;
pub mod host;
pub mod iscsi;
pub mod lock;
mod logging;

// Re-export commonly used types
pub use config::ConnectorConfig;

pub use discovery::{DiskLocator, MultipathResolver, ScsiSubsystem};

pub use domain::ports::{
    CommandOutput, CommandRunner, CommandRunnerRef, DeviceFs, DeviceFsRef,
};

pub use domain::types::{
    AuthType, DetachReport, DeviceLocation, DiscoveredTarget, FcTarget, IscsiTarget, Secrets,
    Session, TargetIdentifiers,
};

pub use error::{Error, Result};

pub use fc::FcConnector;

pub use host::{FakeCommandRunner, FakeDeviceFs, OsCommandRunner, OsDeviceFs};

pub use iscsi::IscsiConnector;

pub use lock::TargetLocks;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
