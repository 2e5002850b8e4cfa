//! Domain Types - attach requests and the values produced while serving them

use crate::error::Error;
use serde::{Deserialize, Serialize};

// =============================================================================
// Fibre Channel Target
// =============================================================================

/// Fibre Channel attach request
///
/// WWNs take priority over WWIDs when both are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FcTarget {
    pub volume_name: String,
    pub target_wwns: Vec<String>,
    pub wwids: Vec<String>,
    pub lun: String,
}

impl FcTarget {
    /// Target addressed by WWNs and a LUN
    pub fn with_wwns<I, S>(wwns: I, lun: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_wwns: wwns.into_iter().map(Into::into).collect(),
            lun: lun.into(),
            ..Default::default()
        }
    }

    /// Target addressed by SCSI WWIDs
    pub fn with_wwids<I, S>(wwids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            wwids: wwids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Identifiers to search, in priority order
    pub fn identifiers(&self) -> TargetIdentifiers<'_> {
        if !self.target_wwns.is_empty() {
            TargetIdentifiers::Wwns {
                wwns: &self.target_wwns,
                lun: &self.lun,
            }
        } else {
            TargetIdentifiers::Wwids(&self.wwids)
        }
    }

    /// Normalized key used to serialize operations against this target
    pub fn lock_key(&self) -> String {
        let mut ids: Vec<String> = match self.identifiers() {
            TargetIdentifiers::Wwns { wwns, .. } => wwns.to_vec(),
            TargetIdentifiers::Wwids(wwids) => wwids.to_vec(),
        };
        for id in ids.iter_mut() {
            *id = id.to_lowercase();
        }
        ids.sort();
        format!("fc:{}:lun-{}", ids.join(","), self.lun)
    }
}

impl std::fmt::Display for FcTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.identifiers() {
            TargetIdentifiers::Wwns { wwns, lun } => {
                write!(f, "wwns [{}] lun {}", wwns.join(", "), lun)
            }
            TargetIdentifiers::Wwids(wwids) => write!(f, "wwids [{}]", wwids.join(", ")),
        }
    }
}

/// How a Fibre Channel disk is looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetIdentifiers<'a> {
    /// Substring match under `/dev/disk/by-path`
    Wwns { wwns: &'a [String], lun: &'a str },
    /// Exact `scsi-<wwid>` match under `/dev/disk/by-id`
    Wwids(&'a [String]),
}

// =============================================================================
// iSCSI Target
// =============================================================================

/// iSCSI authentication method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Chap,
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthType::None => write!(f, "none"),
            AuthType::Chap => write!(f, "chap"),
        }
    }
}

impl std::str::FromStr for AuthType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(AuthType::None),
            "chap" => Ok(AuthType::Chap),
            other => Err(Error::Configuration(format!("Unknown auth type: {}", other))),
        }
    }
}

/// CHAP credentials
///
/// `*_in` are the mutual-CHAP credentials the target presents back.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Secrets {
    pub username: String,
    pub password: String,
    pub username_in: String,
    pub password_in: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("username_in", &self.username_in)
            .field("password_in", &"<redacted>")
            .finish()
    }
}

/// iSCSI attach request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IscsiTarget {
    pub volume_name: String,
    pub target_iqn: String,
    pub portals: Vec<String>,
    pub auth_type: AuthType,
    pub discovery_secrets: Secrets,
    pub session_secrets: Secrets,
    /// iSCSI iface name, empty means the configured default
    pub iface: String,
    pub lun: i32,
    pub multipath: bool,
}

impl IscsiTarget {
    pub fn new<I, S>(target_iqn: impl Into<String>, portals: I, lun: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_iqn: target_iqn.into(),
            portals: portals.into_iter().map(Into::into).collect(),
            lun,
            ..Default::default()
        }
    }

    /// Normalized key used to serialize operations against this target
    pub fn lock_key(&self) -> String {
        format!("iscsi:{}", self.target_iqn.to_lowercase())
    }
}

// =============================================================================
// Search Results
// =============================================================================

/// Outcome of a device search
///
/// Both fields empty means nothing was found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLocation {
    /// Resolved SCSI device, e.g. `/dev/sdc`
    pub raw_device_path: Option<String>,
    /// Multipath aggregation device, e.g. `/dev/dm-2`
    pub multipath_device_path: Option<String>,
}

impl DeviceLocation {
    pub fn is_found(&self) -> bool {
        self.raw_device_path.is_some() || self.multipath_device_path.is_some()
    }

    /// The path callers should use: multipath when there is one
    pub fn preferred(&self) -> Option<&str> {
        self.multipath_device_path
            .as_deref()
            .or(self.raw_device_path.as_deref())
    }
}

/// One active initiator session, parsed from `iscsiadm -m session`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub protocol: String,
    pub id: i32,
    /// `ip:port`, without the target portal group tag
    pub portal: String,
    pub target_iqn: String,
    /// Part of the IQN after its first colon
    pub short_name: String,
}

/// Target returned by SendTargets discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredTarget {
    pub portal: String,
    pub portal_group_tag: Option<u32>,
    pub target_iqn: String,
}

// =============================================================================
// Detach Report
// =============================================================================

/// Outcome of detaching a set of SCSI devices
///
/// Every device is attempted; only the last failure is kept.
#[derive(Debug, Default)]
pub struct DetachReport {
    pub attempted: usize,
    pub failed: usize,
    pub last_error: Option<Error>,
}

impl DetachReport {
    pub fn record(&mut self, outcome: Result<(), Error>) {
        self.attempted += 1;
        if let Err(e) = outcome {
            self.failed += 1;
            self.last_error = Some(e);
        }
    }

    /// Collapse into a result, surfacing the last error with the counts
    pub fn into_result(self) -> Result<usize, Error> {
        match self.last_error {
            None => Ok(self.attempted),
            Some(last) => Err(Error::DetachFailed {
                attempted: self.attempted,
                failed: self.failed,
                last: Box::new(last),
            }),
        }
    }
}
