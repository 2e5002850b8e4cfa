//! Session Manager parsing
//!
//! Pure parsers for the text `iscsiadm` prints, plus the udev device path
//! a logged-in LUN shows up under.

use crate::domain::types::{DiscoveredTarget, Session};
use tracing::debug;

/// Transport assumed when the iface does not name one
pub const DEFAULT_TRANSPORT: &str = "tcp";

const TRANSPORT_KEY: &str = "iface.transport_name";
const BY_PATH_DIR: &str = "/dev/disk/by-path";

// =============================================================================
// Sessions
// =============================================================================

/// Parse `iscsiadm -m session` output
///
/// Expected lines look like
/// `tcp: [1] 192.168.1.107:3260,1 iqn.2010-10.org.openstack:volume-x`.
/// Lines with fewer than four fields, or whose IQN has no colon, are skipped.
pub fn parse_sessions(output: &str) -> Vec<Session> {
    output.lines().filter_map(parse_session_line).collect()
}

fn parse_session_line(line: &str) -> Option<Session> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        if !line.trim().is_empty() {
            debug!("Ignoring session line with {} fields: {}", fields.len(), line);
        }
        return None;
    }

    let target_iqn = fields[3];
    let short_name = match target_iqn.split_once(':') {
        Some((_, name)) => name,
        None => {
            debug!("Ignoring session with malformed IQN: {}", line);
            return None;
        }
    };

    let protocol = fields[0].split(':').next().unwrap_or_default();
    let id = fields[1]
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .unwrap_or_default();
    let portal = fields[2].split(',').next().unwrap_or_default();

    Some(Session {
        protocol: protocol.to_string(),
        id,
        portal: portal.to_string(),
        target_iqn: target_iqn.to_string(),
        short_name: short_name.to_string(),
    })
}

// =============================================================================
// SendTargets Discovery
// =============================================================================

/// Parse SendTargets discovery output: `<ip:port>,<tpgt> <iqn>` per line
pub fn parse_discovery(output: &str) -> Vec<DiscoveredTarget> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let address = fields.next()?;
            let target_iqn = fields.next()?;

            let (portal, portal_group_tag) = match address.rsplit_once(',') {
                Some((portal, tag)) => (portal, tag.parse().ok()),
                None => (address, None),
            };

            Some(DiscoveredTarget {
                portal: portal.to_string(),
                portal_group_tag,
                target_iqn: target_iqn.to_string(),
            })
        })
        .collect()
}

// =============================================================================
// Ifaces and Device Paths
// =============================================================================

/// Pull the transport out of `iscsiadm -m iface -I <iface> -o show`
///
/// Missing, blank and `<empty>` values all mean [`DEFAULT_TRANSPORT`].
pub fn extract_transport_name(iface_show: &str) -> String {
    let value = iface_show.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == TRANSPORT_KEY).then(|| value.trim())
    });

    match value {
        Some(v) if !v.is_empty() && v != "<empty>" => v.to_string(),
        _ => DEFAULT_TRANSPORT.to_string(),
    }
}

/// Where udev links the LUN once the session is up
///
/// Offloaded transports prefix the PCI address of the HBA, so the result is
/// a glob pattern for anything but tcp.
pub fn device_path_for(portal: &str, target_iqn: &str, lun: i32, transport: &str) -> String {
    if transport == DEFAULT_TRANSPORT {
        format!("{}/ip-{}-iscsi-{}-lun-{}", BY_PATH_DIR, portal, target_iqn, lun)
    } else {
        format!("{}/pci-*-ip-{}-iscsi-{}-lun-{}", BY_PATH_DIR, portal, target_iqn, lun)
    }
}
