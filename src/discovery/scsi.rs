//! SCSI Subsystem Control
//!
//! Host rescans and device removal through the sysfs trigger files.

use crate::discovery::multipath::{is_multipath_name, MultipathResolver, DEV_DIR, SYSFS_BLOCK};
use crate::domain::ports::DeviceFsRef;
use crate::domain::types::DetachReport;
use crate::error::{Error, Result};
use std::io;
use std::path::Path;
use tracing::{debug, error, info, warn};

// =============================================================================
// Constants
// =============================================================================

const SCSI_HOST_CLASS: &str = "/sys/class/scsi_host";

/// Wildcard channel, target and LUN
const SCAN_ALL: &[u8] = b"- - -";
const DELETE_DEVICE: &[u8] = b"1";
const SYSFS_WRITE_MODE: u32 = 0o666;

// =============================================================================
// SCSI Subsystem
// =============================================================================

/// Rescan and detach operations on the local SCSI subsystem
#[derive(Clone)]
pub struct ScsiSubsystem {
    fs: DeviceFsRef,
    resolver: MultipathResolver,
}

impl ScsiSubsystem {
    pub fn new(fs: DeviceFsRef) -> Self {
        let resolver = MultipathResolver::new(fs.clone());
        Self { fs, resolver }
    }

    /// Ask every SCSI host adapter to rescan all channels, targets and LUNs
    ///
    /// Returns the number of hosts the scan was triggered on. Hosts whose
    /// trigger cannot be written are skipped.
    pub fn rescan_hosts(&self) -> usize {
        let hosts = match self.fs.read_dir(Path::new(SCSI_HOST_CLASS)) {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("Cannot list {}: {}", SCSI_HOST_CLASS, e);
                return 0;
            }
        };

        let mut triggered = 0;
        for host in &hosts {
            let scan = Path::new(SCSI_HOST_CLASS).join(host).join("scan");
            match self.fs.write(&scan, SCAN_ALL, SYSFS_WRITE_MODE) {
                Ok(()) => triggered += 1,
                Err(e) => warn!("Failed to trigger scan on {}: {}", host, e),
            }
        }

        info!("Triggered SCSI rescan on {} of {} hosts", triggered, hosts.len());
        triggered
    }

    /// Remove a single SCSI device such as `/dev/sdc` from the node
    pub fn detach_device(&self, device_path: &str) -> Result<()> {
        let prefix = format!("{}/", DEV_DIR);
        let name = match device_path.strip_prefix(&prefix) {
            Some(rest) => rest.rsplit('/').next().unwrap_or(rest),
            None => {
                return Err(Error::InvalidDevicePath {
                    path: device_path.to_string(),
                })
            }
        };
        if name.is_empty() {
            return Err(Error::InvalidDevicePath {
                path: device_path.to_string(),
            });
        }

        let delete = Path::new(SYSFS_BLOCK).join(name).join("device").join("delete");
        debug!("Removing {} from the SCSI subsystem via {}", name, delete.display());
        self.fs
            .write(&delete, DELETE_DEVICE, SYSFS_WRITE_MODE)
            .map_err(|e| {
                Error::Io(io::Error::new(
                    e.kind(),
                    format!("{}: {}", delete.display(), e),
                ))
            })
    }

    /// Detach every device in `devices`, carrying on past failures
    pub fn detach_devices(&self, devices: &[String]) -> DetachReport {
        let mut report = DetachReport::default();
        for device in devices {
            let outcome = self.detach_device(device);
            if let Err(e) = &outcome {
                error!("Detach failed for {}: {}", device, e);
            }
            report.record(outcome);
        }
        report
    }

    /// Detach whatever `device_path` resolves to
    ///
    /// A multipath device is torn down through each of its slaves; the
    /// `dm-*` node itself is left to device-mapper. Returns the number of
    /// devices detached, or [`Error::DetachFailed`] with the last failure.
    pub fn detach_path(&self, device_path: &str) -> Result<usize> {
        let canonical = self.resolver.resolve_canonical_device(device_path)?;
        let is_multipath = Path::new(&canonical)
            .file_name()
            .map(|n| is_multipath_name(&n.to_string_lossy()))
            .unwrap_or(false);

        let devices = if is_multipath {
            let slaves = self.resolver.list_slaves(&canonical);
            if slaves.is_empty() {
                warn!("Multipath device {} has no slaves to detach", canonical);
            }
            slaves
        } else {
            vec![canonical.clone()]
        };

        debug!(
            "Detaching {} (resolved {}): {:?}",
            device_path, canonical, devices
        );

        let report = self.detach_devices(&devices);
        if let Some(e) = &report.last_error {
            error!(
                "{} of {} devices failed to detach, last error: {}",
                report.failed, report.attempted, e
            );
        }
        report.into_result()
    }
}
