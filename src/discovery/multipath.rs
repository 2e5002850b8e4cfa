//! Multipath Resolution
//!
//! Walks from a SCSI device (or a udev symlink pointing at one) to the
//! device-mapper multipath device aggregating it, using the `slaves`
//! directories the kernel exposes under `/sys/block/dm-*`.

use crate::domain::ports::DeviceFsRef;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::{debug, trace};

// =============================================================================
// Constants
// =============================================================================

pub(crate) const SYSFS_BLOCK: &str = "/sys/block";
pub(crate) const DEV_DIR: &str = "/dev";

/// Name prefix of device-mapper (multipath) block devices
pub const MULTIPATH_PREFIX: &str = "dm-";

/// True for `dm-0`, `dm-12`, ...
pub fn is_multipath_name(name: &str) -> bool {
    name.starts_with(MULTIPATH_PREFIX)
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

// =============================================================================
// Multipath Resolver
// =============================================================================

/// Resolves device paths to canonical nodes and multipath parents
#[derive(Clone)]
pub struct MultipathResolver {
    fs: DeviceFsRef,
}

impl MultipathResolver {
    pub fn new(fs: DeviceFsRef) -> Self {
        Self { fs }
    }

    /// Follow `path` to the device node it names
    ///
    /// A `dm-*` target is already canonical and comes back as `/dev/dm-N`.
    pub fn resolve_canonical_device(&self, path: &str) -> Result<String> {
        let target = self
            .fs
            .canonicalize(Path::new(path))
            .map_err(|source| Error::PathResolution {
                path: path.to_string(),
                source,
            })?;

        let name = base_name(&target);
        if is_multipath_name(&name) {
            return Ok(format!("{}/{}", DEV_DIR, name));
        }

        Ok(target.to_string_lossy().to_string())
    }

    /// Find the multipath device `path` belongs to
    ///
    /// Returns `Ok(None)` when the device is not part of a multipath group.
    pub fn find_multipath_parent(&self, path: &str) -> Result<Option<String>> {
        let canonical = self.resolve_canonical_device(path)?;
        let device = base_name(Path::new(&canonical));
        if is_multipath_name(&device) {
            return Ok(Some(canonical));
        }

        let entries = match self.fs.read_dir(Path::new(SYSFS_BLOCK)) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {}: {}", SYSFS_BLOCK, e);
                return Ok(None);
            }
        };

        for dm in entries.iter().filter(|name| is_multipath_name(name)) {
            let slaves_dir = Path::new(SYSFS_BLOCK).join(dm).join("slaves");
            let slaves = self.fs.read_dir(&slaves_dir).unwrap_or_default();
            if slaves.iter().any(|slave| *slave == device) {
                trace!("Found {} under multipath device {}", device, dm);
                return Ok(Some(format!("{}/{}", DEV_DIR, dm)));
            }
        }

        debug!("{} ({}) is not part of a multipath device", path, canonical);
        Ok(None)
    }

    /// List the SCSI devices under a multipath device
    ///
    /// `dm_path` must look like `/dev/dm-N`; anything else, or an unreadable
    /// slaves directory, yields an empty list.
    pub fn list_slaves(&self, dm_path: &str) -> Vec<String> {
        // "/dev/dm-1" splits into "", "dev", "dm-1"
        let parts: Vec<&str> = dm_path.split('/').collect();
        if parts.len() != 3 || !parts[1].starts_with("dev") {
            debug!("Not a multipath device path: {}", dm_path);
            return Vec::new();
        }

        let slaves_dir = Path::new(SYSFS_BLOCK).join(parts[2]).join("slaves");
        match self.fs.read_dir(&slaves_dir) {
            Ok(names) => names
                .into_iter()
                .map(|name| format!("{}/{}", DEV_DIR, name))
                .collect(),
            Err(e) => {
                debug!("Cannot list {}: {}", slaves_dir.display(), e);
                Vec::new()
            }
        }
    }
}
