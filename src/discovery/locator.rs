//! Disk Locator
//!
//! Finds the local block device for a Fibre Channel target by scanning the
//! udev namespaces. A pass walks every identifier and stops at the first
//! multipath hit. When a pass ends without a multipath device the SCSI hosts
//! are rescanned once and a second pass runs.

use crate::discovery::multipath::MultipathResolver;
use crate::discovery::scsi::ScsiSubsystem;
use crate::domain::ports::DeviceFsRef;
use crate::domain::types::{DeviceLocation, FcTarget, TargetIdentifiers};
use crate::error::{Error, Result};
use std::path::Path;
use tracing::{debug, info, warn};

const BY_PATH_DIR: &str = "/dev/disk/by-path";
const BY_ID_DIR: &str = "/dev/disk/by-id";

/// Locates Fibre Channel disks by WWN or WWID
#[derive(Clone)]
pub struct DiskLocator {
    fs: DeviceFsRef,
    resolver: MultipathResolver,
    scsi: ScsiSubsystem,
}

impl DiskLocator {
    pub fn new(fs: DeviceFsRef) -> Self {
        Self {
            resolver: MultipathResolver::new(fs.clone()),
            scsi: ScsiSubsystem::new(fs.clone()),
            fs,
        }
    }

    /// Find the device for `target`, rescanning SCSI hosts at most once
    pub fn locate(&self, target: &FcTarget) -> Result<DeviceLocation> {
        let identifiers = target.identifiers();
        let mut location = self.search_pass(identifiers);

        if location.multipath_device_path.is_none() {
            info!("No multipath device for {} yet, rescanning SCSI hosts", target);
            self.scsi.rescan_hosts();

            let second = self.search_pass(identifiers);
            if second.multipath_device_path.is_some() || location.raw_device_path.is_none() {
                location = second;
            }
        }

        if !location.is_found() {
            warn!("No disk found for {} after rescan", target);
            return Err(Error::NoDiskFound {
                target: target.to_string(),
            });
        }

        info!(
            "Located {}: raw={:?} multipath={:?}",
            target, location.raw_device_path, location.multipath_device_path
        );
        Ok(location)
    }

    /// One walk over all identifiers
    fn search_pass(&self, identifiers: TargetIdentifiers<'_>) -> DeviceLocation {
        let hits: Box<dyn Iterator<Item = DeviceLocation> + '_> = match identifiers {
            TargetIdentifiers::Wwns { wwns, lun } => Box::new(
                wwns.iter()
                    .filter_map(move |wwn| self.find_disk_by_wwn(wwn, lun)),
            ),
            TargetIdentifiers::Wwids(wwids) => Box::new(
                wwids.iter().filter_map(move |wwid| self.find_disk_by_wwid(wwid)),
            ),
        };

        let mut location = DeviceLocation::default();
        for hit in hits {
            if hit.multipath_device_path.is_some() {
                // Keep the raw device that belongs to the multipath device
                return hit;
            }
            if location.raw_device_path.is_none() {
                location.raw_device_path = hit.raw_device_path;
            }
        }
        location
    }

    /// Look under `/dev/disk/by-path` for `*-fc-0x<wwn>-lun-<lun>`
    pub fn find_disk_by_wwn(&self, wwn: &str, lun: &str) -> Option<DeviceLocation> {
        let needle = format!("-fc-0x{}-lun-{}", wwn, lun);
        self.best_candidate(BY_PATH_DIR, |name| name.contains(&needle))
    }

    /// Look under `/dev/disk/by-id` for `scsi-<wwid>`
    ///
    /// udev replaces blanks in the WWID with underscores.
    pub fn find_disk_by_wwid(&self, wwid: &str) -> Option<DeviceLocation> {
        let wanted = format!("scsi-{}", wwid.replace(' ', "_"));
        self.best_candidate(BY_ID_DIR, |name| name == wanted)
    }

    /// Inspect every entry of `dir` accepted by `matches`
    ///
    /// The first entry under a multipath device wins. Otherwise the first
    /// entry that resolves is returned.
    fn best_candidate<F>(&self, dir: &str, matches: F) -> Option<DeviceLocation>
    where
        F: Fn(&str) -> bool,
    {
        let entries = match self.fs.read_dir(Path::new(dir)) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {}: {}", dir, e);
                return None;
            }
        };

        let mut raw_only = None;
        for name in entries.iter().filter(|name| matches(name)) {
            let location = match self.inspect(&format!("{}/{}", dir, name)) {
                Some(location) => location,
                None => continue,
            };
            if location.multipath_device_path.is_some() {
                return Some(location);
            }
            raw_only.get_or_insert(location);
        }
        raw_only
    }

    fn inspect(&self, link: &str) -> Option<DeviceLocation> {
        let raw = match self.resolver.resolve_canonical_device(link) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Skipping {}: {}", link, e);
                return None;
            }
        };

        let multipath = match self.resolver.find_multipath_parent(link) {
            Ok(parent) => parent,
            Err(e) => {
                debug!("Multipath lookup failed for {}: {}", link, e);
                None
            }
        };

        debug!("Candidate {} -> raw={} multipath={:?}", link, raw, multipath);
        Some(DeviceLocation {
            raw_device_path: Some(raw),
            multipath_device_path: multipath,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeDeviceFs;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const WWN: &str = "500a0982991b8dc5";
    const WWN_LINK: &str = "/dev/disk/by-path/pci-0000:05:00.2-fc-0x500a0982991b8dc5-lun-1";
    const SCAN0: &str = "/sys/class/scsi_host/host0/scan";
    const SCAN1: &str = "/sys/class/scsi_host/host1/scan";

    fn host() -> Arc<FakeDeviceFs> {
        let fs = Arc::new(FakeDeviceFs::new());
        fs.add_scsi_host("host0").add_scsi_host("host1");
        fs.add_dir(BY_PATH_DIR).add_dir(BY_ID_DIR);
        fs
    }

    #[test]
    fn test_wwn_fixture_is_found() {
        let fs = host();
        fs.add_scsi_disk("sdb");
        fs.add_symlink(WWN_LINK, "../../sdb");
        let locator = DiskLocator::new(fs.clone());

        let location = locator.locate(&FcTarget::with_wwns([WWN], "1")).unwrap();
        assert_eq!(location.raw_device_path.as_deref(), Some("/dev/sdb"));
        assert_eq!(location.multipath_device_path, None);
        assert_eq!(location.preferred(), Some("/dev/sdb"));
    }

    #[test]
    fn test_wrong_lun_does_not_match() {
        let fs = host();
        fs.add_scsi_disk("sdb");
        fs.add_symlink(WWN_LINK, "../../sdb");
        let locator = DiskLocator::new(fs);

        assert!(locator.find_disk_by_wwn(WWN, "11").is_none());
        assert!(locator.find_disk_by_wwn(WWN, "1").is_some());
    }

    #[test]
    fn test_nothing_found_rescans_once() {
        let fs = host();
        let locator = DiskLocator::new(fs.clone());

        assert_matches!(
            locator.locate(&FcTarget::with_wwns([WWN, "500a0982991b8dc6"], "1")),
            Err(Error::NoDiskFound { .. })
        );
        assert_eq!(fs.writes_to(SCAN0).len(), 1);
        assert_eq!(fs.writes_to(SCAN1).len(), 1);
    }

    #[test]
    fn test_multipath_on_first_pass_skips_rescan() {
        let fs = host();
        fs.add_scsi_disk("sdb").add_scsi_disk("sdc");
        fs.add_multipath("dm-0", &["sdb", "sdc"]);
        fs.add_symlink(WWN_LINK, "../../sdb");
        let locator = DiskLocator::new(fs.clone());

        let location = locator.locate(&FcTarget::with_wwns([WWN], "1")).unwrap();
        assert_eq!(location.multipath_device_path.as_deref(), Some("/dev/dm-0"));
        assert_eq!(location.raw_device_path.as_deref(), Some("/dev/sdb"));
        assert!(fs.writes().is_empty());
    }

    #[test]
    fn test_multipath_preferred_over_earlier_raw() {
        let fs = host();
        fs.add_scsi_disk("sdb").add_scsi_disk("sdd");
        fs.add_multipath("dm-4", &["sdd"]);
        fs.add_symlink(WWN_LINK, "../../sdb");
        fs.add_symlink(
            "/dev/disk/by-path/pci-0000:05:00.3-fc-0x500a0982991b8dc6-lun-1",
            "../../sdd",
        );
        let locator = DiskLocator::new(fs);

        let location = locator
            .locate(&FcTarget::with_wwns([WWN, "500a0982991b8dc6"], "1"))
            .unwrap();
        assert_eq!(location.preferred(), Some("/dev/dm-4"));
        assert_eq!(location.raw_device_path.as_deref(), Some("/dev/sdd"));
    }

    #[test]
    fn test_raw_only_after_rescan() {
        let fs = host();
        fs.add_scsi_disk("sde");
        fs.add_symlink("/dev/disk/by-id/scsi-3600508b400105e210000900000490000", "../../sde");
        let locator = DiskLocator::new(fs.clone());

        let location = locator
            .locate(&FcTarget::with_wwids(["3600508b400105e210000900000490000"]))
            .unwrap();
        assert_eq!(location.raw_device_path.as_deref(), Some("/dev/sde"));
        assert_eq!(location.multipath_device_path, None);
        // A raw-only hit still earns exactly one rescan
        assert_eq!(fs.writes_to(SCAN0).len(), 1);
    }

    #[test]
    fn test_wwid_blanks_become_underscores() {
        let fs = host();
        fs.add_scsi_disk("sdf");
        fs.add_symlink("/dev/disk/by-id/scsi-SATA_VBOX_HARDDISK", "../../sdf");
        let locator = DiskLocator::new(fs);

        let hit = locator.find_disk_by_wwid("SATA VBOX HARDDISK").unwrap();
        assert_eq!(hit.raw_device_path.as_deref(), Some("/dev/sdf"));
    }

    #[test]
    fn test_multipath_path_preferred_within_one_wwn() {
        let fs = host();
        fs.add_scsi_disk("sdb").add_scsi_disk("sdc");
        fs.add_multipath("dm-5", &["sdc"]);
        fs.add_symlink(WWN_LINK, "../../sdb");
        fs.add_symlink(
            "/dev/disk/by-path/pci-0000:05:00.3-fc-0x500a0982991b8dc5-lun-1",
            "../../sdc",
        );
        let locator = DiskLocator::new(fs.clone());

        let hit = locator.find_disk_by_wwn(WWN, "1").unwrap();
        assert_eq!(hit.multipath_device_path.as_deref(), Some("/dev/dm-5"));
        assert_eq!(hit.raw_device_path.as_deref(), Some("/dev/sdc"));

        let location = locator.locate(&FcTarget::with_wwns([WWN], "1")).unwrap();
        assert_eq!(location.preferred(), Some("/dev/dm-5"));
        assert!(fs.writes().is_empty());
    }

    #[test]
    fn test_first_raw_path_kept_when_no_multipath() {
        let fs = host();
        fs.add_scsi_disk("sdb").add_scsi_disk("sdc");
        fs.add_symlink(WWN_LINK, "../../sdb");
        fs.add_symlink(
            "/dev/disk/by-path/pci-0000:05:00.3-fc-0x500a0982991b8dc5-lun-1",
            "../../sdc",
        );
        let locator = DiskLocator::new(fs);

        let hit = locator.find_disk_by_wwn(WWN, "1").unwrap();
        assert_eq!(hit.raw_device_path.as_deref(), Some("/dev/sdb"));
        assert_eq!(hit.multipath_device_path, None);
    }

    #[test]
    fn test_wwid_under_multipath_skips_rescan() {
        let fs = host();
        fs.add_scsi_disk("sdh").add_scsi_disk("sdi");
        fs.add_multipath("dm-6", &["sdh", "sdi"]);
        fs.add_symlink("/dev/disk/by-id/scsi-3600a09803830447a4f244c4657616f77", "../../sdi");
        fs.add_symlink("/dev/disk/by-id/scsi-3600a09803830447a4f244c4657616f7", "../../sdz");
        let locator = DiskLocator::new(fs.clone());

        let location = locator
            .locate(&FcTarget::with_wwids(["3600a09803830447a4f244c4657616f77"]))
            .unwrap();
        assert_eq!(location.multipath_device_path.as_deref(), Some("/dev/dm-6"));
        assert_eq!(location.raw_device_path.as_deref(), Some("/dev/sdi"));
        assert!(fs.writes().is_empty());
    }

    #[test]
    fn test_dangling_candidate_is_skipped() {
        let fs = host();
        fs.add_scsi_disk("sdg");
        fs.add_symlink("/dev/disk/by-path/pci-0000:05:00.0-fc-0x500a0982991b8dc5-lun-1", "../../sdz");
        fs.add_symlink(WWN_LINK, "../../sdg");
        let locator = DiskLocator::new(fs);

        let hit = locator.find_disk_by_wwn(WWN, "1").unwrap();
        assert_eq!(hit.raw_device_path.as_deref(), Some("/dev/sdg"));
    }
}
