//! Device Discovery
//!
//! Shared engine behind both connectors: locating disks in the udev
//! namespaces, collapsing SCSI paths into their multipath device, and
//! driving SCSI host rescans and device removal through sysfs.

pub mod locator;
pub mod multipath;
pub mod scsi;

pub use locator::DiskLocator;
pub use multipath::{is_multipath_name, MultipathResolver};
pub use scsi::ScsiSubsystem;
