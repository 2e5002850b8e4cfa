//! Fibre Channel
//!
//! Attach is discovery only: the fabric has already presented the LUN, so
//! connecting means finding it (with one SCSI rescan) and disconnecting
//! means removing its SCSI devices.

use crate::discovery::{DiskLocator, ScsiSubsystem};
use crate::domain::ports::DeviceFsRef;
use crate::domain::types::{DeviceLocation, FcTarget};
use crate::error::{Error, Result};
use crate::lock::TargetLocks;
use crate::logging::{blocking, scoped};
use tracing::{info, Dispatch};

/// Connects and disconnects Fibre Channel targets on this node
#[derive(Clone)]
pub struct FcConnector {
    locator: DiskLocator,
    scsi: ScsiSubsystem,
    locks: TargetLocks,
    dispatch: Option<Dispatch>,
}

impl FcConnector {
    pub fn new(fs: DeviceFsRef) -> Self {
        Self {
            locator: DiskLocator::new(fs.clone()),
            scsi: ScsiSubsystem::new(fs),
            locks: TargetLocks::new(),
            dispatch: None,
        }
    }

    /// Send this connector's logs to `dispatch`
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Share a lock table with other connectors
    pub fn with_locks(mut self, locks: TargetLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Find the device for `target`, preferring its multipath device
    pub async fn connect(&self, target: &FcTarget) -> Result<String> {
        let location = self.locate(target).await?;
        location
            .preferred()
            .map(str::to_string)
            .ok_or_else(|| Error::NoDiskFound {
                target: target.to_string(),
            })
    }

    /// Both the raw and the multipath device found for `target`
    pub async fn locate(&self, target: &FcTarget) -> Result<DeviceLocation> {
        scoped(self.dispatch.as_ref(), async {
            let _guard = self.locks.acquire(&target.lock_key()).await;
            info!("Connecting Fibre Channel {}", target);
            let locator = self.locator.clone();
            let target = target.clone();
            blocking(move || locator.locate(&target)).await
        })
        .await
    }

    /// Remove the SCSI devices behind `device_path`
    ///
    /// Returns the number of devices detached.
    pub async fn disconnect(&self, target: &FcTarget, device_path: &str) -> Result<usize> {
        scoped(self.dispatch.as_ref(), async {
            let _guard = self.locks.acquire(&target.lock_key()).await;
            info!("Disconnecting Fibre Channel {} at {}", target, device_path);
            let scsi = self.scsi.clone();
            let device_path = device_path.to_string();
            blocking(move || scsi.detach_path(&device_path)).await
        })
        .await
    }
}
