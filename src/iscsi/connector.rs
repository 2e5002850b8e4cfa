//! iSCSI Connector
//!
//! Attaches a target through every portal it lists, one after another:
//!
//! ```text
//! check iface -> session exists? -- yes --> wait for device (short)
//!                      |                          | not there
//!                      no <-----------------------+
//!                      |
//!         new record -> CHAP update -> login -> wait for device (long)
//! ```
//!
//! A failing portal is logged and skipped; only a broken iface or "no
//! device through any portal" fails the whole connect.

use crate::config::ConnectorConfig;
use crate::discovery::{MultipathResolver, ScsiSubsystem};
use crate::domain::ports::{CommandRunnerRef, DeviceFsRef};
use crate::domain::types::{AuthType, DiscoveredTarget, IscsiTarget, Secrets, Session};
use crate::error::{Error, Result};
use crate::iscsi::iscsiadm::Iscsiadm;
use crate::iscsi::session::{device_path_for, extract_transport_name};
use crate::iscsi::wait::wait_for_path_to_exist;
use crate::lock::TargetLocks;
use crate::logging::{blocking, scoped};
use std::path::Path;
use tracing::{debug, error, info, warn, Dispatch};

const INITIATOR_NAME_KEY: &str = "InitiatorName=";

// =============================================================================
// iSCSI Connector
// =============================================================================

/// Connects and disconnects iSCSI targets on this node
#[derive(Clone)]
pub struct IscsiConnector {
    config: ConnectorConfig,
    fs: DeviceFsRef,
    iscsiadm: Iscsiadm,
    resolver: MultipathResolver,
    scsi: ScsiSubsystem,
    locks: TargetLocks,
    dispatch: Option<Dispatch>,
}

impl IscsiConnector {
    pub fn new(config: ConnectorConfig, fs: DeviceFsRef, runner: CommandRunnerRef) -> Self {
        let iscsiadm = Iscsiadm::new(runner, config.iscsiadm_path.clone());
        Self {
            resolver: MultipathResolver::new(fs.clone()),
            scsi: ScsiSubsystem::new(fs.clone()),
            iscsiadm,
            config,
            fs,
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

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    fn iface_for<'a>(&'a self, target: &'a IscsiTarget) -> &'a str {
        if target.iface.is_empty() {
            &self.config.default_iface
        } else {
            &target.iface
        }
    }

    async fn transport_for(&self, iface: &str) -> Result<String> {
        match self.iscsiadm.show_iface(iface).await {
            Ok(output) => Ok(extract_transport_name(&output)),
            Err(e) => {
                error!("iface {} check failed: {}", iface, e);
                Err(Error::IfaceUnavailable {
                    iface: iface.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn wait_for_device(&self, device_path: &mut String, retries: u32, transport: &str) -> bool {
        wait_for_path_to_exist(
            self.fs.as_ref(),
            device_path,
            retries,
            transport,
            self.config.poll_interval(),
        )
        .await
    }

    /// First multipath device behind any of `paths`
    fn collapse_multipath(&self, paths: &[String]) -> Option<String> {
        paths.iter().find_map(|path| match self.resolver.find_multipath_parent(path) {
            Ok(parent) => parent,
            Err(e) => {
                debug!("No multipath device for {}: {}", path, e);
                None
            }
        })
    }

    fn pick_device(&self, target: &IscsiTarget, device_paths: &[String]) -> Option<String> {
        let first = device_paths.first()?.clone();
        if target.multipath {
            if let Some(dm) = self.collapse_multipath(device_paths) {
                info!("Using multipath device {} for {}", dm, target.target_iqn);
                return Some(dm);
            }
            debug!("Multipath requested for {} but none found", target.target_iqn);
        }
        Some(first)
    }

    // =========================================================================
    // Connect
    // =========================================================================

    /// Attach `target` and return the local device path
    pub async fn connect(&self, target: &IscsiTarget) -> Result<String> {
        scoped(self.dispatch.as_ref(), async {
            let _guard = self.locks.acquire(&target.lock_key()).await;
            self.connect_locked(target).await
        })
        .await
    }

    async fn connect_locked(&self, target: &IscsiTarget) -> Result<String> {
        let iface = self.iface_for(target);
        let transport = self.transport_for(iface).await?;
        info!(
            "Connecting {} via {} portal(s), iface {} ({})",
            target.target_iqn,
            target.portals.len(),
            iface,
            transport
        );

        let mut device_paths = Vec::new();
        for portal in &target.portals {
            if let Some(path) = self.connect_portal(target, portal, iface, &transport).await {
                device_paths.push(path);
            }
        }

        match self.pick_device(target, &device_paths) {
            Some(device) => {
                info!("Connected {} at {}", target.target_iqn, device);
                Ok(device)
            }
            None => {
                error!("No device appeared for {} on any portal", target.target_iqn);
                Err(Error::NoDiskFound {
                    target: target.target_iqn.clone(),
                })
            }
        }
    }

    /// Bring up one portal, `None` if it was skipped
    async fn connect_portal(
        &self,
        target: &IscsiTarget,
        portal: &str,
        iface: &str,
        transport: &str,
    ) -> Option<String> {
        let iqn = &target.target_iqn;
        let mut device_path = device_path_for(portal, iqn, target.lun, transport);
        debug!("Processing portal {}, expecting {}", portal, device_path);

        let exists = self.iscsiadm.session_exists(portal, iqn).await.unwrap_or_else(|e| {
            warn!("Session check for {} failed, assuming none: {}", portal, e);
            false
        });
        if exists {
            info!("Found session to {} via {}, checking {}", iqn, portal, device_path);
            if self
                .wait_for_device(&mut device_path, self.config.session_wait_retries, transport)
                .await
            {
                return Some(device_path);
            }
            debug!("Device for existing session not present, logging in again");
        }

        if let Err(e) = self.iscsiadm.new_node(iqn, portal, iface).await {
            warn!("Skipping portal {}: cannot create node record: {}", portal, e);
            return None;
        }

        if target.auth_type == AuthType::Chap {
            if let Err(e) = self.iscsiadm.update_chap(iqn, portal, &target.session_secrets).await {
                warn!("Skipping portal {}: CHAP update failed: {}", portal, e);
                return None;
            }
        }

        if let Err(e) = self.iscsiadm.login(iqn, portal).await {
            warn!("Skipping portal {}: login failed: {}", portal, e);
            return None;
        }

        if self
            .wait_for_device(&mut device_path, self.config.login_wait_retries, transport)
            .await
        {
            Some(device_path)
        } else {
            warn!(
                "Device {} did not appear after {} attempts",
                device_path, self.config.login_wait_retries
            );
            None
        }
    }

    // =========================================================================
    // Disconnect
    // =========================================================================

    /// Detach `device_path` (if given), log out of every portal, and delete
    /// the node records
    ///
    /// A logout failure returns at once. A detach failure is reported only
    /// after logout and record deletion succeed.
    pub async fn disconnect(&self, target: &IscsiTarget, device_path: Option<&str>) -> Result<()> {
        scoped(self.dispatch.as_ref(), async {
            let _guard = self.locks.acquire(&target.lock_key()).await;
            self.disconnect_locked(target, device_path).await
        })
        .await
    }

    async fn disconnect_locked(&self, target: &IscsiTarget, device_path: Option<&str>) -> Result<()> {
        let iqn = &target.target_iqn;
        info!("Disconnecting {}", iqn);

        let detach_result = match device_path {
            Some(path) => {
                let scsi = self.scsi.clone();
                let path = path.to_string();
                blocking(move || {
                    let count = scsi.detach_path(&path)?;
                    debug!("Detached {} device(s) behind {}", count, path);
                    Ok(())
                })
                .await
            }
            None => Ok(()),
        };
        if let Err(e) = &detach_result {
            warn!("Detach failed for {}: {}", iqn, e);
        }

        for portal in &target.portals {
            if let Err(e) = self.iscsiadm.logout(iqn, portal).await {
                error!("Failed to log out of {} via {}: {}", iqn, portal, e);
                return Err(e);
            }
        }

        if let Err(e) = self.iscsiadm.delete_node(iqn).await {
            error!("Failed to delete node records for {}: {}", iqn, e);
            return Err(e);
        }

        detach_result
    }

    // =========================================================================
    // Lookup and Discovery
    // =========================================================================

    /// Device of an already attached target, without logging in
    pub async fn get_device(&self, target: &IscsiTarget) -> Result<Option<String>> {
        scoped(self.dispatch.as_ref(), async {
            let transport = self.transport_for(self.iface_for(target)).await?;

            let mut device_paths = Vec::new();
            for portal in &target.portals {
                let mut path = device_path_for(portal, &target.target_iqn, target.lun, &transport);
                if self.wait_for_device(&mut path, 1, &transport).await {
                    device_paths.push(path);
                }
            }
            Ok(self.pick_device(target, &device_paths))
        })
        .await
    }

    /// All active sessions on this node
    pub async fn sessions(&self) -> Result<Vec<Session>> {
        scoped(self.dispatch.as_ref(), self.iscsiadm.list_sessions()).await
    }

    /// Active sessions to `target_iqn`
    pub async fn sessions_for_target(&self, target_iqn: &str) -> Result<Vec<Session>> {
        scoped(self.dispatch.as_ref(), self.iscsiadm.sessions_for_target(target_iqn)).await
    }

    /// SendTargets discovery, with discovery CHAP when `secrets` names a user
    pub async fn discover_targets(
        &self,
        portal: &str,
        secrets: Option<&Secrets>,
    ) -> Result<Vec<DiscoveredTarget>> {
        scoped(self.dispatch.as_ref(), self.iscsiadm.discover(portal, secrets)).await
    }

    /// Does discovery at `portal` report `target_iqn`
    pub async fn is_target_discovered(&self, portal: &str, target_iqn: &str) -> Result<bool> {
        let targets = self.discover_targets(portal, None).await?;
        Ok(targets.iter().any(|t| t.target_iqn == target_iqn))
    }

    // =========================================================================
    // Initiator
    // =========================================================================

    /// This node's initiator IQN
    pub fn initiator_name(&self) -> Result<String> {
        let path: &Path = &self.config.initiator_name_file;
        let contents = self.fs.read_to_string(path).map_err(|e| {
            Error::InitiatorUnavailable(format!("cannot read {}: {}", path.display(), e))
        })?;

        contents
            .lines()
            .map(str::trim)
            .find_map(|line| line.strip_prefix(INITIATOR_NAME_KEY))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::InitiatorUnavailable(format!("no {} in {}", INITIATOR_NAME_KEY, path.display()))
            })
    }

    /// Check that `iscsiadm` runs, returning its version string
    pub async fn check_initiator_available(&self) -> Result<String> {
        scoped(self.dispatch.as_ref(), async {
            match self.iscsiadm.version().await {
                Ok(version) => {
                    debug!("Initiator available: {}", version);
                    Ok(version)
                }
                Err(e) => Err(Error::InitiatorUnavailable(e.to_string())),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::CommandOutput;
    use crate::host::{FakeCommandRunner, FakeDeviceFs};
    use crate::logging::tests::CapturedLogs;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const IQN: &str = "iqn.2010-10.org.openstack:volume-x";
    const PORTAL_A: &str = "192.168.1.107:3260";
    const PORTAL_B: &str = "192.168.1.108:3260";

    fn tcp_iface() -> CommandOutput {
        CommandOutput::success("iface.iscsi_ifacename = default\niface.transport_name = tcp\n")
    }

    fn by_path(portal: &str, lun: i32) -> String {
        format!("/dev/disk/by-path/ip-{}-iscsi-{}-lun-{}", portal, IQN, lun)
    }

    fn setup() -> (Arc<FakeDeviceFs>, Arc<FakeCommandRunner>, IscsiConnector) {
        let fs = Arc::new(FakeDeviceFs::new());
        let runner = Arc::new(FakeCommandRunner::new());
        runner.on(&["-m", "iface"], tcp_iface());
        runner.on(&["-m", "session"], CommandOutput::failure(21, "No active sessions"));
        let connector = IscsiConnector::new(ConnectorConfig::default(), fs.clone(), runner.clone());
        (fs, runner, connector)
    }

    fn chap_target(portals: &[&str]) -> IscsiTarget {
        let mut target = IscsiTarget::new(IQN, portals.iter().copied(), 1);
        target.auth_type = AuthType::Chap;
        target.session_secrets = Secrets {
            username: "user".into(),
            password: "s3cret".into(),
            username_in: String::new(),
            password_in: String::new(),
        };
        target
    }

    fn position(calls: &[crate::host::RecordedCall], tokens: &[&str]) -> usize {
        calls
            .iter()
            .position(|c| c.has_args(tokens))
            .unwrap_or_else(|| panic!("no call with {:?}", tokens))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sequence_with_chap() {
        let (fs, runner, connector) = setup();
        fs.add_scsi_disk("sdc");
        fs.add_symlink(by_path(PORTAL_A, 1), "../../sdc");

        let device = connector.connect(&chap_target(&[PORTAL_A])).await.unwrap();
        assert_eq!(device, by_path(PORTAL_A, 1));

        let calls = runner.calls();
        let order = [
            position(&calls, &["-m", "iface", "-I", "default", "-o", "show"]),
            position(&calls, &["-m", "session"]),
            position(&calls, &["-p", PORTAL_A, "-I", "default", "-o", "new"]),
            position(&calls, &["-o", "update", "-n", "node.session.auth.authmethod", "-v", "CHAP"]),
            position(&calls, &["-T", IQN, "-p", PORTAL_A, "-l"]),
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]), "order was {:?}", order);
        assert_eq!(calls.len(), 5);
    }

    fn with_session() -> (Arc<FakeDeviceFs>, Arc<FakeCommandRunner>, IscsiConnector) {
        let fs = Arc::new(FakeDeviceFs::new());
        let runner = Arc::new(FakeCommandRunner::new());
        runner.on(&["-m", "iface"], tcp_iface());
        runner.on(
            &["-m", "session"],
            CommandOutput::success(format!("tcp: [1] {},1 {}\n", PORTAL_A, IQN)),
        );
        let connector = IscsiConnector::new(ConnectorConfig::default(), fs.clone(), runner.clone());
        (fs, runner, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_session_skips_login() {
        let (fs, runner, connector) = with_session();
        fs.add_file(by_path(PORTAL_A, 1), "");

        let device = connector.connect(&IscsiTarget::new(IQN, [PORTAL_A], 1)).await.unwrap();
        assert_eq!(device, by_path(PORTAL_A, 1));
        assert!(runner.calls_with(&["-l"]).is_empty());
        assert!(runner.calls_with(&["-o", "new"]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_session_without_device_logs_in() {
        let (fs, runner, connector) = with_session();

        let err = connector
            .connect(&IscsiTarget::new(IQN, [PORTAL_A], 1))
            .await
            .unwrap_err();
        assert_matches!(err, Error::NoDiskFound { .. });
        assert_eq!(runner.calls_with(&["-l"]).len(), 1);
        // one check for the existing session, then the full login wait
        assert_eq!(fs.stat_calls(), 1 + 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iface_failure_is_fatal() {
        let fs = Arc::new(FakeDeviceFs::new());
        let runner = Arc::new(FakeCommandRunner::new());
        runner.on(&["-m", "iface"], CommandOutput::failure(6, "iface not found"));
        let connector = IscsiConnector::new(ConnectorConfig::default(), fs, runner.clone());

        let mut target = IscsiTarget::new(IQN, [PORTAL_A], 1);
        target.iface = "offload0".into();
        assert_matches!(
            connector.connect(&target).await,
            Err(Error::IfaceUnavailable { iface, .. }) if iface == "offload0"
        );
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_portal_is_skipped() {
        let (fs, runner, connector) = setup();
        runner.on(&["-p", PORTAL_A, "-l"], CommandOutput::failure(8, "connection timed out"));
        fs.add_file(by_path(PORTAL_B, 1), "");

        let device = connector
            .connect(&IscsiTarget::new(IQN, [PORTAL_A, PORTAL_B], 1))
            .await
            .unwrap();
        assert_eq!(device, by_path(PORTAL_B, 1));
        // no wait on the portal whose login failed
        assert_eq!(fs.stat_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chap_update_failure_skips_login() {
        let (_fs, runner, connector) = setup();
        runner.on(&["-o", "update"], CommandOutput::failure(7, "invalid parameter"));

        assert_matches!(
            connector.connect(&chap_target(&[PORTAL_A])).await,
            Err(Error::NoDiskFound { .. })
        );
        assert!(runner.calls_with(&["-l"]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_session_exists_code_is_success() {
        let (fs, runner, connector) = setup();
        runner.on(&["-l"], CommandOutput::failure(15, "session exists"));
        fs.add_file(by_path(PORTAL_A, 1), "");

        assert_eq!(
            connector.connect(&IscsiTarget::new(IQN, [PORTAL_A], 1)).await.unwrap(),
            by_path(PORTAL_A, 1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_multipath_collapse() {
        let (fs, _runner, connector) = setup();
        fs.add_scsi_disk("sdb").add_scsi_disk("sdc");
        fs.add_multipath("dm-0", &["sdb", "sdc"]);
        fs.add_symlink(by_path(PORTAL_A, 1), "../../sdb");
        fs.add_symlink(by_path(PORTAL_B, 1), "../../sdc");

        let mut target = IscsiTarget::new(IQN, [PORTAL_A, PORTAL_B], 1);
        assert_eq!(connector.connect(&target).await.unwrap(), by_path(PORTAL_A, 1));

        target.multipath = true;
        assert_eq!(connector.connect(&target).await.unwrap(), "/dev/dm-0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_offload_transport_uses_glob() {
        let fs = Arc::new(FakeDeviceFs::new());
        let runner = Arc::new(FakeCommandRunner::new());
        runner.on(&["-m", "iface"], CommandOutput::success("iface.transport_name = bnx2i\n"));
        runner.on(&["-m", "session"], CommandOutput::failure(21, ""));
        let found = format!(
            "/dev/disk/by-path/pci-0000:00:02.0-ip-{}-iscsi-{}-lun-1",
            PORTAL_A, IQN
        );
        fs.add_file(&found, "");
        let connector = IscsiConnector::new(ConnectorConfig::default(), fs, runner);

        assert_eq!(
            connector.connect(&IscsiTarget::new(IQN, [PORTAL_A], 1)).await.unwrap(),
            found
        );
    }

    #[tokio::test]
    async fn test_disconnect_detaches_then_logs_out() {
        let (fs, runner, connector) = setup();
        fs.add_scsi_disk("sda");
        fs.add_multipath("dm-1", &["sda"]);

        connector
            .disconnect(&IscsiTarget::new(IQN, [PORTAL_A, PORTAL_B], 1), Some("/dev/dm-1"))
            .await
            .unwrap();

        assert_eq!(fs.writes_to("/sys/block/sda/device/delete"), vec![b"1".to_vec()]);
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].has_args(&["-p", PORTAL_A, "-u"]));
        assert!(calls[1].has_args(&["-p", PORTAL_B, "-u"]));
        assert!(calls[2].has_args(&["-T", IQN, "-o", "delete"]));
    }

    #[tokio::test]
    async fn test_disconnect_logout_failure_stops() {
        let (_fs, runner, connector) = setup();
        runner.on(&["-p", PORTAL_A, "-u"], CommandOutput::failure(21, "no matching sessions"));

        assert_matches!(
            connector
                .disconnect(&IscsiTarget::new(IQN, [PORTAL_A, PORTAL_B], 1), None)
                .await,
            Err(Error::Command { status: Some(21), .. })
        );
        assert!(runner.calls_with(&["-p", PORTAL_B]).is_empty());
        assert!(runner.calls_with(&["-o", "delete"]).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_reports_detach_failure_last() {
        let (fs, runner, connector) = setup();
        fs.add_scsi_disk("sdd");
        fs.fail_writes_to("/sys/block/sdd/device/delete");

        assert_matches!(
            connector
                .disconnect(&IscsiTarget::new(IQN, [PORTAL_A], 1), Some("/dev/sdd"))
                .await,
            Err(Error::DetachFailed { attempted: 1, failed: 1, .. })
        );
        // logout and delete still ran
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_initiator_name() {
        let (fs, _runner, connector) = setup();
        fs.add_file(
            "/etc/iscsi/initiatorname.iscsi",
            "## DO NOT EDIT\nInitiatorName=iqn.1993-08.org.debian:01:a1b2c3\n",
        );
        assert_eq!(connector.initiator_name().unwrap(), "iqn.1993-08.org.debian:01:a1b2c3");

        fs.add_file("/etc/iscsi/initiatorname.iscsi", "# empty\n");
        assert_matches!(connector.initiator_name(), Err(Error::InitiatorUnavailable(_)));
    }

    #[tokio::test]
    async fn test_check_initiator_available() {
        let (_fs, runner, connector) = setup();
        runner.on_once(&["--version"], CommandOutput::success("iscsiadm version 2.1.8\n"));
        assert_eq!(
            connector.check_initiator_available().await.unwrap(),
            "iscsiadm version 2.1.8"
        );

        runner.on_spawn_error(&["--version"], std::io::ErrorKind::NotFound);
        assert_matches!(
            connector.check_initiator_available().await,
            Err(Error::InitiatorUnavailable(_))
        );
    }

    #[tokio::test]
    async fn test_get_device_does_not_login() {
        let (fs, runner, connector) = setup();
        fs.add_file(by_path(PORTAL_B, 1), "");

        let target = IscsiTarget::new(IQN, [PORTAL_A, PORTAL_B], 1);
        assert_eq!(connector.get_device(&target).await.unwrap(), Some(by_path(PORTAL_B, 1)));
        assert!(runner.calls_with(&["-l"]).is_empty());

        let missing = IscsiTarget::new(IQN, [PORTAL_A], 2);
        assert_eq!(connector.get_device(&missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_is_target_discovered() {
        let (_fs, runner, connector) = setup();
        runner.on(
            &["-m", "discovery"],
            CommandOutput::success(format!("{},1 {}\n", PORTAL_A, IQN)),
        );

        assert!(connector.is_target_discovered(PORTAL_A, IQN).await.unwrap());
        assert!(!connector
            .is_target_discovered(PORTAL_A, "iqn.2010-10.org.openstack:other")
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_dispatch_receives_connector_logs() {
        let (fs, _runner, connector) = setup();
        fs.add_file(by_path(PORTAL_A, 1), "");
        let logs = CapturedLogs::default();
        let connector = connector.with_dispatch(logs.dispatch());

        connector.connect(&IscsiTarget::new(IQN, [PORTAL_A], 1)).await.unwrap();
        assert!(logs.contents().contains(&format!("Connected {}", IQN)));
    }
}
