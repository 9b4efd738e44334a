//! Adaptec (arcconf) Backend
//!
//! Drives a Microchip/Adaptec controller through the arcconf command line.
//! Every invocation carries the controller index as its second argument
//! (`arcconf GETCONFIG <N> LD ...`). Logical drives are identified by the
//! number reported on `Logical Device Number` lines; physical devices are
//! addressed as `channel:device`.

use crate::backends::ProvisionerConfig;
use crate::domain::ports::{
    CommandOutput, CommandRunner, PhysicalDeviceRef, RaidBackend, RaidSpec, ReadinessState,
    VirtualDrive,
};
use crate::error::{Error, Result};
use crate::hardware::BlockDeviceEnumerator;
use crate::reconcile::{self, same_device_set};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

const TOOL: &str = "arcconf";

/// Sentinel the controller prints when no logical devices exist.
const NO_LDS_CONFIGURED: &str = "No logical devices configured";

/// Trailing phrase of a successful CREATE/DELETE invocation.
const SUCCESS_PHRASE: &str = "Command completed successfully.";

// =============================================================================
// Line Grammar
// =============================================================================

/// `Logical Device Number 3` header introducing one LD block.
static LD_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^logical device number (\d+)").expect("valid pattern"));

/// `Status of Logical Device : Optimal`
static LD_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)status of logical device\s*:\s*(.+)$").expect("valid pattern")
});

/// Segment locator inside a parenthesized tuple: `Channel:0,Device:1`.
static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Channel:(\d+),Device:(\d+)").expect("valid pattern"));

/// LD numbers from a full `GETCONFIG <N> LD` report.
fn parse_ld_numbers(report: &str) -> Vec<String> {
    report
        .lines()
        .filter_map(|line| LD_NUMBER_RE.captures(line.trim()))
        .map(|caps| caps[1].to_string())
        .collect()
}

/// The `Status of Logical Device` value, if present.
fn parse_ld_status(report: &str) -> Option<String> {
    report
        .lines()
        .find_map(|line| LD_STATUS_RE.captures(line))
        .map(|caps| caps[1].trim().to_string())
}

/// Segment locators as `channel:device` references.
fn parse_segments(report: &str) -> Vec<PhysicalDeviceRef> {
    report
        .lines()
        .filter(|line| line.trim_start().starts_with("Segment"))
        .filter_map(|line| SEGMENT_RE.captures(line))
        .map(|caps| PhysicalDeviceRef::new(format!("{}:{}", &caps[1], &caps[2])))
        .collect()
}

/// Classify an LD status token as a readiness state.
///
/// Any background operation reported in the status (build/verify, rebuild,
/// initialization, clear) keeps the drive busy; an unrecognized token is
/// surfaced as unknown rather than guessed at.
fn classify_status(status: &str) -> ReadinessState {
    const BUSY_TOKENS: [&str; 5] = ["build", "verify", "rebuild", "initializ", "clear"];
    let lowered = status.to_lowercase();
    if BUSY_TOKENS.iter().any(|token| lowered.contains(token)) {
        ReadinessState::Busy
    } else if lowered == "optimal" || lowered == "okay" {
        ReadinessState::Ready
    } else {
        ReadinessState::Unknown
    }
}

// =============================================================================
// arcconf Backend
// =============================================================================

/// Adapter for Adaptec controllers via arcconf.
pub struct ArcconfBackend {
    spec: RaidSpec,
    config: ProvisionerConfig,
    runner: Arc<dyn CommandRunner>,
    enumerator: BlockDeviceEnumerator,
    util: Option<PathBuf>,
    /// The bound logical drive number, set by discovery/creation
    vd: Option<String>,
}

impl ArcconfBackend {
    pub fn new(
        spec: RaidSpec,
        config: ProvisionerConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let enumerator = BlockDeviceEnumerator::new(runner.clone());
        Self {
            spec,
            config,
            runner,
            enumerator,
            util: None,
            vd: None,
        }
    }

    /// Run one arcconf command, inserting the controller index after the
    /// command verb.
    async fn run_tool(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput> {
        let util = self
            .util
            .as_deref()
            .ok_or_else(|| Error::Internal("arcconf backend used before initialize".into()))?;
        let controller = self.config.controller.to_string();
        let mut full = vec![cmd, controller.as_str()];
        full.extend_from_slice(args);
        let out = self.runner.run(util, &full).await?;
        out.check(TOOL)
    }

    /// Segment locators of one LD, from its GETCONFIG report.
    async fn fetch_segments(&self, ld: &str) -> Result<Vec<PhysicalDeviceRef>> {
        let out = self.run_tool("GETCONFIG", &["LD", ld]).await?;
        let segments = parse_segments(&out.stdout);
        debug!(ld, ?segments, "segment physical devices");
        Ok(segments)
    }

    fn create_args(&self) -> Result<Vec<String>> {
        let mut args = vec![
            "LOGICALDRIVE".to_string(),
            "method".to_string(),
            "SKIP".to_string(),
        ];
        if let Some(policy) = &self.spec.read_policy {
            args.push("rcache".to_string());
            args.push(policy.clone());
        }
        if let Some(policy) = &self.spec.write_policy {
            args.push("wcache".to_string());
            args.push(policy.clone());
        }
        if let Some(strip) = self.spec.strip_size {
            args.push("stripesize".to_string());
            args.push(strip.to_string());
        }
        args.push("MAX".to_string());
        args.push(self.spec.level.to_string());
        // each channel:device reference becomes two positional tokens
        for dev in &self.spec.devices {
            let (channel, device) = dev.split_pair().ok_or_else(|| {
                Error::Configuration(format!(
                    "device reference {dev} is not in channel:device form"
                ))
            })?;
            args.push(channel.to_string());
            args.push(device.to_string());
        }
        Ok(args)
    }

    /// CREATE/DELETE report success both via exit code and a trailing
    /// phrase; require the phrase too.
    fn check_success_phrase(&self, verb: &str, out: &CommandOutput) -> Result<()> {
        if out.stdout.trim_end().ends_with(SUCCESS_PHRASE) {
            Ok(())
        } else {
            Err(Error::parse(
                TOOL,
                format!("{verb} did not report '{SUCCESS_PHRASE}'"),
            ))
        }
    }
}

#[async_trait]
impl RaidBackend for ArcconfBackend {
    fn name(&self) -> &'static str {
        TOOL
    }

    async fn initialize(&mut self) -> Result<()> {
        self.util = Some(crate::exec::locate_tool(&[TOOL])?);
        Ok(())
    }

    async fn path_exists(&mut self) -> Result<bool> {
        if let Some(id) = self.vd.clone() {
            debug!(ld = %id, "checking bound logical drive status");
            let out = self.run_tool("GETCONFIG", &["LD", &id]).await?;
            let status = parse_ld_status(&out.stdout).ok_or_else(|| {
                Error::parse(TOOL, format!("no status line for logical drive {id}"))
            })?;
            Ok(status == "Optimal")
        } else {
            debug!(devices = ?self.spec.devices, "searching for an LD serving the requested devices");
            let out = self.run_tool("GETCONFIG", &["LD"]).await?;
            if out.stdout.contains(NO_LDS_CONFIGURED) {
                info!("no logical drives configured");
                return Ok(false);
            }
            for ld in parse_ld_numbers(&out.stdout) {
                let segments = self.fetch_segments(&ld).await?;
                if same_device_set(&self.spec.devices, &segments) {
                    info!(ld = %ld, "bound existing logical drive");
                    self.vd = Some(ld);
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }

    async fn list_virtual_drives(&self) -> Result<Vec<String>> {
        let out = self.run_tool("GETCONFIG", &["LD"]).await?;
        if out.stdout.contains(NO_LDS_CONFIGURED) {
            return Ok(Vec::new());
        }
        let ids = parse_ld_numbers(&out.stdout);
        debug!(?ids, "configured logical drives");
        Ok(ids)
    }

    async fn create_virtual_drive(&mut self) -> Result<VirtualDrive> {
        let args = self.create_args()?;

        let lds_before = self.list_virtual_drives().await?;
        let bds_before = self.enumerator.snapshot().await?;

        info!(command = ?args, "creating logical drive with arcconf");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run_tool("CREATE", &arg_refs).await?;
        self.check_success_phrase("CREATE", &out)?;

        let settle = self.config.settle.clone();
        let mut discovered = None;
        for attempt in 1..=settle.attempts {
            settle.pause().await;
            let lds_after = self.list_virtual_drives().await?;
            let bds_after = self.enumerator.snapshot().await?;
            let new_lds = reconcile::new_elements(&lds_before, &lds_after);
            let new_bds = reconcile::new_elements(bds_before.names(), bds_after.names());
            if let Some(dev) =
                reconcile::confirm_new_block_device(&new_bds, &self.spec.device_path)?
            {
                let ld = new_lds.first().cloned().ok_or_else(|| {
                    Error::ReconciliationMismatch(
                        "a block device appeared but no new logical drive was reported".into(),
                    )
                })?;
                discovered = Some((ld, dev));
                break;
            }
            debug!(attempt, "logical drive not yet visible");
        }
        let (ld, dev) = discovered.ok_or_else(|| {
            settle.timeout(format!(
                "logical drive backing {}",
                self.spec.device_path.display()
            ))
        })?;

        if let Some(previous) = &self.vd {
            if previous != &ld {
                warn!(previous = %previous, new = %ld, "logical drive number changed");
            }
        }
        self.vd = Some(ld.clone());

        info!(ld = %ld, device = %dev, "created logical drive");
        Ok(VirtualDrive {
            id: ld,
            devices: self.spec.devices.clone(),
            device_path: self.spec.device_path.clone(),
            state: ReadinessState::Unknown,
            created_at: chrono::Utc::now(),
        })
    }

    async fn delete_virtual_drive(&mut self, vd: &VirtualDrive) -> Result<()> {
        let out = self
            .run_tool("DELETE", &["LOGICALDRIVE", &vd.id])
            .await?;
        self.check_success_phrase("DELETE", &out)?;
        info!(ld = %vd.id, "deleted logical drive");
        if self.vd.as_deref() == Some(vd.id.as_str()) {
            self.vd = None;
        }
        Ok(())
    }

    async fn is_ready(&self) -> Result<ReadinessState> {
        let id = self.vd.as_ref().ok_or_else(|| Error::NoBoundDrive {
            backend: TOOL.into(),
        })?;
        let out = self.run_tool("GETCONFIG", &["LD", id]).await?;
        let status = parse_ld_status(&out.stdout)
            .ok_or_else(|| Error::parse(TOOL, format!("no status line for logical drive {id}")))?;
        let state = classify_status(&status);
        debug!(ld = %id, status, %state, "logical drive readiness");
        Ok(state)
    }

    fn bound_vd(&self) -> Option<&str> {
        self.vd.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedRunner;
    use assert_matches::assert_matches;
    use std::time::Duration;

    const GETCONFIG_LD: &str = "\
Controllers found: 1
----------------------------------------------------------------------
Logical device information
----------------------------------------------------------------------
Logical Device Number 0
   Logical Device name                      : LogicalDrv 0
   RAID level                               : 1
   Status of Logical Device                 : Optimal
   Size                                     : 952720 MB
--------------------------------------------------------
Logical Device segment information
--------------------------------------------------------
   Segment 0                                : Present (Controller:1,Channel:0,Device:0)  S13PJ9BL600204
   Segment 1                                : Present (Controller:1,Channel:0,Device:1)  S13PJ9BL600205

Command completed successfully.
";

    const GETCONFIG_LD_EMPTY: &str = "\
Controllers found: 1
No logical devices configured

Command completed successfully.
";

    const GETCONFIG_LD_REBUILDING: &str = "\
Logical Device Number 0
   Status of Logical Device                 : Rebuilding
   Segment 0                                : Present (Controller:1,Channel:0,Device:0)
   Segment 1                                : Present (Controller:1,Channel:0,Device:1)

Command completed successfully.
";

    const CREATE_OK: &str = "\
Creating logical device: Device 1

Command completed successfully.
";

    fn spec() -> RaidSpec {
        RaidSpec {
            level: 1,
            device_path: PathBuf::from("/dev/sdb"),
            devices: vec!["0:0".into(), "0:1".into()],
            read_policy: None,
            write_policy: None,
            strip_size: None,
        }
    }

    fn backend_with(spec: RaidSpec, runner: Arc<ScriptedRunner>) -> ArcconfBackend {
        let config = ProvisionerConfig {
            settle: crate::reconcile::SettlePolicy {
                attempts: 3,
                interval: Duration::ZERO,
            },
            ..ProvisionerConfig::default()
        };
        let mut backend = ArcconfBackend::new(spec, config, runner);
        backend.util = Some(PathBuf::from("/usr/sbin/arcconf"));
        backend
    }

    fn backend(runner: Arc<ScriptedRunner>) -> ArcconfBackend {
        backend_with(spec(), runner)
    }

    #[test]
    fn test_parse_ld_numbers() {
        assert_eq!(parse_ld_numbers(GETCONFIG_LD), vec!["0"]);
        assert!(parse_ld_numbers(GETCONFIG_LD_EMPTY).is_empty());
    }

    #[test]
    fn test_parse_ld_status() {
        assert_eq!(parse_ld_status(GETCONFIG_LD).as_deref(), Some("Optimal"));
        assert_eq!(
            parse_ld_status(GETCONFIG_LD_REBUILDING).as_deref(),
            Some("Rebuilding")
        );
        assert_eq!(parse_ld_status(GETCONFIG_LD_EMPTY), None);
    }

    #[test]
    fn test_parse_segments() {
        assert_eq!(
            parse_segments(GETCONFIG_LD),
            vec![PhysicalDeviceRef::new("0:0"), PhysicalDeviceRef::new("0:1")]
        );
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status("Optimal"), ReadinessState::Ready);
        assert_eq!(classify_status("Okay"), ReadinessState::Ready);
        assert_eq!(classify_status("Rebuilding"), ReadinessState::Busy);
        assert_eq!(classify_status("Build/Verify"), ReadinessState::Busy);
        assert_eq!(classify_status("Initializing"), ReadinessState::Busy);
        assert_eq!(classify_status("Clearing"), ReadinessState::Busy);
        assert_eq!(classify_status("Degraded"), ReadinessState::Unknown);
    }

    #[test]
    fn test_create_args_interleaves_options_and_devices() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut spec = spec();
        spec.read_policy = Some("ron".into());
        spec.write_policy = Some("wb".into());
        spec.strip_size = Some(256);
        let backend = backend_with(spec, runner);

        assert_eq!(
            backend.create_args().unwrap(),
            vec![
                "LOGICALDRIVE",
                "method",
                "SKIP",
                "rcache",
                "ron",
                "wcache",
                "wb",
                "stripesize",
                "256",
                "MAX",
                "1",
                "0",
                "0",
                "0",
                "1",
            ]
        );
    }

    #[tokio::test]
    async fn test_path_exists_unbound_matches_device_set() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("arcconf", GETCONFIG_LD);
        runner.push_ok("arcconf", GETCONFIG_LD);

        let mut backend = backend(runner.clone());
        assert!(backend.path_exists().await.unwrap());
        assert_eq!(backend.bound_vd(), Some("0"));

        let calls = runner.calls();
        assert_eq!(calls[0].1, vec!["GETCONFIG", "0", "LD"]);
        assert_eq!(calls[1].1, vec!["GETCONFIG", "0", "LD", "0"]);
    }

    #[tokio::test]
    async fn test_path_exists_unbound_no_lds_is_false() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("arcconf", GETCONFIG_LD_EMPTY);

        let mut backend = backend(runner);
        assert!(!backend.path_exists().await.unwrap());
        assert_eq!(backend.bound_vd(), None);
    }

    #[tokio::test]
    async fn test_path_exists_bound_checks_optimal() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("arcconf", GETCONFIG_LD_REBUILDING);

        let mut backend = backend(runner);
        backend.vd = Some("0".into());
        assert!(!backend.path_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_create_discovers_ld_and_device() {
        let runner = Arc::new(ScriptedRunner::new());
        // before snapshots
        runner.push_ok("arcconf", GETCONFIG_LD_EMPTY);
        runner.push_ok("lsblk", "sda\n");
        // create
        runner.push_ok("arcconf", CREATE_OK);
        // after snapshots, first attempt
        runner.push_ok("arcconf", GETCONFIG_LD);
        runner.push_ok("lsblk", "sda\nsdb\n");

        let mut backend = backend(runner.clone());
        let vd = backend.create_virtual_drive().await.unwrap();
        assert_eq!(vd.id, "0");
        assert_eq!(vd.device_path, PathBuf::from("/dev/sdb"));
        assert_eq!(backend.bound_vd(), Some("0"));

        let calls = runner.calls();
        assert_eq!(
            calls[2].1,
            vec![
                "CREATE",
                "0",
                "LOGICALDRIVE",
                "method",
                "SKIP",
                "MAX",
                "1",
                "0",
                "0",
                "0",
                "1",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_rejects_missing_success_phrase() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("arcconf", GETCONFIG_LD_EMPTY);
        runner.push_ok("lsblk", "sda\n");
        runner.push_ok("arcconf", "Creating logical device: Device 1\n");

        let mut backend = backend(runner);
        let err = backend.create_virtual_drive().await.unwrap_err();
        assert_matches!(err, Error::Parse { .. });
    }

    #[tokio::test]
    async fn test_create_wrong_device_is_mismatch() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("arcconf", GETCONFIG_LD_EMPTY);
        runner.push_ok("lsblk", "sda\n");
        runner.push_ok("arcconf", CREATE_OK);
        runner.push_ok("arcconf", GETCONFIG_LD);
        // the new node is not the requested path
        runner.push_ok("lsblk", "sda\nsdc\n");

        let mut backend = backend(runner);
        let err = backend.create_virtual_drive().await.unwrap_err();
        assert_matches!(err, Error::ReconciliationMismatch(_));
        assert_eq!(backend.bound_vd(), None);
    }

    #[tokio::test]
    async fn test_delete_requires_success_phrase() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("arcconf", "Deleting: logical device 0\n");

        let mut backend = backend(runner.clone());
        backend.vd = Some("0".into());
        let vd = VirtualDrive {
            id: "0".into(),
            devices: spec().devices,
            device_path: PathBuf::from("/dev/sdb"),
            state: ReadinessState::Ready,
            created_at: chrono::Utc::now(),
        };
        let err = backend.delete_virtual_drive(&vd).await.unwrap_err();
        assert_matches!(err, Error::Parse { .. });
        // binding survives a failed delete
        assert_eq!(backend.bound_vd(), Some("0"));
        assert_eq!(runner.calls()[0].1, vec!["DELETE", "0", "LOGICALDRIVE", "0"]);
    }

    #[tokio::test]
    async fn test_delete_clears_binding() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("arcconf", "Deleting: logical device 0\n\nCommand completed successfully.\n");

        let mut backend = backend(runner);
        backend.vd = Some("0".into());
        let vd = VirtualDrive {
            id: "0".into(),
            devices: spec().devices,
            device_path: PathBuf::from("/dev/sdb"),
            state: ReadinessState::Ready,
            created_at: chrono::Utc::now(),
        };
        backend.delete_virtual_drive(&vd).await.unwrap();
        assert_eq!(backend.bound_vd(), None);
    }

    #[tokio::test]
    async fn test_is_ready_states() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("arcconf", GETCONFIG_LD_REBUILDING);
        runner.push_ok("arcconf", GETCONFIG_LD);

        let mut backend = backend(runner);
        backend.vd = Some("0".into());
        assert_eq!(backend.is_ready().await.unwrap(), ReadinessState::Busy);
        assert_eq!(backend.is_ready().await.unwrap(), ReadinessState::Ready);
    }

    #[tokio::test]
    async fn test_is_ready_requires_binding() {
        let runner = Arc::new(ScriptedRunner::new());
        let backend = backend(runner);
        let err = backend.is_ready().await.unwrap_err();
        assert_matches!(err, Error::NoBoundDrive { .. });
    }

    #[tokio::test]
    async fn test_round_trip_lifecycle() {
        let runner = Arc::new(ScriptedRunner::new());
        // nothing configured yet
        runner.push_ok("arcconf", GETCONFIG_LD_EMPTY);
        // create: before snapshots, command, after snapshots
        runner.push_ok("arcconf", GETCONFIG_LD_EMPTY);
        runner.push_ok("lsblk", "sda\n");
        runner.push_ok("arcconf", CREATE_OK);
        runner.push_ok("arcconf", GETCONFIG_LD);
        runner.push_ok("lsblk", "sda\nsdb\n");
        // delete
        runner.push_ok(
            "arcconf",
            "Deleting: logical device 0\n\nCommand completed successfully.\n",
        );
        // drive and device are gone again
        runner.push_ok("arcconf", GETCONFIG_LD_EMPTY);

        let mut backend = backend(runner.clone());
        assert!(!backend.path_exists().await.unwrap());

        let vd = backend.create_virtual_drive().await.unwrap();
        assert_eq!(vd.id, "0");
        assert_eq!(backend.bound_vd(), Some("0"));

        backend.delete_virtual_drive(&vd).await.unwrap();
        assert_eq!(backend.bound_vd(), None);

        assert!(!backend.path_exists().await.unwrap());
        assert_eq!(runner.remaining(), 0);
    }
}
