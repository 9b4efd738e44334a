//! MegaRAID (storcli) Backend
//!
//! Drives a Broadcom/LSI controller through the storcli command line. The
//! tool emits free-form report text; each query is covered by a small line
//! grammar below so an unexpected layout surfaces as a parse error instead
//! of a silent misread.
//!
//! Virtual drive identifiers use the controller's `DG/VD` notation (e.g.
//! `0/3`); physical devices are addressed as `enclosure:slot`.

use crate::backends::ProvisionerConfig;
use crate::domain::ports::{
    CommandRunner, PhysicalDeviceRef, RaidBackend, RaidSpec, ReadinessState, VirtualDrive,
};
use crate::error::{Error, Result};
use crate::hardware::BlockDeviceEnumerator;
use crate::reconcile::{self, same_device_set};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

const TOOL: &str = "storcli";

/// Sentinel description the controller prints when no VDs exist.
const NO_VDS_CONFIGURED: &str = "No VDs have been configured";

/// Phrase marking an idle rebuild/init status line.
const NOT_IN_PROGRESS: &str = "Not in progress";

// =============================================================================
// Line Grammar
// =============================================================================

/// `Description = <free text>` in a show report.
static DESCRIPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Description = (.+)$").expect("valid pattern"));

/// `Status = <token>` in a show report.
static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Status = (\w+)$").expect("valid pattern"));

/// Header introducing the member list of one VD: `PDs for VD 3 :`
static PDS_FOR_VD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PDs for VD (\d+) :$").expect("valid pattern"));

/// Member table row, keyed by its leading `enclosure:slot` locator.
static MEMBER_ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+:\d+)").expect("valid pattern"));

/// Rebuild status row: `/c0/e252/s1 ...`
static REBUILD_ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/c\d+/e(\d+)/s(\d+)").expect("valid pattern"));

/// A bound VD id in DG/VD notation, capturing the VD number.
static VD_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+/(\d+)").expect("valid pattern"));

/// The VD number of a `DG/VD` identifier such as `0/3`.
fn vd_number(id: &str) -> Result<String> {
    VD_ID_RE
        .captures(id)
        .map(|c| c[1].to_string())
        .ok_or_else(|| Error::parse(TOOL, format!("virtual drive id {id} is not in DG/VD form")))
}

/// Classify a single-VD show report as healthy/unhealthy.
///
/// Two fields are consulted: the free-text `Description` (the no-VDs
/// sentinel means absent) and the `Status` token (`Failure` means
/// unhealthy). Whichever appears later in the report wins. `None` means
/// neither field was present.
fn classify_vd_health(report: &str) -> Option<bool> {
    let mut health = None;
    for line in report.lines() {
        if let Some(caps) = DESCRIPTION_RE.captures(line) {
            health = Some(caps[1].trim() != NO_VDS_CONFIGURED);
        }
        if let Some(caps) = STATUS_RE.captures(line) {
            health = Some(&caps[1] != "Failure");
        }
    }
    health
}

/// Extract `enclosure:slot` member locators from a single-VD show report.
fn parse_member_pds(report: &str) -> Vec<PhysicalDeviceRef> {
    report
        .lines()
        .filter_map(|line| MEMBER_ROW_RE.captures(line))
        .map(|caps| PhysicalDeviceRef::new(&caps[1]))
        .collect()
}

/// Extract VD identifiers from `/call /vall show` output.
///
/// Two filtering stages: isolate the blank-line separated blocks that carry
/// the VD table (recognized by the `TYPE ` column header), then take the
/// leading token of each row that starts with a digit.
fn extract_vd_ids(report: &str) -> Vec<String> {
    report
        .split("\n\n")
        .filter(|block| block.contains("TYPE "))
        .flat_map(|block| block.lines())
        .filter(|line| line.starts_with(|c: char| c.is_ascii_digit()))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Scan per-PD rebuild rows for the requested member devices.
///
/// Returns the ready/busy verdict of the last matching row, or `None` if
/// no row covered a requested device.
fn rebuild_readiness(report: &str, devices: &[PhysicalDeviceRef]) -> Option<bool> {
    let mut ready = None;
    for line in report.lines() {
        if let Some(caps) = REBUILD_ROW_RE.captures(line) {
            let locator = format!("{}:{}", &caps[1], &caps[2]);
            if devices.iter().any(|d| d.as_str() == locator) {
                debug!(line, "rebuild status");
                ready = Some(line.contains(NOT_IN_PROGRESS));
            }
        }
    }
    ready
}

/// Scan VD init rows (`<N> INIT ...`) for the given VD number.
///
/// Matched on the row's leading tokens so VD 1 cannot pick up an
/// `11 INIT` row.
fn init_readiness(report: &str, vd_num: &str) -> Option<bool> {
    let mut ready = None;
    for line in report.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() == Some(vd_num) && tokens.next() == Some("INIT") {
            debug!(line, "init status");
            ready = Some(line.contains(NOT_IN_PROGRESS));
        }
    }
    ready
}

/// Merge the rebuild and init verdicts into one readiness state.
///
/// The init check is the more recent authoritative source and overrides
/// the rebuild check, except that a conflict between the two resolves to
/// busy: controller semantics for disagreeing reports are unconfirmed, and
/// treating an uncertain drive as ready would skew the benchmark.
fn combine_readiness(rebuild: Option<bool>, init: Option<bool>) -> ReadinessState {
    let state = |ready| {
        if ready {
            ReadinessState::Ready
        } else {
            ReadinessState::Busy
        }
    };
    match (rebuild, init) {
        (Some(a), Some(b)) if a != b => ReadinessState::Busy,
        (_, Some(b)) => state(b),
        (Some(a), None) => state(a),
        (None, None) => ReadinessState::Unknown,
    }
}

// =============================================================================
// storcli Backend
// =============================================================================

/// Adapter for MegaRAID controllers via storcli.
pub struct StorcliBackend {
    spec: RaidSpec,
    config: ProvisionerConfig,
    runner: Arc<dyn CommandRunner>,
    enumerator: BlockDeviceEnumerator,
    util: Option<PathBuf>,
    /// The bound virtual drive in DG/VD notation, set by discovery/creation
    vd: Option<String>,
}

impl StorcliBackend {
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

    fn controller_path(&self) -> String {
        format!("/c{}", self.config.controller)
    }

    async fn run_tool(&self, args: &[&str]) -> Result<crate::domain::ports::CommandOutput> {
        let util = self
            .util
            .as_deref()
            .ok_or_else(|| Error::Internal("storcli backend used before initialize".into()))?;
        let out = self.runner.run(util, args).await?;
        out.check(TOOL)
    }

    /// Member locators of one VD, from its show-all report.
    async fn fetch_member_pds(&self, vd_num: &str) -> Result<Vec<PhysicalDeviceRef>> {
        let target = format!("{}/v{vd_num}", self.controller_path());
        let out = self.run_tool(&[&target, "show", "all"]).await?;
        let pds = parse_member_pds(&out.stdout);
        debug!(vd = vd_num, ?pds, "member physical devices");
        Ok(pds)
    }

    fn create_args(&self) -> Result<Vec<String>> {
        let pair = |dev: &PhysicalDeviceRef| {
            dev.split_pair()
                .map(|(enc, slot)| (enc.to_string(), slot.to_string()))
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "device reference {dev} is not in enclosure:slot form"
                    ))
                })
        };

        let (enclosure, _) = pair(&self.spec.devices[0])?;
        let mut slots = Vec::new();
        for dev in &self.spec.devices {
            let (_, slot) = pair(dev)?;
            slots.push(slot);
        }

        let mut args = vec![
            self.controller_path(),
            "add".to_string(),
            "vd".to_string(),
            format!("type=r{}", self.spec.level),
            format!("drives={}:{}", enclosure, slots.join(",")),
        ];
        // RAID 10 needs the span layout spelled out
        if self.spec.level == 10 {
            args.push("PDperArray=2".to_string());
        }
        if let Some(policy) = &self.spec.read_policy {
            args.push(policy.clone());
        }
        if let Some(policy) = &self.spec.write_policy {
            args.push(policy.clone());
        }
        if let Some(strip) = self.spec.strip_size {
            args.push(format!("strip={strip}"));
        }
        Ok(args)
    }

    /// Turn off automatic background initialization on a new VD so the
    /// scrub does not run underneath later performance measurements.
    async fn disable_background_init(&self, vd_id: &str) -> Result<()> {
        let vd_num = vd_number(vd_id)?;
        let target = format!("{}/v{vd_num}", self.controller_path());
        self.run_tool(&[&target, "set", "autobgi=off"]).await?;
        info!(vd = vd_id, "disabled background initialization");
        Ok(())
    }
}

#[async_trait]
impl RaidBackend for StorcliBackend {
    fn name(&self) -> &'static str {
        TOOL
    }

    async fn initialize(&mut self) -> Result<()> {
        self.util = Some(crate::exec::locate_tool(&[TOOL, "storcli64"])?);
        Ok(())
    }

    async fn path_exists(&mut self) -> Result<bool> {
        if let Some(id) = self.vd.clone() {
            debug!(vd = %id, "checking bound virtual drive health");
            let vd_num = vd_number(&id)?;
            let target = format!("{}/v{vd_num}", self.controller_path());
            let out = self.run_tool(&[&target, "show", "all"]).await?;
            classify_vd_health(&out.stdout).ok_or_else(|| {
                Error::parse(TOOL, format!("no Description or Status line for VD {id}"))
            })
        } else {
            debug!(devices = ?self.spec.devices, "searching for a VD serving the requested devices");
            let target = format!("{}/vall", self.controller_path());
            let out = self.run_tool(&[&target, "show", "all"]).await?;
            for line in out.stdout.lines() {
                if let Some(caps) = DESCRIPTION_RE.captures(line) {
                    if caps[1].trim() == NO_VDS_CONFIGURED {
                        info!("no virtual drives configured");
                        return Ok(false);
                    }
                }
                if let Some(caps) = PDS_FOR_VD_RE.captures(line) {
                    let vd_num = caps[1].to_string();
                    let pds = self.fetch_member_pds(&vd_num).await?;
                    if same_device_set(&self.spec.devices, &pds) {
                        let id = format!("0/{vd_num}");
                        info!(vd = %id, "bound existing virtual drive");
                        self.vd = Some(id);
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
    }

    async fn list_virtual_drives(&self) -> Result<Vec<String>> {
        let out = self.run_tool(&["/call", "/vall", "show"]).await?;
        let ids = extract_vd_ids(&out.stdout);
        debug!(?ids, "configured virtual drives");
        Ok(ids)
    }

    async fn create_virtual_drive(&mut self) -> Result<VirtualDrive> {
        let args = self.create_args()?;

        let vds_before = self.list_virtual_drives().await?;
        let bds_before = self.enumerator.snapshot().await?;

        info!(command = ?args, "creating virtual drive with storcli");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_tool(&arg_refs).await?;

        let settle = self.config.settle.clone();
        let mut discovered = None;
        for attempt in 1..=settle.attempts {
            settle.pause().await;
            let vds_after = self.list_virtual_drives().await?;
            let bds_after = self.enumerator.snapshot().await?;
            let new_vds = reconcile::new_elements(&vds_before, &vds_after);
            let new_bds = reconcile::new_elements(bds_before.names(), bds_after.names());
            if let Some(dev) =
                reconcile::confirm_new_block_device(&new_bds, &self.spec.device_path)?
            {
                let vd_id = new_vds.first().cloned().ok_or_else(|| {
                    Error::ReconciliationMismatch(
                        "a block device appeared but no new virtual drive was reported".into(),
                    )
                })?;
                discovered = Some((vd_id, dev));
                break;
            }
            debug!(attempt, "virtual drive not yet visible");
        }
        let (vd_id, dev) = discovered.ok_or_else(|| {
            settle.timeout(format!(
                "virtual drive backing {}",
                self.spec.device_path.display()
            ))
        })?;

        if let Some(previous) = &self.vd {
            if previous != &vd_id {
                warn!(previous = %previous, new = %vd_id, "virtual drive identifier changed");
            }
        }
        self.vd = Some(vd_id.clone());

        self.disable_background_init(&vd_id).await?;

        info!(vd = %vd_id, device = %dev, "created virtual drive");
        Ok(VirtualDrive {
            id: vd_id,
            devices: self.spec.devices.clone(),
            device_path: self.spec.device_path.clone(),
            state: ReadinessState::Unknown,
            created_at: chrono::Utc::now(),
        })
    }

    async fn delete_virtual_drive(&mut self, vd: &VirtualDrive) -> Result<()> {
        let vd_num = vd_number(&vd.id)?;
        let target = format!("{}/v{vd_num}", self.controller_path());
        self.run_tool(&[&target, "del", "force"]).await?;
        info!(vd = %vd.id, "deleted virtual drive");
        if self.vd.as_deref() == Some(vd.id.as_str()) {
            self.vd = None;
        }
        Ok(())
    }

    async fn is_ready(&self) -> Result<ReadinessState> {
        let id = self.vd.as_ref().ok_or_else(|| Error::NoBoundDrive {
            backend: TOOL.into(),
        })?;

        let slots = format!("{}/eall/sall", self.controller_path());
        let out = self.run_tool(&[&slots, "show", "rebuild"]).await?;
        let rebuild = rebuild_readiness(&out.stdout, &self.spec.devices);

        let vd_num = vd_number(id)?;
        let vd_target = format!("/v{vd_num}");
        let out = self.run_tool(&["/call", &vd_target, "show", "init"]).await?;
        let init = init_readiness(&out.stdout, &vd_num);

        Ok(combine_readiness(rebuild, init))
    }

    fn bound_vd(&self) -> Option<&str> {
        self.vd.as_deref()
    }
}
