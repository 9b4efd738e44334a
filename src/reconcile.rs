//! Reconciliation Helpers
//!
//! The shared discovery pattern every backend follows around creation:
//! snapshot virtual drive identifiers and OS block devices before the
//! controller command, snapshot again afterwards, and resolve the new
//! entities by set difference. Exactly one new block device must appear
//! and it must be the requested path; anything else risks pointing the
//! benchmark at the wrong device and is fatal.
//!
//! The OS publishes device nodes asynchronously, so the post-command
//! snapshot is retried under a bounded [`SettlePolicy`] instead of a
//! fixed sleep, failing with a descriptive timeout when exhausted.

use crate::domain::ports::PhysicalDeviceRef;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Settle Policy
// =============================================================================

/// Bounded poll/retry policy for post-operation device discovery.
#[derive(Debug, Clone)]
pub struct SettlePolicy {
    /// Maximum number of snapshot attempts after the operation
    pub attempts: u32,
    /// Pause before each attempt
    pub interval: Duration,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

impl SettlePolicy {
    /// Wait one polling interval.
    pub async fn pause(&self) {
        tokio::time::sleep(self.interval).await;
    }

    /// The error reported when every attempt came up empty.
    pub fn timeout(&self, what: impl Into<String>) -> Error {
        Error::SettleTimeout {
            what: what.into(),
            attempts: self.attempts,
        }
    }
}

// =============================================================================
// Set-Difference Discovery
// =============================================================================

/// Elements of `after` not present in `before`, in `after` order.
///
/// Order is preserved so a controller's own listing order decides which
/// identifier is reported first when several appear at once.
pub fn new_elements(before: &[String], after: &[String]) -> Vec<String> {
    after
        .iter()
        .filter(|item| !before.contains(item))
        .cloned()
        .collect()
}

/// Enforce the single-new-device invariant against the requested path.
///
/// Returns `Ok(None)` while no new device has appeared (the caller polls
/// again under its settle policy). More than one new device, or a single
/// new device that is not the requested path, is a fatal
/// [`Error::ReconciliationMismatch`].
pub fn confirm_new_block_device(new_devices: &[String], expected: &Path) -> Result<Option<String>> {
    match new_devices {
        [] => Ok(None),
        [name] => {
            let path = PathBuf::from("/dev").join(name);
            if path == expected {
                Ok(Some(name.clone()))
            } else {
                Err(Error::ReconciliationMismatch(format!(
                    "new block device {} does not match requested path {}",
                    path.display(),
                    expected.display()
                )))
            }
        }
        many => Err(Error::ReconciliationMismatch(format!(
            "expected exactly one new block device, found {}: {:?}",
            many.len(),
            many
        ))),
    }
}

/// Whether a controller-reported member list serves exactly the requested
/// physical devices.
///
/// Order does not matter, cardinality and identity do: a superset or
/// subset of the requested devices is a different drive.
pub fn same_device_set(requested: &[PhysicalDeviceRef], reported: &[PhysicalDeviceRef]) -> bool {
    let requested: BTreeSet<_> = requested.iter().collect();
    let reported: BTreeSet<_> = reported.iter().collect();
    requested == reported
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_elements_preserves_order() {
        let before = names(&["sda", "sdb"]);
        let after = names(&["sdd", "sda", "sdb", "sdc"]);
        assert_eq!(new_elements(&before, &after), names(&["sdd", "sdc"]));
    }

    #[test]
    fn test_new_elements_empty_when_unchanged() {
        let devs = names(&["sda"]);
        assert!(new_elements(&devs, &devs).is_empty());
    }

    #[test]
    fn test_confirm_single_matching_device() {
        let found = confirm_new_block_device(&names(&["sdb"]), Path::new("/dev/sdb")).unwrap();
        assert_eq!(found.as_deref(), Some("sdb"));
    }

    #[test]
    fn test_confirm_none_yet() {
        assert_eq!(
            confirm_new_block_device(&[], Path::new("/dev/sdb")).unwrap(),
            None
        );
    }

    #[test]
    fn test_confirm_rejects_wrong_device() {
        let err = confirm_new_block_device(&names(&["sdc"]), Path::new("/dev/sdb")).unwrap_err();
        assert!(matches!(err, Error::ReconciliationMismatch(_)));
    }

    #[test]
    fn test_confirm_rejects_multiple_devices() {
        let err =
            confirm_new_block_device(&names(&["sdb", "sdc"]), Path::new("/dev/sdb")).unwrap_err();
        assert!(matches!(err, Error::ReconciliationMismatch(_)));
    }

    #[test]
    fn test_same_device_set_ignores_order() {
        let requested: Vec<PhysicalDeviceRef> = vec!["252:1".into(), "252:2".into()];
        let reported: Vec<PhysicalDeviceRef> = vec!["252:2".into(), "252:1".into()];
        assert!(same_device_set(&requested, &reported));
    }

    #[test]
    fn test_same_device_set_rejects_superset_and_subset() {
        let requested: Vec<PhysicalDeviceRef> = vec!["252:1".into(), "252:2".into()];
        let superset: Vec<PhysicalDeviceRef> =
            vec!["252:1".into(), "252:2".into(), "252:3".into()];
        let subset: Vec<PhysicalDeviceRef> = vec!["252:1".into()];
        assert!(!same_device_set(&requested, &superset));
        assert!(!same_device_set(&requested, &subset));
    }

    #[test]
    fn test_settle_policy_timeout_error() {
        let policy = SettlePolicy::default();
        let err = policy.timeout("virtual drive");
        assert!(matches!(
            err,
            Error::SettleTimeout { attempts: 10, .. }
        ));
    }
}
