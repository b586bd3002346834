//! Upgrade cycle state machine
//!
//! One `UpgradeCycle` tracks one upgrade attempt for one module:
//!
//! ```text
//! Idle -> AwaitingPackageOffer -> Downloading -> Verifying -> Reporting -> Succeeded
//!                                      |             |            |
//!                                      +-------------+------------+----> Failed
//! ```
//!
//! `Downloading -> Reporting` is taken when the offer names no sign method.
//! A pushed upgrade starts at `Idle -> Downloading`.

use chrono::{DateTime, Utc};
use ota_common::{Error, EventId, EventMeta, Result, UpgradeParameters, UpgradeStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::time::Instant;
use uuid::Uuid;

/// Cycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    AwaitingPackageOffer,
    Downloading,
    Verifying,
    Reporting,
    Succeeded,
    Failed,
}

impl CyclePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, CyclePhase::Succeeded | CyclePhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::AwaitingPackageOffer => "awaiting_package_offer",
            CyclePhase::Downloading => "downloading",
            CyclePhase::Verifying => "verifying",
            CyclePhase::Reporting => "reporting",
            CyclePhase::Succeeded => "succeeded",
            CyclePhase::Failed => "failed",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upgrade attempt for one module
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeCycle {
    pub cycle_id: Uuid,

    pub module: String,

    /// Event id of the request that opened the cycle
    pub event_id: EventId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_device_id: Option<String>,

    pub phase: CyclePhase,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<UpgradeParameters>,

    /// Downloaded file; kept on disk even when verification fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether the single `UpgradeStatus` of this cycle has been produced
    pub status_reported: bool,

    pub started_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    deadline: Option<Instant>,
}

impl UpgradeCycle {
    pub fn new(module: impl Into<String>, meta: &EventMeta) -> Self {
        let now = Utc::now();
        Self {
            cycle_id: Uuid::new_v4(),
            module: module.into(),
            event_id: meta.event_id.clone(),
            object_device_id: meta.object_device_id.clone(),
            phase: CyclePhase::Idle,
            params: None,
            artifact: None,
            error: None,
            status_reported: false,
            started_at: now,
            updated_at: now,
            finished_at: None,
            deadline: None,
        }
    }

    fn transition(&mut self, allowed: &[CyclePhase], to: CyclePhase) -> Result<()> {
        if !allowed.contains(&self.phase) {
            return Err(Error::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }

        self.phase = to;
        self.updated_at = Utc::now();
        if to.is_terminal() {
            self.finished_at = Some(self.updated_at);
            self.deadline = None;
        }
        Ok(())
    }

    /// A package request went out
    pub fn await_offer(&mut self, deadline: Instant) -> Result<()> {
        self.transition(&[CyclePhase::Idle], CyclePhase::AwaitingPackageOffer)?;
        self.deadline = Some(deadline);
        Ok(())
    }

    /// The platform offered a package (or pushed one)
    ///
    /// No deadline runs while the download is queued behind another module.
    pub fn accept_offer(&mut self, params: UpgradeParameters) -> Result<()> {
        self.transition(
            &[CyclePhase::Idle, CyclePhase::AwaitingPackageOffer],
            CyclePhase::Downloading,
        )?;
        self.params = Some(params);
        self.deadline = None;
        Ok(())
    }

    /// The fetch task owns the download directory; the transfer clock starts
    pub fn start_transfer(&mut self, deadline: Instant) -> Result<()> {
        if self.phase != CyclePhase::Downloading {
            return Err(Error::InvalidTransition {
                from: self.phase.to_string(),
                to: CyclePhase::Downloading.to_string(),
            });
        }
        self.deadline = Some(deadline);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The package is on disk
    pub fn downloaded(&mut self, artifact: PathBuf, verify: bool) -> Result<()> {
        let next = if verify {
            CyclePhase::Verifying
        } else {
            CyclePhase::Reporting
        };
        self.transition(&[CyclePhase::Downloading], next)?;
        self.artifact = Some(artifact);
        Ok(())
    }

    /// The package passed verification
    pub fn verified(&mut self) -> Result<()> {
        self.transition(&[CyclePhase::Verifying], CyclePhase::Reporting)
    }

    /// Produce this cycle's one and only `UpgradeStatus`
    ///
    /// `outcome` is `Err(reason)` for a failed upgrade. Fails if the cycle
    /// never received upgrade parameters or already produced its status.
    pub fn take_status(&mut self, outcome: std::result::Result<(), &str>) -> Result<UpgradeStatus> {
        let allowed = [
            CyclePhase::Downloading,
            CyclePhase::Verifying,
            CyclePhase::Reporting,
        ];
        if self.status_reported || self.params.is_none() || !allowed.contains(&self.phase) {
            return Err(Error::InvalidTransition {
                from: self.phase.to_string(),
                to: "status_reported".to_string(),
            });
        }

        self.status_reported = true;
        let meta = EventMeta::new(self.event_id.clone())
            .for_device(self.object_device_id.clone())
            .now();

        Ok(match outcome {
            Ok(()) => UpgradeStatus::success(self.module.clone(), meta),
            Err(reason) => UpgradeStatus::failure(self.module.clone(), meta, reason),
        })
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.transition(&[CyclePhase::Reporting], CyclePhase::Succeeded)
    }

    /// End the cycle as failed from any non-terminal phase
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(
            &[
                CyclePhase::Idle,
                CyclePhase::AwaitingPackageOffer,
                CyclePhase::Downloading,
                CyclePhase::Verifying,
                CyclePhase::Reporting,
            ],
            CyclePhase::Failed,
        )?;
        self.error = Some(reason.into());
        Ok(())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    pub fn target_version(&self) -> Option<&str> {
        self.params.as_ref().map(|p| p.version.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params(sign_method: Option<&str>) -> UpgradeParameters {
        UpgradeParameters {
            url: "http://x/pkg.bin".to_string(),
            sign: "abc".to_string(),
            sign_method: sign_method.map(str::to_string),
            module: "mcu".to_string(),
            version: "v2.0.0".to_string(),
            file_name: None,
            file_size: None,
        }
    }

    fn cycle() -> UpgradeCycle {
        UpgradeCycle::new("mcu", &EventMeta::new(EventId::new("E1")))
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_full_success_path() {
        let mut c = cycle();
        c.await_offer(later()).unwrap();
        c.accept_offer(params(Some("SHA256"))).unwrap();
        c.downloaded(PathBuf::from("./pkg.bin"), true).unwrap();
        assert_eq!(c.phase, CyclePhase::Verifying);
        c.verified().unwrap();

        let status = c.take_status(Ok(())).unwrap();
        assert_eq!(status.result_code, 0);
        assert_eq!(status.meta.event_id.as_str(), "E1");

        c.succeed().unwrap();
        assert_eq!(c.phase, CyclePhase::Succeeded);
        assert!(c.finished_at.is_some());
        assert_eq!(c.target_version(), Some("v2.0.0"));
    }

    #[test]
    fn test_unverified_download_goes_straight_to_reporting() {
        let mut c = cycle();
        c.accept_offer(params(None)).unwrap();
        c.downloaded(PathBuf::from("./pkg.bin"), false).unwrap();
        assert_eq!(c.phase, CyclePhase::Reporting);
    }

    #[test]
    fn test_status_is_produced_once() {
        let mut c = cycle();
        c.accept_offer(params(None)).unwrap();

        assert!(c.take_status(Err("download failed")).is_ok());
        assert!(c.take_status(Err("download failed")).is_err());
        assert!(c.take_status(Ok(())).is_err());
    }

    #[test]
    fn test_no_status_without_parameters() {
        let mut c = cycle();
        c.await_offer(later()).unwrap();
        assert!(c.take_status(Err("rejected")).is_err());
        assert!(!c.status_reported);
    }

    #[test]
    fn test_terminal_phases_are_final() {
        let mut c = cycle();
        c.fail("offer rejected").unwrap();

        assert!(c.fail("again").is_err());
        assert!(c.await_offer(later()).is_err());
        assert!(matches!(
            c.accept_offer(params(None)),
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(c.error.as_deref(), Some("offer rejected"));
    }

    #[test]
    fn test_verify_requires_verifying_phase() {
        let mut c = cycle();
        c.accept_offer(params(None)).unwrap();
        assert!(c.verified().is_err());
        assert!(c.succeed().is_err());
    }

    #[test]
    fn test_queued_download_has_no_deadline() {
        let mut c = cycle();
        let now = Instant::now();
        c.await_offer(now).unwrap();
        c.accept_offer(params(None)).unwrap();
        assert!(!c.is_expired(now + Duration::from_secs(3600)));

        c.start_transfer(now).unwrap();
        assert!(c.is_expired(now));
    }

    #[test]
    fn test_start_transfer_requires_downloading() {
        let mut c = cycle();
        assert!(c.start_transfer(later()).is_err());

        c.accept_offer(params(None)).unwrap();
        c.downloaded(PathBuf::from("./pkg.bin"), true).unwrap();
        assert!(c.start_transfer(later()).is_err());
    }

    #[test]
    fn test_deadline_expiry() {
        let mut c = cycle();
        let now = Instant::now();
        assert!(!c.is_expired(now));

        c.await_offer(now).unwrap();
        assert!(c.is_expired(now));

        c.fail("timed out").unwrap();
        assert!(!c.is_expired(now + Duration::from_secs(1)));
    }
}
