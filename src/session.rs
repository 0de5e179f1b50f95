use log::{debug, info, warn};
use serde::Serialize;

use crate::config::TrackerConfig;
use crate::error::TrackerResult;
use crate::filters::TagFilterStatus;
use crate::frames::Calibration;
use crate::pose_log::{LogStats, PoseLog};
use crate::publisher::PosePublisher;
use crate::tracker::{CycleStatus, FilterBank, FilterSettings};
use crate::types::{Detection, Extrinsics, Timestamp, VehicleState};

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionMode {
    /// No camera mount known yet; cycles do nothing
    WaitingForExtrinsics,
    /// Calibrated and tracking
    Running,
}

/// Counters reported at the end of a session
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSummary {
    pub cycles: u64,
    pub paused_cycles: u64,
    pub tags: Vec<TagFilterStatus>,
    pub log: Option<LogStats>,
}

/// Tracking session: calibration, filter bank and optional state log.
pub struct Session {
    config: TrackerConfig,
    settings: FilterSettings,
    calibration: Option<Calibration>,
    bank: FilterBank,
    log: Option<PoseLog>,
    cycles: u64,
    paused_cycles: u64,
}

impl Session {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            settings: config.filter_settings(),
            config,
            calibration: None,
            bank: FilterBank::new(),
            log: None,
            cycles: 0,
            paused_cycles: 0,
        }
    }

    /// Session with the state log opened from `config.log.path`, if set.
    pub fn with_config_log(config: TrackerConfig) -> TrackerResult<Self> {
        let log = match &config.log.path {
            Some(path) => Some(PoseLog::create(path, config.log.decimation)?),
            None => None,
        };
        let mut session = Self::new(config);
        session.log = log;
        Ok(session)
    }

    pub fn attach_log(&mut self, log: PoseLog) {
        self.log = Some(log);
    }

    pub fn mode(&self) -> SessionMode {
        if self.calibration.is_some() {
            SessionMode::Running
        } else {
            SessionMode::WaitingForExtrinsics
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub fn bank(&self) -> &FilterBank {
        &self.bank
    }

    pub fn log_stats(&self) -> Option<LogStats> {
        self.log.as_ref().map(|l| l.stats())
    }

    /// Replace the camera mount. Tag estimates are kept.
    pub fn set_extrinsics(&mut self, extrinsics: &Extrinsics) {
        let calibration = match &self.calibration {
            Some(current) => current.with_extrinsics(extrinsics),
            None => {
                info!(
                    "Extrinsics received: t={:?} rpy={:?}",
                    extrinsics.translation, extrinsics.rotation
                );
                Calibration::new(&self.config.intrinsics, extrinsics)
            }
        };
        self.calibration = Some(calibration);
    }

    /// Detections arriving before the first extrinsics are dropped.
    pub fn push_detection(&mut self, detection: Detection) {
        if self.calibration.is_none() {
            debug!("Tag {} dropped: waiting for extrinsics", detection.id);
            return;
        }
        self.bank.push_detection(detection);
    }

    /// Run one control cycle.
    pub fn cycle<P: PosePublisher + ?Sized>(
        &mut self,
        vehicle: Option<&VehicleState>,
        now: Timestamp,
        publisher: &mut P,
    ) -> CycleStatus {
        self.cycles += 1;

        let Some(calibration) = &self.calibration else {
            self.paused_cycles += 1;
            self.bank.clear_detections();
            return CycleStatus::Paused;
        };

        let status = self
            .bank
            .step(calibration, &self.settings, vehicle, now, publisher);

        if status == CycleStatus::DataAvailable {
            if let Some(log) = self.log.as_mut() {
                log.record(now, &self.bank.snapshot());
            }
        }
        status
    }

    /// End the session, draining the state log.
    pub fn finish(mut self) -> SessionSummary {
        let log = self.log.take().map(|log| log.finish());
        if let Some(stats) = &log {
            if stats.failed {
                warn!("Tag log was disabled during the session");
            }
        }
        SessionSummary {
            cycles: self.cycles,
            paused_cycles: self.paused_cycles,
            tags: self.bank.filters().map(|f| f.status()).collect(),
            log,
        }
    }
}
