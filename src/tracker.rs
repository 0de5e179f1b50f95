use std::collections::HashMap;

use log::{debug, info, warn};

use crate::filters::tag_ekf::TagFilter;
use crate::filters::MeasurementModel;
use crate::frames::{camera_to_world, camera_twist, Calibration, VehiclePose};
use crate::publisher::PosePublisher;
use crate::types::{
    unpack_symmetric, Detection, StateCov, StateVec, TagId, TagPose, Timestamp, Twist,
    VehicleState,
};

/// Per-cycle filter parameters
#[derive(Clone, Debug, PartialEq)]
pub struct FilterSettings {
    /// Control period [s]
    pub dt: f64,
    /// Diagonal process noise used without vehicle state
    pub fallback_process_noise: f64,
    /// Diagonal seed covariance when the first detection's covariance is unusable
    pub initial_variance: f64,
    pub measurement: MeasurementModel,
}

/// Outcome of one control cycle, used by the caller to schedule logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleStatus {
    /// Calibration not available yet; nothing ran
    Paused,
    /// Ran, but no tag holds an estimate
    Idle,
    /// At least one tag holds an estimate
    DataAvailable,
}

/// Control twist and process noise shared by every filter in a cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlInput {
    /// Camera-frame twist
    pub twist: Twist,
    pub process_noise: StateCov,
    /// Vehicle pose, absent without vehicle state
    pub pose: Option<VehiclePose>,
}

impl ControlInput {
    pub fn from_vehicle(
        calib: &Calibration,
        settings: &FilterSettings,
        vehicle: Option<&VehicleState>,
    ) -> Self {
        let Some(state) = vehicle else {
            return Self {
                twist: Twist::zeros(),
                process_noise: StateCov::identity() * settings.fallback_process_noise,
                pose: None,
            };
        };

        let pose = VehiclePose::from_state(state);
        // Covariances are summed rather than propagated through the twist transform
        let process_noise =
            unpack_symmetric(&state.velocity_cov) + unpack_symmetric(&state.angular_velocity_cov);

        Self {
            twist: camera_twist(calib, &pose, &state.twist()),
            process_noise,
            pose: Some(pose),
        }
    }
}

/// Dynamic set of per-tag filters, in first-seen order.
#[derive(Default)]
pub struct FilterBank {
    filters: Vec<TagFilter>,
    index: HashMap<TagId, usize>,
    /// Detections for the next cycle only
    new_detections: Vec<Detection>,
    /// Vehicle pose from the most recent cycle that carried one
    last_pose: Option<VehiclePose>,
}

impl FilterBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filter(&self, id: TagId) -> Option<&TagFilter> {
        self.index.get(&id).map(|&i| &self.filters[i])
    }

    pub fn filters(&self) -> impl Iterator<Item = &TagFilter> {
        self.filters.iter()
    }

    pub fn identities(&self) -> Vec<TagId> {
        self.filters.iter().map(|f| f.id()).collect()
    }

    pub fn pending_detections(&self) -> &[Detection] {
        &self.new_detections
    }

    /// Queue a detection for the next cycle, creating its filter on first sight.
    pub fn push_detection(&mut self, detection: Detection) {
        if !self.index.contains_key(&detection.id) {
            debug!("New tag {} (bank size {})", detection.id, self.filters.len() + 1);
            self.index.insert(detection.id, self.filters.len());
            self.filters.push(TagFilter::new(detection.id));
        }
        self.new_detections.push(detection);
    }

    pub fn clear_detections(&mut self) {
        self.new_detections.clear();
    }

    pub fn last_pose(&self) -> Option<&VehiclePose> {
        self.last_pose.as_ref()
    }

    pub fn has_estimate(&self) -> bool {
        self.filters.iter().any(|f| f.is_initialized())
    }

    /// Camera-frame positions of every tag holding an estimate.
    pub fn snapshot(&self) -> Vec<(TagId, StateVec)> {
        self.filters
            .iter()
            .filter_map(|f| f.position().map(|p| (f.id(), p)))
            .collect()
    }

    /// One control cycle: predict every tracked tag, correct matched ones,
    /// publish world-frame estimates, then drop this cycle's detections.
    pub fn step<P: PosePublisher + ?Sized>(
        &mut self,
        calib: &Calibration,
        settings: &FilterSettings,
        vehicle: Option<&VehicleState>,
        now: Timestamp,
        publisher: &mut P,
    ) -> CycleStatus {
        let input = ControlInput::from_vehicle(calib, settings, vehicle);
        if let Some(pose) = &input.pose {
            self.last_pose = Some(pose.clone());
        }
        // Without a fresh vehicle state, publish through the last known pose
        let publish_pose = self.last_pose.clone();

        for filter in self.filters.iter_mut() {
            // First match wins if a tag was reported twice
            let matched = self
                .new_detections
                .iter()
                .find(|d| d.id == filter.id())
                .copied();

            if !filter.is_initialized() {
                if let Some(det) = matched {
                    seed_filter(filter, &det, calib, settings);
                }
            } else {
                if let Err(e) = filter.predict(&input.twist, &input.process_noise, settings.dt) {
                    warn!("Tag {} predict failed: {}", filter.id(), e);
                }
                if let Some(det) = matched {
                    correct_filter(filter, &det, calib, settings);
                }
            }

            let (Some(position), Some(pose)) = (filter.position(), publish_pose.as_ref()) else {
                continue;
            };
            let world = camera_to_world(calib, pose, &position);
            let tag_pose = TagPose {
                id: filter.id(),
                position: [world.x, world.y, world.z],
                timestamp: now,
            };
            if let Err(e) = publisher.publish(&tag_pose) {
                warn!("Tag {} publish failed: {}", filter.id(), e);
            }
        }

        self.new_detections.clear();

        if self.has_estimate() {
            CycleStatus::DataAvailable
        } else {
            CycleStatus::Idle
        }
    }
}

fn seed_filter(
    filter: &mut TagFilter,
    detection: &Detection,
    calib: &Calibration,
    settings: &FilterSettings,
) {
    let covariance = match settings.measurement.detection_covariance(&calib.k, detection) {
        Ok(cov) => cov,
        Err(e) => {
            warn!("Tag {} seeded with default covariance: {}", detection.id, e);
            StateCov::identity() * settings.initial_variance
        }
    };
    filter.seed(detection, covariance);
    info!(
        "Tracking tag {} at [{:.3}, {:.3}, {:.3}]",
        detection.id, detection.translation[0], detection.translation[1], detection.translation[2]
    );
}

fn correct_filter(
    filter: &mut TagFilter,
    detection: &Detection,
    calib: &Calibration,
    settings: &FilterSettings,
) {
    match settings.measurement.detection_covariance(&calib.k, detection) {
        Ok(r) => {
            if let Err(e) = filter.correct(&detection.translation(), &r) {
                warn!("Tag {} correction rejected: {}", detection.id, e);
            }
        }
        Err(e) => {
            warn!("Tag {} correction rejected: {}", detection.id, e);
            filter.reject_correction();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::tag_ekf;
    use crate::types::{Extrinsics, Intrinsics};
    use approx::assert_relative_eq;

    fn settings() -> FilterSettings {
        FilterSettings {
            dt: 0.02,
            fallback_process_noise: 1e-3,
            initial_variance: 1e-2,
            measurement: MeasurementModel::new(0.1),
        }
    }

    fn identity_calib() -> Calibration {
        Calibration::new(&Intrinsics::default(), &Extrinsics::identity())
    }

    fn still_vehicle() -> VehicleState {
        VehicleState::default()
    }

    fn moving_vehicle(vx: f64) -> VehicleState {
        VehicleState {
            velocity: [vx, 0.0, 0.0],
            ..Default::default()
        }
    }

    fn ts(cycle: i64) -> Timestamp {
        Timestamp::new(1_700_000_000 + cycle, 0)
    }

    #[test]
    fn test_first_detection_seeds_exactly() {
        let calib = identity_calib();
        let mut bank = FilterBank::new();
        let mut published: Vec<TagPose> = Vec::new();

        bank.push_detection(Detection::new(5, [0.31, -0.07, 1.93], [0.2, 0.1, -0.3]));
        assert!(!bank.filter(5).unwrap().is_initialized());

        let status = bank.step(&calib, &settings(), Some(&still_vehicle()), ts(0), &mut published);

        assert_eq!(status, CycleStatus::DataAvailable);
        assert_eq!(
            bank.filter(5).unwrap().position(),
            Some(StateVec::new(0.31, -0.07, 1.93))
        );
        assert_eq!(published.len(), 1);
        assert_relative_eq!(published[0].position[0], 0.31, epsilon = 1e-12);
        assert_eq!(published[0].timestamp, ts(0));
    }

    #[test]
    fn test_empty_bank_is_idle() {
        let calib = identity_calib();
        let mut bank = FilterBank::new();
        let mut published: Vec<TagPose> = Vec::new();
        let status = bank.step(&calib, &settings(), None, ts(0), &mut published);
        assert_eq!(status, CycleStatus::Idle);
        assert!(published.is_empty());
    }

    #[test]
    fn test_converges_on_static_tag() {
        let calib = identity_calib();
        let mut bank = FilterBank::new();
        let mut traces = Vec::new();

        for cycle in 0..10 {
            bank.push_detection(Detection::new(7, [0.0, 0.0, 1.0], [0.0; 3]));
            let mut published: Vec<TagPose> = Vec::new();
            let status =
                bank.step(&calib, &settings(), Some(&still_vehicle()), ts(cycle), &mut published);
            assert_eq!(status, CycleStatus::DataAvailable);
            assert_eq!(published.len(), 1);

            if cycle >= 2 {
                let p = published[0].position;
                assert_relative_eq!(p[0], 0.0, epsilon = 1e-9);
                assert_relative_eq!(p[1], 0.0, epsilon = 1e-9);
                assert_relative_eq!(p[2], 1.0, epsilon = 1e-9);
            }
            let trace = bank.filter(7).unwrap().estimate().unwrap().covariance.trace();
            traces.push(trace);
        }

        for pair in traces.windows(2) {
            assert!(pair[1] < pair[0], "variance must shrink: {:?}", traces);
        }
    }

    #[test]
    fn test_noisy_start_converges() {
        let calib = identity_calib();
        let mut bank = FilterBank::new();
        bank.push_detection(Detection::new(7, [0.01, -0.01, 1.05], [0.0; 3]));
        bank.step(&calib, &settings(), Some(&still_vehicle()), ts(0), &mut Vec::<TagPose>::new());

        let mut last = Vec::new();
        for cycle in 1..10 {
            bank.push_detection(Detection::new(7, [0.0, 0.0, 1.0], [0.0; 3]));
            last.clear();
            bank.step(&calib, &settings(), Some(&still_vehicle()), ts(cycle), &mut last);
            if cycle >= 2 {
                let p = last[0].position;
                assert!(p[0].abs() < 0.01 && p[1].abs() < 0.01);
                assert!((p[2] - 1.0).abs() < 0.02, "z = {}", p[2]);
            }
        }
    }

    #[test]
    fn test_coasting_publishes_prediction() {
        let calib = identity_calib();
        let s = settings();
        let mut bank = FilterBank::new();
        bank.push_detection(Detection::new(2, [0.2, 0.1, 1.5], [0.0; 3]));
        bank.step(&calib, &s, Some(&still_vehicle()), ts(0), &mut Vec::<TagPose>::new());

        let vehicle = VehicleState {
            velocity: [0.3, -0.1, 0.2],
            angular_velocity: [0.0, 0.0, 0.4],
            velocity_cov: [1e-4, 0.0, 1e-4, 0.0, 0.0, 1e-4],
            ..Default::default()
        };
        for cycle in 1..4 {
            let before = bank.filter(2).unwrap().estimate().unwrap().clone();
            let input = ControlInput::from_vehicle(&calib, &s, Some(&vehicle));
            let expected = tag_ekf::predict(&before, &input.twist, &input.process_noise, s.dt);

            let mut published: Vec<TagPose> = Vec::new();
            bank.step(&calib, &s, Some(&vehicle), ts(cycle), &mut published);

            assert_eq!(bank.filter(2).unwrap().estimate(), Some(&expected));
            assert_relative_eq!(published[0].position[0], expected.position.x, epsilon = 1e-12);
            assert_relative_eq!(published[0].position[2], expected.position.z, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_coasting_moves_opposite_to_vehicle() {
        let calib = identity_calib();
        let s = settings();
        let mut bank = FilterBank::new();
        bank.push_detection(Detection::new(7, [0.0, 0.0, 2.0], [0.0; 3]));
        bank.step(&calib, &s, Some(&moving_vehicle(1.0)), ts(0), &mut Vec::<TagPose>::new());

        let mut xs = Vec::new();
        for cycle in 1..=5 {
            let mut published: Vec<TagPose> = Vec::new();
            bank.step(&calib, &s, Some(&moving_vehicle(1.0)), ts(cycle), &mut published);
            assert_eq!(published.len(), 1);
            xs.push(published[0].position[0]);
            assert_relative_eq!(published[0].position[0], -(cycle as f64) * s.dt, epsilon = 1e-12);
            assert_relative_eq!(published[0].position[2], 2.0, epsilon = 1e-12);
        }
        assert!(xs.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_no_vehicle_state_yet_coasts_without_publishing() {
        let calib = identity_calib();
        let s = settings();
        let mut bank = FilterBank::new();
        bank.push_detection(Detection::new(1, [0.0, 0.0, 1.0], [0.0; 3]));

        let mut published: Vec<TagPose> = Vec::new();
        let status = bank.step(&calib, &s, None, ts(0), &mut published);
        assert_eq!(status, CycleStatus::DataAvailable);
        assert!(published.is_empty());

        let trace_before = bank.filter(1).unwrap().estimate().unwrap().covariance.trace();
        bank.step(&calib, &s, None, ts(1), &mut published);
        let filter = bank.filter(1).unwrap();
        assert_eq!(filter.position(), Some(StateVec::new(0.0, 0.0, 1.0)));
        assert_relative_eq!(
            filter.estimate().unwrap().covariance.trace(),
            trace_before + 3.0 * s.fallback_process_noise,
            epsilon = 1e-12
        );
        assert_relative_eq!(*filter.process_noise(), StateCov::identity() * 1e-3);
    }

    #[test]
    fn test_missing_vehicle_state_publishes_through_last_pose() {
        let calib = identity_calib();
        let s = settings();
        let mut bank = FilterBank::new();
        let vehicle = VehicleState {
            position: [1.0, 2.0, 3.0],
            ..Default::default()
        };

        bank.push_detection(Detection::new(7, [0.0, 0.0, 1.0], [0.0; 3]));
        let mut published: Vec<TagPose> = Vec::new();
        bank.step(&calib, &s, Some(&vehicle), ts(0), &mut published);
        assert_eq!(published.len(), 1);

        for cycle in 1..4 {
            let before = bank.filter(7).unwrap().estimate().unwrap().clone();
            let input = ControlInput::from_vehicle(&calib, &s, None);
            let expected = tag_ekf::predict(&before, &input.twist, &input.process_noise, s.dt);

            published.clear();
            let status = bank.step(&calib, &s, None, ts(cycle), &mut published);

            assert_eq!(status, CycleStatus::DataAvailable);
            assert_eq!(published.len(), 1);
            assert_eq!(published[0].timestamp, ts(cycle));
            assert_relative_eq!(
                published[0].position[0],
                expected.position.x + 1.0,
                epsilon = 1e-12
            );
            assert_relative_eq!(
                published[0].position[1],
                expected.position.y + 2.0,
                epsilon = 1e-12
            );
            assert_relative_eq!(
                published[0].position[2],
                expected.position.z + 3.0,
                epsilon = 1e-12
            );
        }
        assert_eq!(bank.last_pose().unwrap().w_t_b, nalgebra::Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_unusable_first_detection_seeds_default_covariance() {
        let calib = identity_calib();
        let s = settings();
        let mut bank = FilterBank::new();

        // Behind the camera: no reprojection covariance for the seed
        bank.push_detection(Detection::new(6, [0.2, -0.1, -1.0], [0.0; 3]));
        let mut published: Vec<TagPose> = Vec::new();
        let status = bank.step(&calib, &s, Some(&still_vehicle()), ts(0), &mut published);

        assert_eq!(status, CycleStatus::DataAvailable);
        let estimate = bank.filter(6).unwrap().estimate().unwrap();
        assert_eq!(estimate.position, StateVec::new(0.2, -0.1, -1.0));
        assert_eq!(estimate.covariance, StateCov::identity() * s.initial_variance);
    }

    #[test]
    fn test_tiny_marker_seed_uses_default_covariance() {
        let calib = identity_calib();
        let s = FilterSettings {
            measurement: MeasurementModel::new(1e-9),
            ..settings()
        };
        let mut bank = FilterBank::new();

        bank.push_detection(Detection::new(8, [0.0, 0.0, 1.0], [0.0; 3]));
        bank.step(&calib, &s, Some(&still_vehicle()), ts(0), &mut Vec::<TagPose>::new());

        let estimate = bank.filter(8).unwrap().estimate().unwrap();
        assert_eq!(estimate.position, StateVec::new(0.0, 0.0, 1.0));
        assert_relative_eq!(estimate.covariance, StateCov::identity() * 1e-2);
    }

    #[test]
    fn test_first_match_wins_and_detections_cleared() {
        let calib = identity_calib();
        let mut bank = FilterBank::new();
        bank.push_detection(Detection::new(3, [0.0, 0.0, 1.0], [0.0; 3]));
        bank.push_detection(Detection::new(3, [0.5, 0.5, 3.0], [0.0; 3]));
        assert_eq!(bank.len(), 1);
        assert_eq!(bank.pending_detections().len(), 2);

        bank.step(&calib, &settings(), Some(&still_vehicle()), ts(0), &mut Vec::<TagPose>::new());
        assert_eq!(bank.filter(3).unwrap().position(), Some(StateVec::new(0.0, 0.0, 1.0)));
        assert!(bank.pending_detections().is_empty());
    }

    #[test]
    fn test_insertion_order_and_independence() {
        let calib = identity_calib();
        let mut bank = FilterBank::new();
        bank.push_detection(Detection::new(9, [0.0, 0.0, 1.0], [0.0; 3]));
        bank.push_detection(Detection::new(2, [0.1, 0.0, 2.0], [0.0; 3]));
        let mut published: Vec<TagPose> = Vec::new();
        bank.step(&calib, &settings(), Some(&still_vehicle()), ts(0), &mut published);

        assert_eq!(bank.identities(), vec![9, 2]);
        assert_eq!(published.iter().map(|p| p.id).collect::<Vec<_>>(), vec![9, 2]);

        // Tag 2 reappears alone; tag 9 keeps coasting and stays tracked
        bank.push_detection(Detection::new(2, [0.1, 0.0, 2.0], [0.0; 3]));
        published.clear();
        bank.step(&calib, &settings(), Some(&still_vehicle()), ts(1), &mut published);
        assert_eq!(published.len(), 2);
        assert_eq!(bank.filter(9).unwrap().status().corrections, 0);
        assert_eq!(bank.filter(2).unwrap().status().corrections, 1);
    }

    #[test]
    fn test_degenerate_detection_skips_correction() {
        let calib = identity_calib();
        let mut bank = FilterBank::new();
        bank.push_detection(Detection::new(4, [0.0, 0.0, 1.0], [0.0; 3]));
        bank.step(&calib, &settings(), Some(&still_vehicle()), ts(0), &mut Vec::<TagPose>::new());

        // Behind the camera: no usable reprojection covariance
        bank.push_detection(Detection::new(4, [0.0, 0.0, -1.0], [0.0; 3]));
        bank.step(&calib, &settings(), Some(&still_vehicle()), ts(1), &mut Vec::<TagPose>::new());

        let filter = bank.filter(4).unwrap();
        assert_eq!(filter.position(), Some(StateVec::new(0.0, 0.0, 1.0)));
        assert_eq!(filter.status().rejected_corrections, 1);
    }

    #[test]
    fn test_world_frame_publication() {
        let calib = Calibration::new(
            &Intrinsics::default(),
            &Extrinsics {
                translation: [0.1, 0.0, -0.05],
                rotation: [0.0, 0.0, 0.0],
            },
        );
        let vehicle = VehicleState {
            position: [10.0, -4.0, 2.0],
            ..Default::default()
        };
        let mut bank = FilterBank::new();
        bank.push_detection(Detection::new(11, [0.0, 0.2, 1.0], [0.0; 3]));
        let mut published: Vec<TagPose> = Vec::new();
        bank.step(&calib, &settings(), Some(&vehicle), ts(0), &mut published);

        let p = published[0].position;
        assert_relative_eq!(p[0], 10.1, epsilon = 1e-12);
        assert_relative_eq!(p[1], -3.8, epsilon = 1e-12);
        assert_relative_eq!(p[2], 2.95, epsilon = 1e-12);
    }
}
