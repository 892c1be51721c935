use log::debug;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::ahrs::{AhrsFlags, AhrsSettings, FusionAhrs};
use crate::constants::sample_constants::{GRAVITY_METERS_PER_SECONDS_SQUARED, MAX_SAMPLE_DELTA_MICROS};
use crate::offset::{GyroOffset, OffsetSettings};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    /// Samples spaced further apart than this are dropped as stale.
    pub max_delta_seconds: f32,
    pub offset: OffsetSettings,
    pub ahrs: AhrsSettings,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            max_delta_seconds: MAX_SAMPLE_DELTA_MICROS as f32 / 1_000_000.0,
            offset: OffsetSettings::default(),
            ahrs: AhrsSettings::default(),
        }
    }
}

/// What happened to one sample handed to a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Fused,
    /// The delta exceeded the staleness bound.
    Stale,
    /// Zero, negative or non-finite delta, or a non-finite vector.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackStats {
    pub fused: u64,
    pub stale: u64,
    pub invalid: u64,
}

/// Fusion state and displayed pose of one physical sensor unit.
///
/// Position is a plain double integral of earth-frame acceleration meant for visualisation.
/// It drifts and is never corrected, only [`DeviceTrack::reset`] brings it back home.
#[derive(Debug, Clone)]
pub struct DeviceTrack {
    index: usize,
    config: TrackConfig,
    home: Vector3<f32>,
    offset: GyroOffset,
    ahrs: FusionAhrs,
    orientation: UnitQuaternion<f32>,
    /// Earth-frame linear acceleration in m/s².
    earth_acceleration: Vector3<f32>,
    velocity: Vector3<f32>,
    position: Vector3<f32>,
    stats: TrackStats,
}

impl DeviceTrack {
    pub fn new(index: usize, config: TrackConfig) -> Self {
        let home = Self::home_position(index);
        Self {
            index,
            config,
            home,
            offset: GyroOffset::new(config.offset),
            ahrs: FusionAhrs::new(config.ahrs),
            orientation: UnitQuaternion::identity(),
            earth_acceleration: Vector3::zeros(),
            velocity: Vector3::zeros(),
            position: home,
            stats: TrackStats::default(),
        }
    }

    /// Where track `index` sits when reset: spaced two units apart along x, raised to y = 2.
    pub fn home_position(index: usize) -> Vector3<f32> {
        Vector3::new(2.0 * index as f32 - 3.0, 2.0, 0.0)
    }

    /// Runs one raw sample through the bias compensator and the AHRS, then integrates the
    /// resulting earth acceleration into the displayed position.
    ///
    /// # Arguments
    ///
    /// - `delta_seconds` (`f32`) - Time since this unit's previous sample.
    /// - `accel` (`Vector3<f32>`) - Acceleration in m/s², already remapped to the world axes.
    /// - `gyro` (`Vector3<f32>`) - Angular rate in °/s, already remapped to the world axes.
    ///
    /// # Returns
    ///
    /// - `IngestOutcome` - `Fused` if the sample was used, otherwise why it was dropped.
    pub fn ingest(&mut self, delta_seconds: f32, accel: Vector3<f32>, gyro: Vector3<f32>) -> IngestOutcome {
        let outcome = self.check_sample(delta_seconds, is_finite(&accel) && is_finite(&gyro));
        if outcome != IngestOutcome::Fused {
            return outcome;
        }

        let accel_g = accel / GRAVITY_METERS_PER_SECONDS_SQUARED;
        let gyro_corrected = self.offset.update(gyro, accel_g);
        self.ahrs.update_no_magnetometer(gyro_corrected, accel_g, delta_seconds);

        self.orientation = self.ahrs.quaternion();
        self.earth_acceleration = self.ahrs.earth_acceleration() * GRAVITY_METERS_PER_SECONDS_SQUARED;
        self.position += self.earth_acceleration * delta_seconds * delta_seconds;
        outcome
    }

    /// Applies a sample already fused on the device: the orientation is taken as-is and the
    /// world acceleration (m/s²) is integrated into velocity and position.
    pub fn apply_device_fused(
        &mut self,
        delta_seconds: f32,
        orientation: Quaternion<f32>,
        world_accel: Vector3<f32>,
    ) -> IngestOutcome {
        let usable = is_finite(&world_accel)
            && orientation.coords.iter().all(|c| c.is_finite())
            && orientation.norm() > 0.0;
        let outcome = self.check_sample(delta_seconds, usable);
        if outcome != IngestOutcome::Fused {
            return outcome;
        }

        self.orientation = UnitQuaternion::new_normalize(orientation);
        self.earth_acceleration = world_accel;
        self.velocity += world_accel * delta_seconds;
        self.position += world_accel * delta_seconds * delta_seconds;
        outcome
    }

    /// Validates a sample and bumps the matching counter.
    fn check_sample(&mut self, delta_seconds: f32, values_finite: bool) -> IngestOutcome {
        let outcome = if !delta_seconds.is_finite() || delta_seconds <= 0.0 {
            IngestOutcome::Invalid
        } else if delta_seconds > self.config.max_delta_seconds {
            IngestOutcome::Stale
        } else if !values_finite {
            IngestOutcome::Invalid
        } else {
            IngestOutcome::Fused
        };

        match outcome {
            IngestOutcome::Fused => self.stats.fused += 1,
            IngestOutcome::Stale => {
                self.stats.stale += 1;
                debug!("Track {} dropped stale sample ({delta_seconds} s)", self.index);
            }
            IngestOutcome::Invalid => {
                self.stats.invalid += 1;
                debug!("Track {} dropped unusable sample", self.index);
            }
        }
        outcome
    }

    /// Resets the bias estimate and filter state and returns the track to its home position.
    /// Counters are kept.
    pub fn reset(&mut self) {
        self.offset.reset();
        self.ahrs.reset();
        self.orientation = UnitQuaternion::identity();
        self.earth_acceleration = Vector3::zeros();
        self.velocity = Vector3::zeros();
        self.position = self.home;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn orientation(&self) -> UnitQuaternion<f32> {
        self.orientation
    }

    pub fn position(&self) -> Vector3<f32> {
        self.position
    }

    pub fn velocity(&self) -> Vector3<f32> {
        self.velocity
    }

    /// Earth-frame linear acceleration in m/s².
    pub fn earth_acceleration(&self) -> Vector3<f32> {
        self.earth_acceleration
    }

    pub fn gyro_offset(&self) -> Vector3<f32> {
        self.offset.offset()
    }

    pub fn ahrs_flags(&self) -> AhrsFlags {
        self.ahrs.flags()
    }

    pub fn ahrs(&self) -> &FusionAhrs {
        &self.ahrs
    }

    pub fn stats(&self) -> TrackStats {
        self.stats
    }

    pub fn config(&self) -> &TrackConfig {
        &self.config
    }
}

fn is_finite(v: &Vector3<f32>) -> bool {
    v.iter().all(|c| c.is_finite())
}
