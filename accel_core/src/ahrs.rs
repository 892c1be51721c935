use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::constants::sample_constants::DEFAULT_SAMPLE_RATE_HZ;

/// Gain applied right after a reset, ramped down to the configured gain.
const INITIAL_GAIN: f32 = 10.0;
/// Seconds spent ramping the gain down after a reset.
const INITIALISATION_PERIOD: f32 = 3.0;

/// Earth axes convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Convention {
    /// North-West-Up
    #[default]
    Nwu,
    /// East-North-Up
    Enu,
    /// North-East-Down
    Ned,
}

/// AHRS algorithm settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AhrsSettings {
    /// Earth axes convention
    pub convention: Convention,
    /// Algorithm gain (typically 0.5)
    pub gain: f32,
    /// Gyroscope range in degrees per second, 0 disables range checking
    pub gyroscope_range: f32,
    /// Acceleration rejection threshold in degrees, 0 disables rejection
    pub acceleration_rejection: f32,
    /// Recovery trigger period in samples, 0 disables rejection
    pub recovery_trigger_period: u32,
}

impl Default for AhrsSettings {
    fn default() -> Self {
        Self {
            convention: Convention::default(),
            gain: 0.5,
            gyroscope_range: 1000.0,
            acceleration_rejection: 10.0,
            recovery_trigger_period: 5 * DEFAULT_SAMPLE_RATE_HZ,
        }
    }
}

/// AHRS algorithm internal states
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AhrsInternalStates {
    /// Angle between measured and estimated gravity, in degrees
    pub acceleration_error: f32,
    /// Whether accelerometer is being ignored
    pub accelerometer_ignored: bool,
    /// Acceleration recovery trigger as a fraction of the trigger period
    pub acceleration_recovery_trigger: f32,
}

/// AHRS algorithm flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AhrsFlags {
    /// Whether algorithm is initialising
    pub initialising: bool,
    /// Whether angular rate recovery is active
    pub angular_rate_recovery: bool,
    /// Whether acceleration recovery is active
    pub acceleration_recovery: bool,
}

/// Gyroscope + accelerometer orientation filter.
///
/// The gyroscope is integrated to propagate the orientation and the accelerometer, taken as a
/// noisy gravity reference, feeds back a correction that removes tilt drift. Without a
/// magnetometer nothing corrects yaw, so the heading is held at zero while initialising and
/// drifts freely afterwards. Accelerometer units are g, gyroscope units are °/s.
#[derive(Debug, Clone)]
pub struct FusionAhrs {
    settings: AhrsSettings,
    /// `0.98 * gyroscope_range`, or `f32::MAX` when disabled.
    gyroscope_limit: f32,
    /// Squared half-sine of the rejection angle, or `f32::MAX` when disabled.
    rejection_limit: f32,
    quaternion: Quaternion<f32>,
    accelerometer: Vector3<f32>,
    initialising: bool,
    ramped_gain: f32,
    ramped_gain_step: f32,
    angular_rate_recovery: bool,
    half_accelerometer_feedback: Vector3<f32>,
    accelerometer_ignored: bool,
    acceleration_recovery_trigger: i64,
    acceleration_recovery_timeout: i64,
}

impl Default for FusionAhrs {
    fn default() -> Self {
        Self::new(AhrsSettings::default())
    }
}

impl FusionAhrs {
    pub fn new(settings: AhrsSettings) -> Self {
        let mut ahrs = FusionAhrs {
            settings,
            gyroscope_limit: f32::MAX,
            rejection_limit: f32::MAX,
            quaternion: Quaternion::identity(),
            accelerometer: Vector3::zeros(),
            initialising: true,
            ramped_gain: INITIAL_GAIN,
            ramped_gain_step: 0.0,
            angular_rate_recovery: false,
            half_accelerometer_feedback: Vector3::zeros(),
            accelerometer_ignored: false,
            acceleration_recovery_trigger: 0,
            acceleration_recovery_timeout: 0,
        };
        ahrs.set_settings(settings);
        ahrs.reset();
        ahrs
    }

    /// Returns the filter to identity with the gain ramp restarted.
    pub fn reset(&mut self) {
        self.quaternion = Quaternion::identity();
        self.accelerometer = Vector3::zeros();
        self.initialising = true;
        self.ramped_gain = INITIAL_GAIN;
        self.angular_rate_recovery = false;
        self.half_accelerometer_feedback = Vector3::zeros();
        self.accelerometer_ignored = false;
        self.acceleration_recovery_trigger = 0;
        self.acceleration_recovery_timeout = self.settings.recovery_trigger_period as i64;
    }

    pub fn set_settings(&mut self, settings: AhrsSettings) {
        self.settings = settings;
        self.gyroscope_limit = if settings.gyroscope_range == 0.0 {
            f32::MAX
        } else {
            0.98 * settings.gyroscope_range
        };
        self.rejection_limit = if settings.acceleration_rejection == 0.0
            || settings.gain == 0.0
            || settings.recovery_trigger_period == 0
        {
            f32::MAX
        } else {
            (0.5 * settings.acceleration_rejection.to_radians().sin()).powi(2)
        };
        self.acceleration_recovery_timeout = settings.recovery_trigger_period as i64;
        if !self.initialising {
            self.ramped_gain = settings.gain;
        }
        self.ramped_gain_step = (INITIAL_GAIN - settings.gain) / INITIALISATION_PERIOD;
    }

    pub fn settings(&self) -> &AhrsSettings {
        &self.settings
    }

    /// Runs one filter step.
    ///
    /// # Arguments
    ///
    /// - `gyroscope` (`Vector3<f32>`) - Angular rate in °/s, bias already removed.
    /// - `accelerometer` (`Vector3<f32>`) - Acceleration in g. A zero vector skips the gravity
    ///   correction for this step.
    /// - `delta_time` (`f32`) - Seconds since the previous sample.
    pub fn update(&mut self, gyroscope: Vector3<f32>, accelerometer: Vector3<f32>, delta_time: f32) {
        self.accelerometer = accelerometer;

        if gyroscope.iter().any(|axis| axis.abs() > self.gyroscope_limit) {
            let quaternion = self.quaternion;
            self.reset();
            self.quaternion = quaternion;
            self.angular_rate_recovery = true;
        }

        if self.initialising {
            self.ramped_gain -= self.ramped_gain_step * delta_time;
            if self.ramped_gain < self.settings.gain || self.settings.gain == 0.0 {
                self.ramped_gain = self.settings.gain;
                self.initialising = false;
                self.angular_rate_recovery = false;
            }
        }

        let half_gravity = self.half_gravity();
        let mut half_accelerometer_feedback = Vector3::zeros();
        self.accelerometer_ignored = true;

        if accelerometer != Vector3::zeros() {
            self.half_accelerometer_feedback = feedback(&accelerometer.normalize(), &half_gravity);

            if self.initialising
                || self.half_accelerometer_feedback.norm_squared() <= self.rejection_limit
            {
                self.accelerometer_ignored = false;
                self.acceleration_recovery_trigger -= 9;
            } else {
                self.acceleration_recovery_trigger += 1;
            }

            // Stop rejecting once the error has persisted for a whole trigger period.
            if self.acceleration_recovery_trigger > self.acceleration_recovery_timeout {
                self.acceleration_recovery_timeout = 0;
                self.accelerometer_ignored = false;
            } else {
                self.acceleration_recovery_timeout = self.settings.recovery_trigger_period as i64;
            }
            self.acceleration_recovery_trigger = self
                .acceleration_recovery_trigger
                .clamp(0, self.settings.recovery_trigger_period as i64);

            if !self.accelerometer_ignored {
                half_accelerometer_feedback = self.half_accelerometer_feedback;
            }
        }

        let half_gyroscope = gyroscope * 0.5_f32.to_radians();
        let adjusted_half_gyroscope =
            half_gyroscope + half_accelerometer_feedback * self.ramped_gain;

        let delta = self.quaternion * Quaternion::from_imag(adjusted_half_gyroscope * delta_time);
        let integrated = self.quaternion + delta;
        if let Some(normalized) = integrated.coords.try_normalize(f32::EPSILON) {
            self.quaternion = Quaternion::from_vector(normalized);
        }
    }

    /// Filter step without a magnetometer. The heading is pinned to zero while initialising.
    pub fn update_no_magnetometer(
        &mut self,
        gyroscope: Vector3<f32>,
        accelerometer: Vector3<f32>,
        delta_time: f32,
    ) {
        self.update(gyroscope, accelerometer, delta_time);
        if self.initialising {
            self.set_heading(0.0);
        }
    }

    /// Rotates the orientation about the earth z axis so its yaw equals `heading` degrees.
    pub fn set_heading(&mut self, heading: f32) {
        let q = self.quaternion;
        let yaw = (q.w * q.k + q.i * q.j).atan2(0.5 - q.j * q.j - q.k * q.k);
        let half_yaw_minus_heading = 0.5 * (yaw - heading.to_radians());
        let rotation = Quaternion::new(
            half_yaw_minus_heading.cos(),
            0.0,
            0.0,
            -half_yaw_minus_heading.sin(),
        );
        self.quaternion = rotation * q;
    }

    pub fn quaternion(&self) -> UnitQuaternion<f32> {
        UnitQuaternion::new_normalize(self.quaternion)
    }

    pub fn set_quaternion(&mut self, quaternion: UnitQuaternion<f32>) {
        self.quaternion = quaternion.into_inner();
    }

    /// Direction of gravity in the sensor frame as the accelerometer would measure it, in g.
    pub fn gravity(&self) -> Vector3<f32> {
        self.half_gravity() * 2.0
    }

    /// Accelerometer reading with gravity removed, sensor frame, in g.
    pub fn linear_acceleration(&self) -> Vector3<f32> {
        self.accelerometer - self.gravity()
    }

    /// Accelerometer reading rotated into the earth frame with gravity removed, in g.
    pub fn earth_acceleration(&self) -> Vector3<f32> {
        let mut earth = self.quaternion() * self.accelerometer;
        match self.settings.convention {
            Convention::Nwu | Convention::Enu => earth.z -= 1.0,
            Convention::Ned => earth.z += 1.0,
        }
        earth
    }

    pub fn internal_states(&self) -> AhrsInternalStates {
        let period = self.settings.recovery_trigger_period;
        AhrsInternalStates {
            acceleration_error: (2.0 * self.half_accelerometer_feedback.norm())
                .min(1.0)
                .asin()
                .to_degrees(),
            accelerometer_ignored: self.accelerometer_ignored,
            acceleration_recovery_trigger: if period == 0 {
                0.0
            } else {
                self.acceleration_recovery_trigger as f32 / period as f32
            },
        }
    }

    pub fn flags(&self) -> AhrsFlags {
        AhrsFlags {
            initialising: self.initialising,
            angular_rate_recovery: self.angular_rate_recovery,
            acceleration_recovery: self.acceleration_recovery_trigger
                > self.acceleration_recovery_timeout,
        }
    }

    /// Half of the gravity direction predicted by the current orientation.
    fn half_gravity(&self) -> Vector3<f32> {
        let q = &self.quaternion;
        let half = Vector3::new(
            q.i * q.k - q.w * q.j,
            q.j * q.k + q.w * q.i,
            q.w * q.w - 0.5 + q.k * q.k,
        );
        match self.settings.convention {
            Convention::Nwu | Convention::Enu => half,
            Convention::Ned => -half,
        }
    }
}

/// Correction pulling `sensor` towards `reference`. Past 90° of error the cross product shrinks
/// again, so it is normalised to keep the correction at full strength.
fn feedback(sensor: &Vector3<f32>, reference: &Vector3<f32>) -> Vector3<f32> {
    let cross = sensor.cross(reference);
    if sensor.dot(reference) < 0.0 {
        cross.try_normalize(f32::EPSILON).unwrap_or(cross)
    } else {
        cross
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 0.01;

    fn settled() -> FusionAhrs {
        let mut ahrs = FusionAhrs::default();
        for _ in 0..400 {
            ahrs.update_no_magnetometer(Vector3::zeros(), Vector3::new(0.0, 0.0, 1.0), DT);
        }
        ahrs
    }

    #[test]
    fn starts_at_identity_and_initialising() {
        let ahrs = FusionAhrs::default();
        assert_eq!(ahrs.quaternion(), UnitQuaternion::identity());
        assert!(ahrs.flags().initialising);
    }

    #[test]
    fn initialisation_finishes_after_ramp() {
        let ahrs = settled();
        assert!(!ahrs.flags().initialising);
        assert!(ahrs.earth_acceleration().norm() < 1e-4);
        assert!(ahrs.linear_acceleration().norm() < 1e-4);
    }

    #[test]
    fn tilt_converges_to_measured_gravity() {
        let angle = 30.0_f32.to_radians();
        let accel = Vector3::new(0.0, angle.sin(), angle.cos());
        let mut ahrs = FusionAhrs::default();
        for _ in 0..1000 {
            ahrs.update_no_magnetometer(Vector3::zeros(), accel, DT);
        }

        assert!((ahrs.gravity() - accel).norm() < 0.01, "gravity {:?}", ahrs.gravity());
        assert!(ahrs.earth_acceleration().norm() < 0.01);
        let (_, _, yaw) = ahrs.quaternion().euler_angles();
        assert!(yaw.abs() < 1e-3);
    }

    #[test]
    fn gyroscope_integrates_yaw() {
        let mut ahrs = settled();
        for _ in 0..100 {
            ahrs.update_no_magnetometer(Vector3::new(0.0, 0.0, 90.0), Vector3::new(0.0, 0.0, 1.0), DT);
        }
        let (_, _, yaw) = ahrs.quaternion().euler_angles();
        assert!((yaw.to_degrees() - 90.0).abs() < 1.0, "yaw {}", yaw.to_degrees());
    }

    #[test]
    fn gyroscope_overflow_triggers_recovery() {
        let mut ahrs = settled();
        ahrs.update_no_magnetometer(Vector3::new(0.0, 0.0, 2000.0), Vector3::new(0.0, 0.0, 1.0), DT);
        let flags = ahrs.flags();
        assert!(flags.initialising);
        assert!(flags.angular_rate_recovery);
    }

    #[test]
    fn large_acceleration_error_is_rejected_until_recovery() {
        let mut ahrs = settled();
        let sideways = Vector3::new(1.0, 0.0, 0.0);
        let period = ahrs.settings().recovery_trigger_period;

        for _ in 0..period {
            ahrs.update_no_magnetometer(Vector3::zeros(), sideways, DT);
        }
        assert!(ahrs.internal_states().accelerometer_ignored);
        assert!(!ahrs.flags().acceleration_recovery);
        assert!((ahrs.internal_states().acceleration_error - 90.0).abs() < 0.1);

        ahrs.update_no_magnetometer(Vector3::zeros(), sideways, DT);
        assert!(!ahrs.internal_states().accelerometer_ignored);
        assert!(ahrs.flags().acceleration_recovery);
    }

    #[test]
    fn ned_reports_gravity_downwards() {
        let settings = AhrsSettings {
            convention: Convention::Ned,
            ..AhrsSettings::default()
        };
        let mut ahrs = FusionAhrs::new(settings);
        for _ in 0..400 {
            ahrs.update_no_magnetometer(Vector3::zeros(), Vector3::new(0.0, 0.0, -1.0), DT);
        }
        assert!((ahrs.gravity() - Vector3::new(0.0, 0.0, -1.0)).norm() < 1e-4);
        assert!(ahrs.earth_acceleration().norm() < 1e-4);
    }

    #[test]
    fn reset_restores_identity() {
        let mut ahrs = settled();
        for _ in 0..50 {
            ahrs.update_no_magnetometer(Vector3::new(30.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 1.0), DT);
        }
        assert_ne!(ahrs.quaternion(), UnitQuaternion::identity());

        ahrs.reset();
        assert_eq!(ahrs.quaternion(), UnitQuaternion::identity());
        assert!(ahrs.flags().initialising);
    }
}
