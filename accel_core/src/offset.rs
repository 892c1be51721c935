use std::collections::VecDeque;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::constants::sample_constants::DEFAULT_SAMPLE_RATE_HZ;

/// Tuning for [`GyroOffset`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetSettings {
    /// Samples per second the compensator is fed at.
    pub sample_rate: u32,
    /// Corner frequency of the bias low-pass filter in Hz.
    pub cutoff_frequency: f32,
    /// Seconds the sensor must look stationary before the bias starts adapting.
    pub timeout_seconds: f32,
    /// Angular rate in °/s above which the sensor is considered moving.
    pub threshold_dps: f32,
    /// Trailing window of accelerometer magnitudes used for the variance check.
    pub accel_window: usize,
    /// Magnitude variance in g² above which the sensor is considered moving.
    pub accel_variance_threshold: f32,
}

impl Default for OffsetSettings {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE_HZ,
            cutoff_frequency: 0.02,
            timeout_seconds: 5.0,
            threshold_dps: 3.0,
            accel_window: 50,
            accel_variance_threshold: 0.0025,
        }
    }
}

/// Gyroscope bias compensator.
///
/// Every sample has the current bias estimate subtracted. While the corrected rate stays under
/// the threshold on all axes and the accelerometer magnitude is steady, a stationary timer runs;
/// once it reaches the timeout the residual rate is low-pass filtered into the bias estimate.
#[derive(Debug, Clone)]
pub struct GyroOffset {
    settings: OffsetSettings,
    filter_coefficient: f32,
    timeout: u32,
    timer: u32,
    gyroscope_offset: Vector3<f32>,
    accel_magnitudes: VecDeque<f32>,
}

impl Default for GyroOffset {
    fn default() -> Self {
        Self::new(OffsetSettings::default())
    }
}

impl GyroOffset {
    pub fn new(settings: OffsetSettings) -> Self {
        let sample_rate = settings.sample_rate.max(1) as f32;
        Self {
            settings,
            filter_coefficient: 2.0 * std::f32::consts::PI * settings.cutoff_frequency / sample_rate,
            timeout: (settings.timeout_seconds * sample_rate).round() as u32,
            timer: 0,
            gyroscope_offset: Vector3::zeros(),
            accel_magnitudes: VecDeque::with_capacity(settings.accel_window),
        }
    }

    /// Removes the bias from `gyroscope` (°/s) and adapts the estimate when stationary.
    ///
    /// # Arguments
    ///
    /// - `gyroscope` (`Vector3<f32>`) - Angular rate in degrees per second.
    /// - `accelerometer` (`Vector3<f32>`) - Acceleration in g, only its magnitude is used.
    ///
    /// # Returns
    ///
    /// - `Vector3<f32>` - The bias-corrected angular rate.
    pub fn update(&mut self, gyroscope: Vector3<f32>, accelerometer: Vector3<f32>) -> Vector3<f32> {
        let corrected = gyroscope - self.gyroscope_offset;

        if !self.accel_is_steady(accelerometer.norm()) || self.exceeds_threshold(&corrected) {
            self.timer = 0;
            return corrected;
        }

        if self.timer < self.timeout {
            self.timer += 1;
            return corrected;
        }

        self.gyroscope_offset += corrected * self.filter_coefficient;
        corrected
    }

    fn exceeds_threshold(&self, rate: &Vector3<f32>) -> bool {
        rate.iter().any(|axis| axis.abs() > self.settings.threshold_dps)
    }

    /// Pushes `magnitude` into the trailing window and reports whether the window is full and
    /// quiet. A sensor is never judged stationary before the window has filled.
    fn accel_is_steady(&mut self, magnitude: f32) -> bool {
        let window = self.settings.accel_window;
        if window == 0 {
            return true;
        }
        if self.accel_magnitudes.len() == window {
            self.accel_magnitudes.pop_front();
        }
        self.accel_magnitudes.push_back(magnitude);
        if self.accel_magnitudes.len() < window {
            return false;
        }

        let n = window as f32;
        let mean = self.accel_magnitudes.iter().sum::<f32>() / n;
        let variance = self
            .accel_magnitudes
            .iter()
            .map(|m| (m - mean) * (m - mean))
            .sum::<f32>()
            / n;
        variance <= self.settings.accel_variance_threshold
    }

    pub fn offset(&self) -> Vector3<f32> {
        self.gyroscope_offset
    }

    /// True once the stationary timer has run out and the bias is adapting.
    pub fn is_adapting(&self) -> bool {
        self.timer >= self.timeout
    }

    pub fn settings(&self) -> &OffsetSettings {
        &self.settings
    }

    pub fn reset(&mut self) {
        self.timer = 0;
        self.gyroscope_offset = Vector3::zeros();
        self.accel_magnitudes.clear();
    }
}
