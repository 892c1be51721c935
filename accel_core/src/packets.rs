use nalgebra::{Quaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::constants::configure_ids::{kind, value};
use crate::constants::packet_constants::INNER_SIZE;
use crate::constants::payload_constants::*;
use crate::serial_packet::Payload;
use crate::utils::*;

/// Device-fused sample produced by the sensor's on-chip motion processor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelSample {
    pub delta_micros: u64,
    /// World-frame linear acceleration in m/s².
    pub accel: Vector3<f32>,
    /// Orientation computed on the device.
    pub gyro_quat: Quaternion<f32>,
    pub gyro_euler: Vector3<f32>,
}

impl Payload for AccelSample {
    const SIZE: usize = INNER_SIZE;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.delta_micros.to_le_bytes());
        put_vec3(&mut out, &self.accel);
        put_quat(&mut out, &self.gyro_quat);
        put_vec3(&mut out, &self.gyro_euler);
        pad_to(&mut out, Self::SIZE);
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut idx = 0;
        let delta_micros = read_u64(bytes, &mut idx);
        let accel = read_vec3(bytes, &mut idx);
        let gyro_quat = read_quat(bytes, &mut idx);
        let gyro_euler = read_vec3(bytes, &mut idx);
        Self {
            delta_micros,
            accel,
            gyro_quat,
            gyro_euler,
        }
    }
}

/// One time slice of raw sensor output for a single physical unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub delta_micros: u32,
    /// Acceleration in m/s², body frame.
    pub accel: Vector3<f32>,
    /// Angular rate in degrees per second, body frame.
    pub gyro: Vector3<f32>,
}

impl Default for RawSample {
    fn default() -> Self {
        Self {
            delta_micros: 0,
            accel: Vector3::zeros(),
            gyro: Vector3::zeros(),
        }
    }
}

impl RawSample {
    pub fn delta_seconds(&self) -> f32 {
        self.delta_micros as f32 / 1_000_000.0
    }
}

/// Raw samples for all physical units, index `i` belongs to device `i`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RawAccelBatch {
    pub samples: [RawSample; DEVICE_COUNT],
}

impl Payload for RawAccelBatch {
    const SIZE: usize = RAW_SAMPLE_SIZE * DEVICE_COUNT;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        for sample in &self.samples {
            out.extend_from_slice(&sample.delta_micros.to_le_bytes());
            put_vec3(&mut out, &sample.accel);
            put_vec3(&mut out, &sample.gyro);
        }
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut idx = 0;
        let mut samples = [RawSample::default(); DEVICE_COUNT];
        for sample in samples.iter_mut() {
            sample.delta_micros = read_u32(bytes, &mut idx);
            sample.accel = read_vec3(bytes, &mut idx);
            sample.gyro = read_vec3(bytes, &mut idx);
        }
        Self { samples }
    }
}

/// One chunk of the device's text channel. A message is complete once a fragment with
/// `has_next == false` arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFragment {
    pub has_next: bool,
    bytes: Vec<u8>,
}

impl TextFragment {
    /// Creates a fragment, truncating `bytes` to what fits in one packet.
    pub fn new(bytes: &[u8], has_next: bool) -> Self {
        let len = bytes.len().min(TEXT_CAPACITY);
        Self {
            has_next,
            bytes: bytes[..len].to_vec(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Splits `text` into fragments the way the firmware does: every fragment but the last
    /// has `has_next` set.
    pub fn split(text: &str) -> Vec<TextFragment> {
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return vec![TextFragment::new(&[], false)];
        }
        let count = bytes.len().div_ceil(TEXT_CAPACITY);
        bytes
            .chunks(TEXT_CAPACITY)
            .enumerate()
            .map(|(i, chunk)| TextFragment::new(chunk, i + 1 < count))
            .collect()
    }
}

impl Payload for TextFragment {
    const SIZE: usize = INNER_SIZE;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&(self.bytes.len() as u32).to_le_bytes());
        out.push(self.has_next as u8);
        out.extend_from_slice(&self.bytes);
        pad_to(&mut out, Self::SIZE);
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut idx = 0;
        let length = (read_u32(bytes, &mut idx) as usize).min(TEXT_CAPACITY);
        let has_next = read_u8(bytes, &mut idx) != 0;
        Self::new(&bytes[idx..idx + length], has_next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigureKind {
    None,
    PollForData,
    Backlight,
    Reset,
    Other(u32),
}

impl ConfigureKind {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            kind::NONE => ConfigureKind::None,
            kind::POLL_FOR_DATA => ConfigureKind::PollForData,
            kind::BACKLIGHT => ConfigureKind::Backlight,
            kind::RESET => ConfigureKind::Reset,
            other => ConfigureKind::Other(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            ConfigureKind::None => kind::NONE,
            ConfigureKind::PollForData => kind::POLL_FOR_DATA,
            ConfigureKind::Backlight => kind::BACKLIGHT,
            ConfigureKind::Reset => kind::RESET,
            ConfigureKind::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigureValue {
    None,
    Ack,
    BacklightSetToggle,
    BacklightSetOn,
    BacklightSetOff,
    BacklightQuery,
    BacklightIsOn,
    BacklightIsOff,
    ResetResultSettings,
    Other(u32),
}

impl ConfigureValue {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            value::NONE => ConfigureValue::None,
            value::ACK => ConfigureValue::Ack,
            value::BACKLIGHT_SET_TOGGLE => ConfigureValue::BacklightSetToggle,
            value::BACKLIGHT_SET_ON => ConfigureValue::BacklightSetOn,
            value::BACKLIGHT_SET_OFF => ConfigureValue::BacklightSetOff,
            value::BACKLIGHT_QUERY => ConfigureValue::BacklightQuery,
            value::BACKLIGHT_IS_ON => ConfigureValue::BacklightIsOn,
            value::BACKLIGHT_IS_OFF => ConfigureValue::BacklightIsOff,
            value::RESET_RESULT_SETTINGS => ConfigureValue::ResetResultSettings,
            other => ConfigureValue::Other(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            ConfigureValue::None => value::NONE,
            ConfigureValue::Ack => value::ACK,
            ConfigureValue::BacklightSetToggle => value::BACKLIGHT_SET_TOGGLE,
            ConfigureValue::BacklightSetOn => value::BACKLIGHT_SET_ON,
            ConfigureValue::BacklightSetOff => value::BACKLIGHT_SET_OFF,
            ConfigureValue::BacklightQuery => value::BACKLIGHT_QUERY,
            ConfigureValue::BacklightIsOn => value::BACKLIGHT_IS_ON,
            ConfigureValue::BacklightIsOff => value::BACKLIGHT_IS_OFF,
            ConfigureValue::ResetResultSettings => value::RESET_RESULT_SETTINGS,
            ConfigureValue::Other(raw) => raw,
        }
    }
}

/// Bidirectional device-control message. The host sends requests, the device answers with
/// acknowledgements that may carry structured `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurePacket {
    pub kind: ConfigureKind,
    pub value: ConfigureValue,
    pub data: [u8; CONFIGURE_DATA_SIZE],
}

impl ConfigurePacket {
    pub fn new(kind: ConfigureKind, value: ConfigureValue) -> Self {
        Self {
            kind,
            value,
            data: [0u8; CONFIGURE_DATA_SIZE],
        }
    }

    pub fn poll_for_data() -> Self {
        Self::new(ConfigureKind::PollForData, ConfigureValue::None)
    }

    pub fn reset() -> Self {
        Self::new(ConfigureKind::Reset, ConfigureValue::None)
    }

    pub fn backlight(command: BacklightCommand) -> Self {
        let value = match command {
            BacklightCommand::Toggle => ConfigureValue::BacklightSetToggle,
            BacklightCommand::On => ConfigureValue::BacklightSetOn,
            BacklightCommand::Off => ConfigureValue::BacklightSetOff,
            BacklightCommand::Query => ConfigureValue::BacklightQuery,
        };
        Self::new(ConfigureKind::Backlight, value)
    }

    /// The acknowledgement the device sends after a reset, carrying its sensor settings.
    pub fn reset_result(settings: &DeviceSettings) -> Self {
        let mut packet = Self::new(ConfigureKind::Reset, ConfigureValue::ResetResultSettings);
        let encoded = settings.encode();
        packet.data[..encoded.len()].copy_from_slice(&encoded);
        packet
    }

    /// Parses the settings snapshot if this is a reset acknowledgement that carries one.
    pub fn settings(&self) -> Option<DeviceSettings> {
        match (self.kind, self.value) {
            (ConfigureKind::Reset, ConfigureValue::ResetResultSettings) => {
                Some(DeviceSettings::decode(&self.data))
            }
            _ => None,
        }
    }
}

impl Payload for ConfigurePacket {
    const SIZE: usize = INNER_SIZE;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.kind.to_u32().to_le_bytes());
        out.extend_from_slice(&self.value.to_u32().to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut idx = 0;
        let kind = ConfigureKind::from_u32(read_u32(bytes, &mut idx));
        let value = ConfigureValue::from_u32(read_u32(bytes, &mut idx));
        let mut data = [0u8; CONFIGURE_DATA_SIZE];
        data.copy_from_slice(&bytes[idx..idx + CONFIGURE_DATA_SIZE]);
        Self { kind, value, data }
    }
}

/// Outbound backlight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BacklightCommand {
    Toggle,
    On,
    Off,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccelFullScale {
    A2G,
    A4G,
    A8G,
    A16G,
}

impl AccelFullScale {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(AccelFullScale::A2G),
            1 => Some(AccelFullScale::A4G),
            2 => Some(AccelFullScale::A8G),
            3 => Some(AccelFullScale::A16G),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn g(self) -> f32 {
        match self {
            AccelFullScale::A2G => 2.0,
            AccelFullScale::A4G => 4.0,
            AccelFullScale::A8G => 8.0,
            AccelFullScale::A16G => 16.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GyroFullScale {
    G250Dps,
    G500Dps,
    G1000Dps,
    G2000Dps,
}

impl GyroFullScale {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(GyroFullScale::G250Dps),
            1 => Some(GyroFullScale::G500Dps),
            2 => Some(GyroFullScale::G1000Dps),
            3 => Some(GyroFullScale::G2000Dps),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn degrees_per_second(self) -> f32 {
        match self {
            GyroFullScale::G250Dps => 250.0,
            GyroFullScale::G500Dps => 500.0,
            GyroFullScale::G1000Dps => 1000.0,
            GyroFullScale::G2000Dps => 2000.0,
        }
    }
}

/// Sensor configuration reported by the device after a reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub accel_range: Option<AccelFullScale>,
    pub gyro_range: Option<GyroFullScale>,
    /// Factory trim per axis, one triple per physical unit.
    pub accel_factory_trims: [[i32; 3]; DEVICE_COUNT],
    pub gyro_factory_trims: [[i32; 3]; DEVICE_COUNT],
}

impl DeviceSettings {
    /// Layout: `[accel_range u8][gyro_range u8][pad 2][accel trims i32×12][gyro trims i32×12]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SETTINGS_SIZE);
        out.push(self.accel_range.map_or(u8::MAX, AccelFullScale::to_u8));
        out.push(self.gyro_range.map_or(u8::MAX, GyroFullScale::to_u8));
        out.extend_from_slice(&[0u8; 2]);
        for trims in self.accel_factory_trims.iter().chain(&self.gyro_factory_trims) {
            for axis in trims {
                out.extend_from_slice(&axis.to_le_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut idx = 0;
        let accel_range = AccelFullScale::from_u8(read_u8(bytes, &mut idx));
        let gyro_range = GyroFullScale::from_u8(read_u8(bytes, &mut idx));
        idx += 2;

        let read_trims = |idx: &mut usize| {
            let mut trims = [[0i32; 3]; DEVICE_COUNT];
            for triple in trims.iter_mut() {
                for axis in triple.iter_mut() {
                    *axis = read_i32(bytes, idx);
                }
            }
            trims
        };
        let accel_factory_trims = read_trims(&mut idx);
        let gyro_factory_trims = read_trims(&mut idx);

        Self {
            accel_range,
            gyro_range,
            accel_factory_trims,
            gyro_factory_trims,
        }
    }
}
