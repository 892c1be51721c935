use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::axes::AxisRemap;
use crate::constants::payload_constants::DEVICE_COUNT;
use crate::device_track::{DeviceTrack, IngestOutcome, TrackConfig};
use crate::packets::{
    AccelSample, ConfigureKind, ConfigurePacket, ConfigureValue, DeviceSettings, RawAccelBatch,
    TextFragment,
};
use crate::serial_packet::{FrameError, PacketType, SerialPacket};
use crate::utils::bytes_to_text;

/// Text accumulated without a terminating fragment is flushed as a message past this size.
const MAX_TEXT_MESSAGE_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub remap: AxisRemap,
    pub track: TrackConfig,
    /// Completed text messages kept in the rolling log.
    pub text_log_capacity: usize,
    /// Inter-arrival gaps kept for plotting.
    pub gap_history_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            remap: AxisRemap::default(),
            track: TrackConfig::default(),
            text_log_capacity: 5,
            gap_history_capacity: 250,
        }
    }
}

/// The most recent packet of one kind, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestPacket<T> {
    pub payload: T,
    pub crc: u32,
    pub magic: u64,
}

/// What [`PacketDispatcher::dispatch`] did with a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Device-fused sample applied to track 0.
    Accel(IngestOutcome),
    /// Raw batch, one outcome per track.
    RawAccel([IngestOutcome; DEVICE_COUNT]),
    /// Text fragment stored. Carries the message if this fragment completed one.
    Text(Option<String>),
    /// Device finished a reset and reported its settings. Every track was reset.
    Settings(DeviceSettings),
    /// Device reported its backlight state.
    Backlight(bool),
    /// Any other configure message, logged only.
    Configure(ConfigureKind, ConfigureValue),
    /// Type `None`, nothing to do.
    Empty,
    /// Type id this build does not know.
    Unknown(u32),
    /// Payload could not be viewed as its declared type.
    Rejected(FrameError),
}

/// Routes validated packets to their handlers and keeps the per-frame view of the device.
///
/// Lives on the consumer side of the packet queue and is single-threaded.
pub struct PacketDispatcher {
    config: DispatcherConfig,
    tracks: Vec<DeviceTrack>,
    histogram: BTreeMap<u32, u64>,
    gaps_ms: VecDeque<f32>,
    last_arrival: Option<Instant>,
    text_buffer: Vec<u8>,
    text_log: VecDeque<String>,
    settings: Option<DeviceSettings>,
    backlight: Option<bool>,
    latest_accel: Option<LatestPacket<AccelSample>>,
    latest_raw: Option<LatestPacket<RawAccelBatch>>,
}

impl Default for PacketDispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl PacketDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            tracks: (0..DEVICE_COUNT)
                .map(|i| DeviceTrack::new(i, config.track))
                .collect(),
            histogram: BTreeMap::new(),
            gaps_ms: VecDeque::with_capacity(config.gap_history_capacity),
            last_arrival: None,
            text_buffer: Vec::new(),
            text_log: VecDeque::with_capacity(config.text_log_capacity),
            settings: None,
            backlight: None,
            latest_accel: None,
            latest_raw: None,
        }
    }

    /// Handles one validated packet.
    ///
    /// # Arguments
    ///
    /// - `packet` (`&SerialPacket`) - A packet that already passed its CRC check.
    /// - `arrival` (`Instant`) - When the packet was taken off the queue, used for the
    ///   inter-arrival history.
    pub fn dispatch(&mut self, packet: &SerialPacket, arrival: Instant) -> Dispatched {
        let raw_type = packet.packet_type_raw();
        *self.histogram.entry(raw_type).or_insert(0) += 1;
        self.record_arrival(arrival);

        let Some(packet_type) = packet.packet_type() else {
            warn!("Ignoring packet with unknown type {raw_type}");
            return Dispatched::Unknown(raw_type);
        };

        let dispatched = match packet_type {
            PacketType::None => Ok(Dispatched::Empty),
            PacketType::Accel => packet
                .inner_as::<AccelSample>()
                .map(|sample| self.handle_accel(packet, sample)),
            PacketType::RawAccel => packet
                .inner_as::<RawAccelBatch>()
                .map(|batch| self.handle_raw(packet, batch)),
            PacketType::Text => packet
                .inner_as::<TextFragment>()
                .map(|fragment| Dispatched::Text(self.handle_text(fragment))),
            PacketType::Configure => packet
                .inner_as::<ConfigurePacket>()
                .map(|configure| self.handle_configure(configure)),
        };

        dispatched.unwrap_or_else(|err| {
            warn!("Dropping {packet_type:?} packet: {err}");
            Dispatched::Rejected(err)
        })
    }

    fn record_arrival(&mut self, arrival: Instant) {
        if let Some(last) = self.last_arrival {
            if self.gaps_ms.len() == self.config.gap_history_capacity {
                self.gaps_ms.pop_front();
            }
            if self.config.gap_history_capacity > 0 {
                let gap = arrival.saturating_duration_since(last);
                self.gaps_ms.push_back(gap.as_secs_f32() * 1000.0);
            }
        }
        self.last_arrival = Some(arrival);
    }

    fn handle_accel(&mut self, packet: &SerialPacket, sample: AccelSample) -> Dispatched {
        let remap = self.config.remap;
        let delta_seconds = sample.delta_micros as f32 / 1_000_000.0;
        let orientation = remap.quaternion(&sample.gyro_quat);
        let accel = remap.vector(&sample.accel);

        self.latest_accel = Some(LatestPacket {
            payload: sample,
            crc: packet.crc(),
            magic: packet.magic(),
        });

        let outcome = match self.tracks.first_mut() {
            Some(track) => track.apply_device_fused(delta_seconds, orientation, accel),
            None => IngestOutcome::Invalid,
        };
        Dispatched::Accel(outcome)
    }

    fn handle_raw(&mut self, packet: &SerialPacket, batch: RawAccelBatch) -> Dispatched {
        let remap = self.config.remap;
        let mut outcomes = [IngestOutcome::Invalid; DEVICE_COUNT];

        for ((sample, track), outcome) in batch
            .samples
            .iter()
            .zip(self.tracks.iter_mut())
            .zip(outcomes.iter_mut())
        {
            *outcome = track.ingest(
                sample.delta_seconds(),
                remap.vector(&sample.accel),
                remap.vector(&sample.gyro),
            );
        }

        self.latest_raw = Some(LatestPacket {
            payload: batch,
            crc: packet.crc(),
            magic: packet.magic(),
        });
        Dispatched::RawAccel(outcomes)
    }

    /// Appends a fragment and returns the completed message, if any.
    fn handle_text(&mut self, fragment: TextFragment) -> Option<String> {
        if fragment.bytes().is_empty() && self.text_buffer.is_empty() {
            return None;
        }
        self.text_buffer.extend_from_slice(fragment.bytes());
        if fragment.has_next && self.text_buffer.len() < MAX_TEXT_MESSAGE_BYTES {
            return None;
        }

        let message = bytes_to_text(&self.text_buffer);
        self.text_buffer.clear();
        debug!("Device says: {message}");

        if self.config.text_log_capacity > 0 {
            if self.text_log.len() == self.config.text_log_capacity {
                self.text_log.pop_front();
            }
            self.text_log.push_back(message.clone());
        }
        Some(message)
    }

    fn handle_configure(&mut self, configure: ConfigurePacket) -> Dispatched {
        match (configure.kind, configure.value) {
            (ConfigureKind::Reset, ConfigureValue::ResetResultSettings) => {
                let Some(settings) = configure.settings() else {
                    return Dispatched::Configure(configure.kind, configure.value);
                };
                info!(
                    "Device reset: accel range {:?}, gyro range {:?}",
                    settings.accel_range, settings.gyro_range
                );
                self.reset_tracks();
                self.settings = Some(settings.clone());
                Dispatched::Settings(settings)
            }
            (ConfigureKind::Backlight, ConfigureValue::BacklightIsOn) => {
                self.backlight = Some(true);
                Dispatched::Backlight(true)
            }
            (ConfigureKind::Backlight, ConfigureValue::BacklightIsOff) => {
                self.backlight = Some(false);
                Dispatched::Backlight(false)
            }
            (kind @ ConfigureKind::Other(_), value) | (kind, value @ ConfigureValue::Other(_)) => {
                warn!("Unrecognised configure message {kind:?} / {value:?}");
                Dispatched::Configure(kind, value)
            }
            (kind, value) => {
                info!("Configure {kind:?}: {value:?}");
                Dispatched::Configure(kind, value)
            }
        }
    }

    /// Resets every track's fusion state and position.
    pub fn reset_tracks(&mut self) {
        for track in &mut self.tracks {
            track.reset();
        }
    }

    pub fn tracks(&self) -> &[DeviceTrack] {
        &self.tracks
    }

    pub fn track(&self, index: usize) -> Option<&DeviceTrack> {
        self.tracks.get(index)
    }

    /// Packets seen per raw type id, ordered by id.
    pub fn histogram(&self) -> Vec<(u32, u64)> {
        self.histogram.iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// Recent inter-arrival gaps in milliseconds, oldest first.
    pub fn arrival_gaps_ms(&self) -> impl Iterator<Item = f32> + '_ {
        self.gaps_ms.iter().copied()
    }

    pub fn text_log(&self) -> impl Iterator<Item = &str> {
        self.text_log.iter().map(String::as_str)
    }

    /// The whole text log as one string, one message per line.
    pub fn text_log_joined(&self) -> String {
        self.text_log
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear_text_log(&mut self) {
        self.text_log.clear();
    }

    pub fn settings(&self) -> Option<&DeviceSettings> {
        self.settings.as_ref()
    }

    /// Last backlight state the device reported, if it has reported one.
    pub fn backlight(&self) -> Option<bool> {
        self.backlight
    }

    pub fn latest_accel(&self) -> Option<&LatestPacket<AccelSample>> {
        self.latest_accel.as_ref()
    }

    pub fn latest_raw(&self) -> Option<&LatestPacket<RawAccelBatch>> {
        self.latest_raw.as_ref()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

/// Display name for a raw packet type id.
pub fn packet_type_name(raw: u32) -> String {
    match PacketType::from_u32(raw) {
        Some(packet_type) => format!("{packet_type:?}"),
        None => format!("Unknown({raw})"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nalgebra::{Quaternion, Vector3};

    use super::*;
    use crate::constants::packet_constants::INNER_SIZE;
    use crate::constants::sample_constants::GRAVITY_METERS_PER_SECONDS_SQUARED;
    use crate::packets::{AccelFullScale, BacklightCommand, GyroFullScale, RawSample};

    fn packet<T: crate::serial_packet::Payload>(packet_type: PacketType, payload: &T) -> SerialPacket {
        SerialPacket::from_payload(packet_type, payload).unwrap()
    }

    fn resting_batch(delta_micros: u32) -> RawAccelBatch {
        let sample = RawSample {
            delta_micros,
            // Remapped (y, -x, z) this is gravity on +z.
            accel: Vector3::new(0.0, 0.0, GRAVITY_METERS_PER_SECONDS_SQUARED),
            gyro: Vector3::zeros(),
        };
        RawAccelBatch {
            samples: [sample; DEVICE_COUNT],
        }
    }

    #[test]
    fn raw_batch_feeds_every_track() {
        let mut dispatcher = PacketDispatcher::default();
        let now = Instant::now();

        let result = dispatcher.dispatch(&packet(PacketType::RawAccel, &resting_batch(10_000)), now);
        assert_eq!(result, Dispatched::RawAccel([IngestOutcome::Fused; DEVICE_COUNT]));
        for track in dispatcher.tracks() {
            assert_eq!(track.stats().fused, 1);
        }
        assert!(dispatcher.latest_raw().is_some());
    }

    #[test]
    fn stale_raw_sample_is_rejected_per_track() {
        let mut dispatcher = PacketDispatcher::default();
        let mut batch = resting_batch(10_000);
        batch.samples[2].delta_micros = 1_000_000;

        let result = dispatcher.dispatch(&packet(PacketType::RawAccel, &batch), Instant::now());
        let Dispatched::RawAccel(outcomes) = result else {
            panic!("unexpected {result:?}");
        };
        assert_eq!(outcomes[2], IngestOutcome::Stale);
        assert_eq!(outcomes[0], IngestOutcome::Fused);
        assert_eq!(
            dispatcher.track(2).unwrap().position(),
            DeviceTrack::home_position(2)
        );
    }

    #[test]
    fn accel_sample_drives_track_zero_with_remap() {
        let mut dispatcher = PacketDispatcher::default();
        let sample = AccelSample {
            delta_micros: 10_000,
            accel: Vector3::new(1.0, 0.0, 0.0),
            gyro_quat: Quaternion::identity(),
            gyro_euler: Vector3::zeros(),
        };

        let result = dispatcher.dispatch(&packet(PacketType::Accel, &sample), Instant::now());
        assert_eq!(result, Dispatched::Accel(IngestOutcome::Fused));

        let track = dispatcher.track(0).unwrap();
        // (x, y, z) -> (y, -x, z)
        assert!((track.velocity() - Vector3::new(0.0, -0.01, 0.0)).norm() < 1e-6);
        assert_eq!(dispatcher.latest_accel().unwrap().payload, sample);
    }

    #[test]
    fn text_fragments_reassemble_in_order() {
        let mut dispatcher = PacketDispatcher::default();
        let text = "a".repeat(150) + "tail";
        let fragments = TextFragment::split(&text);
        assert_eq!(fragments.len(), 2);

        let now = Instant::now();
        let first = dispatcher.dispatch(&packet(PacketType::Text, &fragments[0]), now);
        assert_eq!(first, Dispatched::Text(None));
        let second = dispatcher.dispatch(&packet(PacketType::Text, &fragments[1]), now);
        assert_eq!(second, Dispatched::Text(Some(text.clone())));
        assert_eq!(dispatcher.text_log().collect::<Vec<_>>(), vec![text.as_str()]);
    }

    #[test]
    fn three_fragment_message_concatenates() {
        let mut dispatcher = PacketDispatcher::default();
        let now = Instant::now();
        for (chunk, has_next) in [("hel", true), ("lo ", true), ("world", false)] {
            let fragment = TextFragment::new(chunk.as_bytes(), has_next);
            dispatcher.dispatch(&packet(PacketType::Text, &fragment), now);
        }
        assert_eq!(dispatcher.text_log_joined(), "hello world");
    }

    #[test]
    fn text_log_keeps_last_five() {
        let mut dispatcher = PacketDispatcher::default();
        let now = Instant::now();
        for i in 0..7 {
            let fragment = TextFragment::new(format!("msg {i}\0").as_bytes(), false);
            dispatcher.dispatch(&packet(PacketType::Text, &fragment), now);
        }
        let log: Vec<&str> = dispatcher.text_log().collect();
        assert_eq!(log, vec!["msg 2 ", "msg 3 ", "msg 4 ", "msg 5 ", "msg 6 "]);

        dispatcher.clear_text_log();
        assert_eq!(dispatcher.text_log().count(), 0);
    }

    #[test]
    fn empty_fragment_does_not_evict_messages() {
        let mut dispatcher = PacketDispatcher::default();
        let now = Instant::now();
        for i in 0..5 {
            let fragment = TextFragment::new(format!("msg {i}").as_bytes(), false);
            dispatcher.dispatch(&packet(PacketType::Text, &fragment), now);
        }

        let empty = TextFragment::new(&[], false);
        let result = dispatcher.dispatch(&packet(PacketType::Text, &empty), now);
        assert_eq!(result, Dispatched::Text(None));
        assert_eq!(dispatcher.text_log().count(), 5);
        assert_eq!(dispatcher.text_log().next(), Some("msg 0"));

        // An empty last fragment still terminates a pending message.
        let head = TextFragment::new(b"partial", true);
        dispatcher.dispatch(&packet(PacketType::Text, &head), now);
        let result = dispatcher.dispatch(&packet(PacketType::Text, &empty), now);
        assert_eq!(result, Dispatched::Text(Some("partial".to_string())));
    }

    #[test]
    fn reset_result_stores_settings_and_resets_tracks() {
        let mut dispatcher = PacketDispatcher::default();
        let now = Instant::now();
        let moving = AccelSample {
            delta_micros: 10_000,
            accel: Vector3::new(0.0, 5.0, 0.0),
            gyro_quat: Quaternion::identity(),
            gyro_euler: Vector3::zeros(),
        };
        dispatcher.dispatch(&packet(PacketType::Accel, &moving), now);
        assert_ne!(dispatcher.track(0).unwrap().position(), DeviceTrack::home_position(0));

        let settings = DeviceSettings {
            accel_range: Some(AccelFullScale::A4G),
            gyro_range: Some(GyroFullScale::G500Dps),
            accel_factory_trims: [[1, 2, 3]; DEVICE_COUNT],
            gyro_factory_trims: [[4, 5, 6]; DEVICE_COUNT],
        };
        let result = dispatcher.dispatch(
            &packet(PacketType::Configure, &ConfigurePacket::reset_result(&settings)),
            now,
        );

        assert_eq!(result, Dispatched::Settings(settings.clone()));
        assert_eq!(dispatcher.settings(), Some(&settings));
        assert_eq!(dispatcher.track(0).unwrap().position(), DeviceTrack::home_position(0));
    }

    #[test]
    fn backlight_reports_are_remembered() {
        let mut dispatcher = PacketDispatcher::default();
        assert_eq!(dispatcher.backlight(), None);

        let on = ConfigurePacket::new(ConfigureKind::Backlight, ConfigureValue::BacklightIsOn);
        let result = dispatcher.dispatch(&packet(PacketType::Configure, &on), Instant::now());
        assert_eq!(result, Dispatched::Backlight(true));
        assert_eq!(dispatcher.backlight(), Some(true));

        let ack = ConfigurePacket::backlight(BacklightCommand::Toggle);
        let result = dispatcher.dispatch(&packet(PacketType::Configure, &ack), Instant::now());
        assert_eq!(
            result,
            Dispatched::Configure(ConfigureKind::Backlight, ConfigureValue::BacklightSetToggle)
        );
        assert_eq!(dispatcher.backlight(), Some(true));
    }

    #[test]
    fn unknown_types_are_counted_not_fatal() {
        let mut dispatcher = PacketDispatcher::default();
        let now = Instant::now();
        let unknown = SerialPacket::new(42, [0u8; INNER_SIZE]);
        assert_eq!(dispatcher.dispatch(&unknown, now), Dispatched::Unknown(42));
        assert_eq!(dispatcher.dispatch(&unknown, now), Dispatched::Unknown(42));

        let empty = SerialPacket::new(PacketType::None.to_u32(), [0u8; INNER_SIZE]);
        assert_eq!(dispatcher.dispatch(&empty, now), Dispatched::Empty);

        assert_eq!(dispatcher.histogram(), vec![(0, 1), (42, 2)]);
        assert_eq!(packet_type_name(42), "Unknown(42)");
        assert_eq!(packet_type_name(2), "RawAccel");
    }

    #[test]
    fn arrival_gaps_are_bounded() {
        let config = DispatcherConfig {
            gap_history_capacity: 3,
            ..DispatcherConfig::default()
        };
        let mut dispatcher = PacketDispatcher::new(config);
        let empty = SerialPacket::new(PacketType::None.to_u32(), [0u8; INNER_SIZE]);
        let start = Instant::now();
        for i in 0..6u64 {
            dispatcher.dispatch(&empty, start + Duration::from_millis(10 * i));
        }
        let gaps: Vec<f32> = dispatcher.arrival_gaps_ms().collect();
        assert_eq!(gaps.len(), 3);
        assert!(gaps.iter().all(|g| (g - 10.0).abs() < 1e-3));
    }
}
