use std::time::{Duration, Instant};

use accel_core::device_track::DeviceTrack;
use accel_core::dispatcher::{Dispatched, DispatcherConfig, PacketDispatcher};
use accel_core::packets::{BacklightCommand, ConfigurePacket, DeviceSettings};
use accel_core::serial_packet::PacketType;
use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::transport::Transport;
use crate::{EngineConfig, ProtocolEngine};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub baud_rate: u32,
    /// How often the device is asked to keep streaming.
    pub poll_interval: Duration,
    pub engine: EngineConfig,
    pub dispatcher: DispatcherConfig,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: 1_000_000,
            poll_interval: Duration::from_millis(750),
            engine: EngineConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// Per-frame view of a connected sensor hub.
///
/// Owns the protocol engine and, while connected, a dispatcher holding one track per physical
/// unit. A render loop calls [`AccelCollection::update`] once per frame and reads the tracks back.
pub struct AccelCollection {
    config: CollectionConfig,
    engine: ProtocolEngine,
    dispatcher: Option<PacketDispatcher>,
    last_poll: Option<Instant>,
}

impl Default for AccelCollection {
    fn default() -> Self {
        Self::new(CollectionConfig::default())
    }
}

impl AccelCollection {
    pub fn new(config: CollectionConfig) -> Self {
        Self {
            config,
            engine: ProtocolEngine::new(config.engine),
            dispatcher: None,
            last_poll: None,
        }
    }

    /// Connects to the hub on `port_name` and asks it for its settings.
    pub fn connect(&mut self, port_name: &str) -> Result<()> {
        self.engine
            .connect(port_name, self.config.baud_rate)
            .with_context(|| format!("Failed to connect to {port_name}"))?;
        self.start_session()
    }

    pub fn connect_with(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        self.engine.connect_with(transport)?;
        self.start_session()
    }

    fn start_session(&mut self) -> Result<()> {
        self.dispatcher = Some(PacketDispatcher::new(self.config.dispatcher));
        self.last_poll = None;
        self.engine
            .send(PacketType::Configure, &ConfigurePacket::reset())
            .context("Failed to request device settings")?;
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.dispatcher = None;
        self.last_poll = None;
        self.engine.disconnect()?;
        Ok(())
    }

    /// Pumps the engine, keeps the stream alive and dispatches everything received since the
    /// last call.
    ///
    /// # Arguments
    ///
    /// - `now` (`Instant`) - Frame time. Used for the poll schedule and as the arrival time of
    ///   every packet drained in this call.
    ///
    /// # Returns
    ///
    /// - `Vec<Dispatched>` - One entry per packet, in arrival order. Empty while disconnected.
    pub fn update(&mut self, now: Instant) -> Result<Vec<Dispatched>> {
        if !self.engine.update() {
            if self.dispatcher.take().is_some() {
                info!("Device disconnected, dropping tracks");
            }
            self.last_poll = None;
            return Ok(Vec::new());
        }

        let poll_due = self
            .last_poll
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.poll_interval);
        if poll_due {
            // A failed poll means the link is going away; the next update notices that, and
            // whatever already arrived is still dispatched below.
            if let Err(e) = self
                .engine
                .send(PacketType::Configure, &ConfigurePacket::poll_for_data())
            {
                warn!("Failed to poll device: {e}");
            }
            self.last_poll = Some(now);
        }

        let packets = self.engine.drain();
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return Ok(Vec::new());
        };
        Ok(packets
            .iter()
            .map(|packet| dispatcher.dispatch(packet, now))
            .collect())
    }

    /// Sends every track back home without talking to the device.
    pub fn reset_all(&mut self) {
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.reset_tracks();
        }
    }

    /// Asks the device to reset and resets the tracks right away.
    pub fn request_reset(&mut self) -> Result<()> {
        self.engine
            .send(PacketType::Configure, &ConfigurePacket::reset())?;
        self.reset_all();
        Ok(())
    }

    pub fn backlight(&mut self, command: BacklightCommand) -> Result<()> {
        self.engine
            .send(PacketType::Configure, &ConfigurePacket::backlight(command))?;
        Ok(())
    }

    pub fn tracks(&self) -> &[DeviceTrack] {
        self.dispatcher
            .as_ref()
            .map(|d| d.tracks())
            .unwrap_or_default()
    }

    pub fn dispatcher(&self) -> Option<&PacketDispatcher> {
        self.dispatcher.as_ref()
    }

    pub fn dispatcher_mut(&mut self) -> Option<&mut PacketDispatcher> {
        self.dispatcher.as_mut()
    }

    pub fn settings(&self) -> Option<&DeviceSettings> {
        self.dispatcher.as_ref().and_then(|d| d.settings())
    }

    pub fn text_log(&self) -> String {
        self.dispatcher
            .as_ref()
            .map(|d| d.text_log_joined())
            .unwrap_or_default()
    }

    pub fn histogram(&self) -> Vec<(u32, u64)> {
        self.dispatcher
            .as_ref()
            .map(|d| d.histogram())
            .unwrap_or_default()
    }

    pub fn packet_count(&self) -> u64 {
        self.engine.packet_count()
    }

    pub fn corrupted_packet_count(&self) -> u64 {
        self.engine.corrupted_packet_count()
    }

    pub fn check_error(&self) -> Option<String> {
        self.engine.check_error()
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }
}
