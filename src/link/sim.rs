//! Synthetic Atlas unit. Sails a circle at constant speed and answers reads
//! and notifications with frames in the device's wire format, so the whole
//! pipeline runs without a radio.

use std::collections::HashSet;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::transport::{Advertisement, Transport, TransportSignal};
use crate::error::{LinkError, LinkResult};
use crate::geo::{wrap_deg, EARTH_RADIUS_M, MPS_TO_KNOTS};
use crate::protocol::{COMPACT_MARKER, MAIN_MARKER, SERVICE_UUID, WAKE_UP_COMMAND};
use crate::types::Channel;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub name: String,
    pub address: String,
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_m: f64,
    pub speed_knots: f64,
    /// Push frames on subscribed channels. When false only reads return data.
    pub notifications: bool,
    pub main_period: Duration,
    pub compact_period: Duration,
    /// (pin, rcb) appended to every main frame.
    pub start_line: Option<((f64, f64), (f64, f64))>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "Atlas 2 (simulated)".to_string(),
            address: "5A:11:00:76:00:01".to_string(),
            center_lat: 42.2303,
            center_lon: -8.7330,
            radius_m: 150.0,
            speed_knots: 5.0,
            notifications: true,
            main_period: Duration::from_secs(1),
            compact_period: Duration::from_millis(200),
            start_line: None,
        }
    }
}

#[derive(Default)]
struct SimInner {
    connected: bool,
    awake: bool,
    subscribed: HashSet<Channel>,
    producer: Option<CancellationToken>,
    // Held so the signal channel stays open while connected
    signals: Option<mpsc::UnboundedSender<TransportSignal>>,
}

#[derive(Clone)]
pub struct SimulatedTransport {
    config: SimConfig,
    inner: Arc<Mutex<SimInner>>,
    started: Instant,
}

/// One instant of the simulated boat.
#[derive(Clone, Copy, Debug)]
struct BoatSample {
    lat: f64,
    lon: f64,
    heading_deg: f64,
    speed_mps: f64,
    heel_deg: f64,
    pitch_deg: f64,
}

impl SimulatedTransport {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(SimInner::default())),
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        // A poisoned lock only means a panicking test; the state is still usable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sample(config: &SimConfig, elapsed_s: f64) -> BoatSample {
        let speed_mps = config.speed_knots / MPS_TO_KNOTS;
        let omega = if config.radius_m > 0.0 { speed_mps / config.radius_m } else { 0.0 };
        let theta = omega * elapsed_s;

        let north = config.radius_m * theta.cos();
        let east = config.radius_m * theta.sin();
        let lat = config.center_lat + (north / EARTH_RADIUS_M).to_degrees();
        let lon = config.center_lon
            + (east / (EARTH_RADIUS_M * config.center_lat.to_radians().cos())).to_degrees();

        BoatSample {
            lat,
            lon,
            heading_deg: wrap_deg(theta.to_degrees() + 90.0),
            speed_mps,
            heel_deg: 12.0 + (elapsed_s * 0.7).sin() * 3.0,
            pitch_deg: (elapsed_s * 2.0 * PI / 4.0).sin() * 2.0,
        }
    }

    fn main_frame(config: &SimConfig, s: &BoatSample) -> Vec<u8> {
        let mut frame = vec![MAIN_MARKER, 0x0A, 0, 0, 0, 0, 0, 0];
        for v in [
            s.lat,
            s.lon,
            s.heading_deg,
            s.pitch_deg,
            s.heel_deg,
            s.speed_mps,
            s.heading_deg,
        ] {
            frame.extend_from_slice(&(v as f32).to_le_bytes());
        }
        if let Some(((pin_lat, pin_lon), (rcb_lat, rcb_lon))) = config.start_line {
            for v in [pin_lat, pin_lon, rcb_lat, rcb_lon] {
                frame.extend_from_slice(&(v as f32).to_le_bytes());
            }
        }
        frame
    }

    fn compact_frame(s: &BoatSample) -> Vec<u8> {
        let heading = (s.heading_deg * 10.0).round() as u16;
        // Speed in hundredths of a knot; the receiver has to work that out
        let speed = (s.speed_mps * MPS_TO_KNOTS * 100.0).round().clamp(0.0, u16::MAX as f64) as u16;
        let mut frame = vec![COMPACT_MARKER, 0x01];
        frame.extend_from_slice(&heading.to_le_bytes());
        frame.extend_from_slice(&speed.to_le_bytes());
        frame
    }

    fn frame_for(config: &SimConfig, channel: Channel, elapsed_s: f64) -> Vec<u8> {
        let s = Self::sample(config, elapsed_s);
        match channel {
            Channel::Main => Self::main_frame(config, &s),
            Channel::Compact => Self::compact_frame(&s),
        }
    }

    fn spawn_producer(&self, tx: mpsc::UnboundedSender<TransportSignal>, token: CancellationToken) {
        let config = self.config.clone();
        let inner = Arc::clone(&self.inner);
        let started = self.started;

        tokio::spawn(async move {
            let mut tick = interval(config.compact_period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let ratio = config.main_period.as_secs_f64() / config.compact_period.as_secs_f64();
            let main_every = ratio
                .round()
                .max(1.0) as u64;
            let mut ticks = 0u64;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }

                let (awake, main, compact) = {
                    let guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                    (
                        guard.awake,
                        guard.subscribed.contains(&Channel::Main),
                        guard.subscribed.contains(&Channel::Compact),
                    )
                };
                if !awake {
                    continue;
                }

                let elapsed = started.elapsed().as_secs_f64();
                let mut frames = Vec::new();
                if compact {
                    let bytes = Self::frame_for(&config, Channel::Compact, elapsed);
                    frames.push((Channel::Compact, bytes));
                }
                if main && ticks % main_every == 0 {
                    let bytes = Self::frame_for(&config, Channel::Main, elapsed);
                    frames.push((Channel::Main, bytes));
                }
                ticks += 1;

                for (channel, bytes) in frames {
                    if tx.send(TransportSignal::Notification { channel, bytes }).is_err() {
                        log::debug!("Simulated notifications stopped: receiver closed");
                        return;
                    }
                }
            }
        });
    }
}

impl Transport for SimulatedTransport {
    async fn scan(&self, timeout: Duration) -> LinkResult<Vec<Advertisement>> {
        // A real scan would listen for the whole window; advertising is instant here
        tokio::time::sleep(timeout.min(Duration::from_millis(100))).await;
        Ok(vec![Advertisement {
            name: Some(self.config.name.clone()),
            address: self.config.address.clone(),
            rssi: Some(-58),
            service_uuids: vec![SERVICE_UUID.to_string()],
        }])
    }

    async fn connect(&self, address: &str) -> LinkResult<UnboundedReceiver<TransportSignal>> {
        if !address.eq_ignore_ascii_case(&self.config.address) {
            return Err(LinkError::Connect(format!("unknown device {}", address)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        {
            let mut inner = self.lock();
            if let Some(old) = inner.producer.take() {
                old.cancel();
            }
            inner.connected = true;
            inner.awake = false;
            inner.subscribed.clear();
            inner.producer = Some(token.clone());
            inner.signals = Some(tx.clone());
        }
        if self.config.notifications {
            self.spawn_producer(tx, token);
        }
        log::info!("Simulated link up: {}", address);
        Ok(rx)
    }

    async fn subscribe(&self, channel: Channel) -> LinkResult<()> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(LinkError::NotConnected);
        }
        inner.subscribed.insert(channel);
        Ok(())
    }

    async fn read(&self, channel: Channel) -> LinkResult<Vec<u8>> {
        if !self.lock().connected {
            return Err(LinkError::NotConnected);
        }
        Ok(Self::frame_for(
            &self.config,
            channel,
            self.started.elapsed().as_secs_f64(),
        ))
    }

    async fn write_command(&self, payload: &[u8]) -> LinkResult<()> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(LinkError::NotConnected);
        }
        if payload == WAKE_UP_COMMAND.as_slice() {
            inner.awake = true;
        }
        Ok(())
    }

    async fn disconnect(&self) -> LinkResult<()> {
        let mut inner = self.lock();
        if let Some(token) = inner.producer.take() {
            token.cancel();
        }
        inner.connected = false;
        inner.awake = false;
        inner.subscribed.clear();
        inner.signals = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}
