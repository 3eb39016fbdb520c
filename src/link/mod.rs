//! Device link: discovery, connection, subscription, the no-data watchdog,
//! the polling fallback and reconnect with backoff.
//!
//! One `tokio::select!` loop owns a session. Notifications, the watchdog,
//! the delayed poll trigger, the poll ticker and the stop token are all
//! branches of that loop, so only one poller can ever run and every timer
//! dies with the session.

pub mod backoff;
pub mod sim;
pub mod transport;

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{LinkError, LinkResult};
use crate::event_bus::EventSender;
use crate::protocol::{decode_compact, decode_main, extract_line_candidates, WAKE_UP_COMMAND};
use crate::types::{current_timestamp, Channel, ConnectionStatus, FrameSource, TelemetryEvent};

pub use backoff::ReconnectBackoff;
pub use sim::{SimConfig, SimulatedTransport};
pub use transport::{looks_like_address, select_device, Advertisement, Transport, TransportSignal};

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Address, or a case-insensitive name fragment to match during scans.
    pub device_hint: Option<String>,
    pub scan_timeout: Duration,
    /// Wait before scanning again when no device matched.
    pub rescan_interval: Duration,
    pub reconnect_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Warn and force polling if nothing decodes for this long after connect.
    pub no_data_timeout: Duration,
    /// Start polling early if notifications have not produced data yet.
    pub poll_start_delay: Duration,
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    pub wake_up_command: Vec<u8>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_hint: None,
            scan_timeout: Duration::from_secs(8),
            rescan_interval: Duration::from_secs(2),
            reconnect_backoff: Duration::from_secs(2),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_secs(30),
            no_data_timeout: Duration::from_secs(6),
            poll_start_delay: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(200),
            read_timeout: Duration::from_secs(2),
            wake_up_command: WAKE_UP_COMMAND.to_vec(),
        }
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Scanning,
    Connecting,
    /// Connected, data expected via notifications.
    Streaming,
    /// Connected, polling fallback active.
    Polling,
    /// Waiting before the next connection attempt.
    Backoff,
}

impl LinkPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkPhase::Idle => "idle",
            LinkPhase::Scanning => "scanning",
            LinkPhase::Connecting => "connecting",
            LinkPhase::Streaming => "streaming",
            LinkPhase::Polling => "polling",
            LinkPhase::Backoff => "backoff",
        }
    }
}

enum SessionEnd {
    Stopped,
    Dropped { had_data: bool },
    Failed,
}

#[derive(Default)]
struct SessionState {
    first_data: bool,
    no_data_warned: bool,
    polling: bool,
    last_main: Option<Vec<u8>>,
    last_compact: Option<Vec<u8>>,
    frames: u64,
}

impl SessionState {
    fn last_seen(&mut self, channel: Channel) -> &mut Option<Vec<u8>> {
        match channel {
            Channel::Main => &mut self.last_main,
            Channel::Compact => &mut self.last_compact,
        }
    }
}

// ─── Link ───────────────────────────────────────────────────────────────────

pub struct AtlasLink<T: Transport> {
    transport: T,
    config: LinkConfig,
    events: EventSender,
    stop: CancellationToken,
    phase: watch::Sender<LinkPhase>,
}

impl<T: Transport> AtlasLink<T> {
    pub fn new(transport: T, config: LinkConfig, events: EventSender) -> Self {
        let (phase, _) = watch::channel(LinkPhase::Idle);
        Self {
            transport,
            config,
            events,
            stop: CancellationToken::new(),
            phase,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn phase(&self) -> LinkPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<LinkPhase> {
        self.phase.subscribe()
    }

    /// Token that ends `run` when cancelled. Safe to cancel from anywhere.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Keep a device connected until stopped. Every failure is reported as a
    /// status event and followed by a rescan or reconnect; nothing escapes.
    pub async fn run(&self) {
        log::info!("Atlas link starting");
        self.emit_status(ConnectionStatus::disconnected(None, None));

        let mut backoff = ReconnectBackoff::new(
            self.config.reconnect_backoff,
            self.config.backoff_multiplier,
            self.config.max_backoff,
        );

        while !self.stop.is_cancelled() {
            self.set_phase(LinkPhase::Scanning);
            let resolved = tokio::select! {
                _ = self.stop.cancelled() => break,
                r = self.resolve_device() => r,
            };

            let address = match resolved {
                Ok(Some(address)) => address,
                Ok(None) => {
                    log::info!(
                        "No Atlas device found, rescanning in {:.1}s",
                        self.config.rescan_interval.as_secs_f64()
                    );
                    self.emit_status(ConnectionStatus::disconnected(
                        None,
                        Some("Atlas 2 not found (scan)".to_string()),
                    ));
                    if self.pause(self.config.rescan_interval).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    log::error!("Device discovery failed: {}", err);
                    self.emit_status(ConnectionStatus::disconnected(None, Some(err.to_string())));
                    if self.pause(self.config.rescan_interval).await {
                        break;
                    }
                    continue;
                }
            };

            match self.run_session(&address).await {
                SessionEnd::Stopped => break,
                SessionEnd::Dropped { had_data: true } => backoff.record_success(),
                SessionEnd::Dropped { had_data: false } | SessionEnd::Failed => {}
            }

            self.set_phase(LinkPhase::Backoff);
            let delay = backoff.record_failed_attempt();
            if self.pause(delay).await {
                break;
            }
        }

        self.shutdown().await;
    }

    async fn resolve_device(&self) -> LinkResult<Option<String>> {
        if let Some(hint) = self.config.device_hint.as_deref() {
            if looks_like_address(hint) {
                return Ok(Some(hint.trim().to_string()));
            }
        }
        log::info!(
            "Scanning for Atlas device ({:.0}s)",
            self.config.scan_timeout.as_secs_f64()
        );
        // The transport owns the scan window; allow it one read timeout of slack
        let limit = self.config.scan_timeout + self.config.read_timeout;
        let scan = self.transport.scan(self.config.scan_timeout);
        let advertisements = match time::timeout(limit, scan).await {
            Ok(scanned) => scanned?,
            Err(_) => {
                return Err(LinkError::Scan(format!(
                    "no result within {:.0}s",
                    limit.as_secs_f64()
                )))
            }
        };
        Ok(select_device(
            &advertisements,
            self.config.device_hint.as_deref(),
        ))
    }

    async fn run_session(&self, address: &str) -> SessionEnd {
        self.set_phase(LinkPhase::Connecting);
        log::info!("Connecting to {}", address);

        let connected = tokio::select! {
            _ = self.stop.cancelled() => return SessionEnd::Stopped,
            r = self.transport.connect(address) => r,
        };
        let mut signals = match connected {
            Ok(signals) => signals,
            Err(err) => return self.fail_session(address, err).await,
        };
        self.emit_status(ConnectionStatus::connected(address));

        // Both timers count from the moment the link is up
        let watchdog = time::sleep(self.config.no_data_timeout);
        tokio::pin!(watchdog);
        let mut watchdog_armed = true;

        let delayed_poll = time::sleep(self.config.poll_start_delay);
        tokio::pin!(delayed_poll);
        let mut delayed_poll_armed = true;

        for channel in [Channel::Main, Channel::Compact] {
            match time::timeout(self.config.read_timeout, self.transport.subscribe(channel)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::warn!("Subscribe to {:?} failed: {}", channel, err),
                Err(_) => log::warn!("Subscribe to {:?} timed out", channel),
            }
        }

        self.set_phase(LinkPhase::Streaming);
        let mut session = SessionState::default();

        let wake = self.transport.write_command(&self.config.wake_up_command);
        tokio::pin!(wake);
        let mut wake_pending = !self.config.wake_up_command.is_empty();

        let mut poll_tick = time::interval(self.config.poll_interval);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return SessionEnd::Stopped,

                signal = signals.recv() => match signal {
                    Some(TransportSignal::Notification { channel, bytes }) => {
                        let source = FrameSource::Notification;
                        self.handle_frame(address, channel, bytes, source, &mut session);
                    }
                    Some(TransportSignal::Disconnected) | None => {
                        let frames = session.frames;
                        log::warn!("Device {} disconnected after {} frame(s)", address, frames);
                        self.emit_status(ConnectionStatus::disconnected(
                            Some(address),
                            Some(LinkError::Disconnected.to_string()),
                        ));
                        self.disconnect_quietly().await;
                        return SessionEnd::Dropped { had_data: session.first_data };
                    }
                },

                result = &mut wake, if wake_pending => {
                    wake_pending = false;
                    if let Err(err) = result {
                        log::warn!("Wake-up command failed: {}", err);
                    }
                }

                _ = &mut watchdog, if watchdog_armed => {
                    watchdog_armed = false;
                    if !session.first_data {
                        let secs = self.config.no_data_timeout.as_secs_f64();
                        log::warn!("No telemetry {:.1}s after connect, forcing poll", secs);
                        session.no_data_warned = true;
                        self.emit_status(ConnectionStatus {
                            connected: true,
                            device_address: Some(address.to_string()),
                            error: Some(format!(
                                "No telemetry received after {:.0}s; polling characteristics",
                                secs
                            )),
                        });
                        self.start_polling(&mut session, &mut poll_tick);
                    }
                }

                _ = &mut delayed_poll, if delayed_poll_armed => {
                    delayed_poll_armed = false;
                    if !session.first_data {
                        self.start_polling(&mut session, &mut poll_tick);
                    }
                }

                _ = poll_tick.tick(), if session.polling => {
                    let polled = tokio::select! {
                        _ = self.stop.cancelled() => return SessionEnd::Stopped,
                        r = self.poll_once(address, &mut session) => r,
                    };
                    if let Err(err) = polled {
                        return self.fail_session(address, err).await;
                    }
                }
            }
        }
    }

    fn start_polling(&self, session: &mut SessionState, poll_tick: &mut Interval) {
        if session.polling {
            return;
        }
        log::info!(
            "Polling telemetry every {}ms",
            self.config.poll_interval.as_millis()
        );
        session.polling = true;
        poll_tick.reset();
        self.set_phase(LinkPhase::Polling);
    }

    /// Read both characteristics once, forwarding only values that differ
    /// from the last frame seen on that channel.
    async fn poll_once(&self, address: &str, session: &mut SessionState) -> LinkResult<()> {
        for channel in [Channel::Main, Channel::Compact] {
            let read = time::timeout(self.config.read_timeout, self.transport.read(channel));
            let bytes = match read.await {
                Ok(read) => read?,
                Err(_) => return Err(LinkError::Timeout(self.config.read_timeout.as_secs_f64())),
            };
            if bytes.is_empty() || session.last_seen(channel).as_deref() == Some(bytes.as_slice()) {
                continue;
            }
            self.handle_frame(address, channel, bytes, FrameSource::Poll, session);
        }
        Ok(())
    }

    fn handle_frame(
        &self,
        address: &str,
        channel: Channel,
        bytes: Vec<u8>,
        source: FrameSource,
        session: &mut SessionState,
    ) {
        let received_at = current_timestamp();
        let (event, candidates) = match channel {
            Channel::Main => (
                decode_main(&bytes).map(|telemetry| TelemetryEvent::TelemetryMain {
                    telemetry,
                    received_at,
                }),
                extract_line_candidates(&bytes),
            ),
            Channel::Compact => (
                decode_compact(&bytes).map(|telemetry| TelemetryEvent::TelemetryCompact {
                    telemetry,
                    received_at,
                }),
                Vec::new(),
            ),
        };
        let len = bytes.len();
        *session.last_seen(channel) = Some(bytes);

        match event {
            Some(event) => {
                self.events.emit(event);
                self.mark_data_received(address, source, session);
            }
            None => log::debug!("Ignoring undecodable {:?} frame ({} bytes)", channel, len),
        }

        if !candidates.is_empty() {
            self.events.emit(TelemetryEvent::StartLineCandidates {
                candidates,
                source,
                received_at,
            });
        }
    }

    fn mark_data_received(&self, address: &str, source: FrameSource, session: &mut SessionState) {
        session.frames += 1;
        if session.first_data {
            return;
        }
        session.first_data = true;
        log::info!("Telemetry flowing from {} via {:?}", address, source);
        if session.no_data_warned {
            self.emit_status(ConnectionStatus::connected(address));
        }
    }

    async fn fail_session(&self, address: &str, err: LinkError) -> SessionEnd {
        log::error!("Session with {} failed: {}", address, err);
        self.emit_status(ConnectionStatus::disconnected(Some(address), Some(err.to_string())));
        self.disconnect_quietly().await;
        SessionEnd::Failed
    }

    async fn shutdown(&self) {
        log::info!("Atlas link stopping");
        self.disconnect_quietly().await;
        self.set_phase(LinkPhase::Idle);
        self.emit_status(ConnectionStatus::disconnected(None, None));
    }

    async fn disconnect_quietly(&self) {
        if !self.transport.is_connected() {
            return;
        }
        match time::timeout(self.config.read_timeout, self.transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("Disconnect failed: {}", err),
            Err(_) => log::warn!("Disconnect timed out"),
        }
    }

    /// Sleep unless stopped first. Returns true if stopped.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => true,
            _ = time::sleep(duration) => false,
        }
    }

    fn emit_status(&self, status: ConnectionStatus) {
        self.events
            .emit(TelemetryEvent::status(status, current_timestamp()));
    }

    fn set_phase(&self, phase: LinkPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            log::debug!("Link phase {} -> {}", previous.as_str(), phase.as_str());
        }
    }
}
