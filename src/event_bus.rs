//! Bounded event channel between the link layer and the fusion consumer.
//!
//! When the consumer falls behind, the oldest queued events are overwritten
//! so the newest telemetry is always admitted.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::types::TelemetryEvent;

pub const DEFAULT_CAPACITY: usize = 2000;

#[derive(Clone, Debug)]
pub struct EventSender {
    tx: broadcast::Sender<TelemetryEvent>,
}

pub struct EventReceiver {
    rx: broadcast::Receiver<TelemetryEvent>,
    dropped: u64,
}

pub fn event_bus(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx, dropped: 0 })
}

impl EventSender {
    /// Never blocks. Without a live receiver the event is discarded.
    pub fn emit(&self, event: TelemetryEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }
}

impl EventReceiver {
    /// Next event, or `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<TelemetryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<TelemetryEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events overwritten before this receiver could read them.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn record_lag(&mut self, n: u64) {
        self.dropped += n;
        log::warn!(
            "Event queue full: dropped {} oldest event(s) ({} total)",
            n,
            self.dropped
        );
    }
}
