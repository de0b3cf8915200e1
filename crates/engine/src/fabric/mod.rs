//! Connection fabric: moves envelopes between processes.
//!
//! Outbound links are metered in encoded bytes. A link becomes
//! [`LinkState::Congested`] once its unsent bytes reach the high watermark
//! and stays so until they fall back to the low watermark. Receivers may
//! pause reading from a peer, which leaves that peer's messages queued on
//! the sender side and eventually congests its link.

mod grpc;
mod local;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use tessel_api::TransportEnvelope;
use tessel_common::{Result, WorkerId};
use tokio::sync::{watch, Notify};

pub use grpc::{GrpcFabric, GrpcFabricBuilder};
pub use local::{LocalEndpoint, LocalNetwork};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Writable,
    Congested,
    Closed,
}

/// Returned by [`Fabric::send`] with the envelope that was not sent.
#[derive(Debug)]
pub struct SendError {
    pub envelope: TransportEnvelope,
    pub reason: String,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Receives every envelope addressed to the local process.
pub trait InboundHandler: Send + Sync {
    fn deliver(&self, from: WorkerId, envelope: TransportEnvelope);
}

pub trait Fabric: Send + Sync {
    fn local_id(&self) -> WorkerId;

    /// Queues `envelope` for `to`. Fails only when the link is closed.
    fn send(&self, to: WorkerId, envelope: TransportEnvelope) -> std::result::Result<(), SendError>;

    fn link_state(&self, to: WorkerId) -> LinkState;

    /// Fires `waker` once the link to `to` may have become writable.
    fn watch_writable(&self, to: WorkerId, waker: Arc<Notify>);

    fn add_remote(&self, id: WorkerId, address: &str) -> Result<()>;

    fn remove_remote(&self, id: WorkerId);

    fn is_remote_alive(&self, id: WorkerId) -> bool;

    /// Stops handing envelopes from `from` to the inbound handler. Calls nest.
    fn pause_reading(&self, from: WorkerId);

    fn resume_reading(&self, from: WorkerId);

    fn shutdown(&self);
}

/// Creates the fabric of one process once its inbound handler exists.
#[async_trait]
pub trait FabricBuilder: Send + Sync {
    async fn build(
        &self,
        local_id: WorkerId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<dyn Fabric>>;
}

/// Outbound buffer watermarks, in bytes.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FlowControl {
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
}

fn default_high_watermark() -> usize {
    5 * 1024 * 1024
}

fn default_low_watermark() -> usize {
    512 * 1024
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
        }
    }
}

/// Unsent-bytes accounting for one outbound link.
pub(crate) struct LinkMeter {
    flow: FlowControl,
    pending: AtomicUsize,
    congested: AtomicBool,
    watchers: Mutex<Vec<Arc<Notify>>>,
}

impl LinkMeter {
    pub(crate) fn new(flow: FlowControl) -> Self {
        Self {
            flow,
            pending: AtomicUsize::new(0),
            congested: AtomicBool::new(false),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn enqueued(&self, bytes: usize) {
        let now = self.pending.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if now >= self.flow.high_watermark {
            self.congested.store(true, Ordering::Release);
        }
    }

    pub(crate) fn drained(&self, bytes: usize) {
        let now = self
            .pending
            .fetch_sub(bytes, Ordering::AcqRel)
            .saturating_sub(bytes);
        if now <= self.flow.low_watermark && self.congested.swap(false, Ordering::AcqRel) {
            self.wake_all();
        }
    }

    pub(crate) fn is_congested(&self) -> bool {
        self.congested.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn watch(&self, waker: Arc<Notify>) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(waker);
        if !self.is_congested() {
            self.wake_all();
        }
    }

    pub(crate) fn wake_all(&self) {
        let watchers = std::mem::take(
            &mut *self.watchers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for w in watchers {
            w.notify_one();
        }
    }
}

/// Wakers waiting for a closed link to come back.
#[derive(Default)]
pub(crate) struct MembershipWatchers {
    waiting: Mutex<Vec<Arc<Notify>>>,
}

impl MembershipWatchers {
    pub(crate) fn push(&self, waker: Arc<Notify>) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(waker);
    }

    pub(crate) fn wake_all(&self) {
        let waiting = std::mem::take(
            &mut *self.waiting.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for w in waiting {
            w.notify_one();
        }
    }
}

/// Per-peer pause counters on the receiving side.
#[derive(Default)]
pub(crate) struct ReadGate {
    peers: Mutex<HashMap<WorkerId, watch::Sender<usize>>>,
}

impl ReadGate {
    fn counter(&self, peer: WorkerId) -> watch::Sender<usize> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(peer)
            .or_insert_with(|| watch::channel(0).0)
            .clone()
    }

    pub(crate) fn pause(&self, peer: WorkerId) {
        self.counter(peer).send_modify(|n| *n += 1);
    }

    pub(crate) fn resume(&self, peer: WorkerId) {
        self.counter(peer).send_modify(|n| *n = n.saturating_sub(1));
    }

    pub(crate) fn reset(&self, peer: WorkerId) {
        self.counter(peer).send_replace(0);
    }

    #[cfg(test)]
    pub(crate) fn is_paused(&self, peer: WorkerId) -> bool {
        *self.counter(peer).borrow() > 0
    }

    /// Resolves once reading from `peer` is not paused.
    pub(crate) async fn wait_open(&self, peer: WorkerId) {
        let mut rx = self.counter(peer).subscribe();
        // Errors only when the sender is dropped, and the gate owns it.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_uses_hysteresis() {
        let meter = LinkMeter::new(FlowControl {
            high_watermark: 100,
            low_watermark: 10,
        });
        meter.enqueued(60);
        assert!(!meter.is_congested());
        meter.enqueued(60);
        assert!(meter.is_congested());
        meter.drained(60);
        assert!(meter.is_congested(), "still above the low watermark");
        meter.drained(55);
        assert!(!meter.is_congested());
        assert_eq!(meter.pending_bytes(), 5);
    }

    #[tokio::test]
    async fn meter_wakes_watchers_when_drained() {
        let meter = LinkMeter::new(FlowControl {
            high_watermark: 10,
            low_watermark: 0,
        });
        meter.enqueued(10);
        let waker = Arc::new(Notify::new());
        meter.watch(waker.clone());
        meter.drained(10);
        tokio::time::timeout(std::time::Duration::from_secs(1), waker.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gate_pauses_nest() {
        let gate = ReadGate::default();
        gate.pause(3);
        gate.pause(3);
        gate.resume(3);
        assert!(gate.is_paused(3));
        gate.resume(3);
        assert!(!gate.is_paused(3));
        gate.wait_open(3).await;
    }
}
