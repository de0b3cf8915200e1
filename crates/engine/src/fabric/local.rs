//! In-process fabric: every attached endpoint is one simulated process.
//!
//! Each ordered pair of endpoints gets its own FIFO link drained by a
//! dedicated task, so per-link order matches send order and pausing reads
//! from one peer leaves the other links flowing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::{DashMap, DashSet};
use prost::Message;
use tessel_api::TransportEnvelope;
use tessel_common::{Result, WorkerId};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use super::{
    Fabric, FabricBuilder, FlowControl, InboundHandler, LinkMeter, LinkState, MembershipWatchers,
    ReadGate, SendError,
};

/// A set of endpoints that reach each other through in-memory queues.
pub struct LocalNetwork {
    endpoints: DashMap<WorkerId, Arc<EndpointShared>>,
    flow: FlowControl,
}

struct EndpointShared {
    id: WorkerId,
    handler: Arc<dyn InboundHandler>,
    alive: AtomicBool,
    peers: DashSet<WorkerId>,
    gate: ReadGate,
    links: DashMap<WorkerId, OutLink>,
    membership: MembershipWatchers,
}

struct OutLink {
    tx: mpsc::UnboundedSender<(TransportEnvelope, usize)>,
    meter: Arc<LinkMeter>,
}

/// The fabric handle of one endpoint of a [`LocalNetwork`].
pub struct LocalEndpoint {
    shared: Arc<EndpointShared>,
    network: Arc<LocalNetwork>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_flow_control(FlowControl::default())
    }

    pub fn with_flow_control(flow: FlowControl) -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            flow,
        })
    }

    /// Attaches endpoint `id`, replacing a previous endpoint with that id.
    pub fn attach(self: &Arc<Self>, id: WorkerId, handler: Arc<dyn InboundHandler>) -> Arc<LocalEndpoint> {
        let shared = Arc::new(EndpointShared {
            id,
            handler,
            alive: AtomicBool::new(true),
            peers: DashSet::new(),
            gate: ReadGate::default(),
            links: DashMap::new(),
            membership: MembershipWatchers::default(),
        });
        shared.peers.insert(id);
        if let Some(old) = self.endpoints.insert(id, shared.clone()) {
            old.alive.store(false, Ordering::Release);
            old.links.clear();
        }
        debug!(worker_id = id, "attached local endpoint");
        self.membership_changed();
        Arc::new(LocalEndpoint {
            shared,
            network: self.clone(),
        })
    }

    fn endpoint(&self, id: WorkerId) -> Option<Arc<EndpointShared>> {
        self.endpoints.get(&id).map(|e| e.value().clone())
    }

    fn membership_changed(&self) {
        for e in self.endpoints.iter() {
            e.membership.wake_all();
        }
    }

    fn accepts(&self, from: WorkerId, to: WorkerId) -> bool {
        match self.endpoint(to) {
            Some(dest) => dest.alive.load(Ordering::Acquire) && dest.peers.contains(&from),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl FabricBuilder for Arc<LocalNetwork> {
    async fn build(
        &self,
        local_id: WorkerId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<dyn Fabric>> {
        let endpoint: Arc<dyn Fabric> = self.attach(local_id, handler);
        Ok(endpoint)
    }
}

impl LocalEndpoint {
    fn link(&self, to: WorkerId) -> Arc<LinkMeter> {
        if let Some(link) = self.shared.links.get(&to) {
            return link.meter.clone();
        }
        let entry = self.shared.links.entry(to).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let meter = Arc::new(LinkMeter::new(self.network.flow));
            tokio::spawn(drain_link(
                Arc::downgrade(&self.network),
                self.shared.id,
                to,
                rx,
                meter.clone(),
            ));
            OutLink { tx, meter }
        });
        entry.meter.clone()
    }
}

async fn drain_link(
    network: Weak<LocalNetwork>,
    from: WorkerId,
    to: WorkerId,
    mut rx: mpsc::UnboundedReceiver<(TransportEnvelope, usize)>,
    meter: Arc<LinkMeter>,
) {
    while let Some((envelope, bytes)) = rx.recv().await {
        let dest = network.upgrade().and_then(|n| n.endpoint(to));
        if let Some(dest) = dest {
            dest.gate.wait_open(from).await;
            if dest.alive.load(Ordering::Acquire) && dest.peers.contains(&from) {
                dest.handler.deliver(from, envelope);
            } else {
                trace!(from, to, "dropping envelope for a peer that no longer accepts it");
            }
        }
        meter.drained(bytes);
    }
}

impl Fabric for LocalEndpoint {
    fn local_id(&self) -> WorkerId {
        self.shared.id
    }

    fn send(&self, to: WorkerId, envelope: TransportEnvelope) -> std::result::Result<(), SendError> {
        if self.link_state(to) == LinkState::Closed {
            return Err(SendError {
                envelope,
                reason: format!("link {} -> {to} is closed", self.shared.id),
            });
        }
        let bytes = envelope.encoded_len();
        let meter = self.link(to);
        let Some(link) = self.shared.links.get(&to) else {
            return Err(SendError {
                envelope,
                reason: format!("endpoint {} is shut down", self.shared.id),
            });
        };
        meter.enqueued(bytes);
        link.tx.send((envelope, bytes)).map_err(|e| {
            meter.drained(bytes);
            SendError {
                envelope: (e.0).0,
                reason: format!("link {} -> {to} stopped", self.shared.id),
            }
        })
    }

    fn link_state(&self, to: WorkerId) -> LinkState {
        if !self.shared.alive.load(Ordering::Acquire)
            || !self.shared.peers.contains(&to)
            || !self.network.accepts(self.shared.id, to)
        {
            return LinkState::Closed;
        }
        match self.shared.links.get(&to) {
            Some(link) if link.meter.is_congested() => LinkState::Congested,
            _ => LinkState::Writable,
        }
    }

    fn watch_writable(&self, to: WorkerId, waker: Arc<Notify>) {
        match self.link_state(to) {
            LinkState::Writable => waker.notify_one(),
            LinkState::Congested => self.link(to).watch(waker),
            LinkState::Closed => {
                self.shared.membership.push(waker.clone());
                if self.link_state(to) != LinkState::Closed {
                    waker.notify_one();
                }
            }
        }
    }

    fn add_remote(&self, id: WorkerId, _address: &str) -> Result<()> {
        self.shared.peers.insert(id);
        self.shared.gate.reset(id);
        debug!(worker_id = self.shared.id, peer = id, "peer added");
        self.network.membership_changed();
        Ok(())
    }

    fn remove_remote(&self, id: WorkerId) {
        if id == self.shared.id {
            return;
        }
        self.shared.peers.remove(&id);
        // A paused peer must not keep its queued envelopes stuck forever.
        self.shared.gate.reset(id);
        debug!(worker_id = self.shared.id, peer = id, "peer removed");
        self.network.membership_changed();
    }

    fn is_remote_alive(&self, id: WorkerId) -> bool {
        self.link_state(id) != LinkState::Closed
    }

    fn pause_reading(&self, from: WorkerId) {
        self.shared.gate.pause(from);
    }

    fn resume_reading(&self, from: WorkerId) {
        self.shared.gate.resume(from);
    }

    fn shutdown(&self) {
        if self.shared.alive.swap(false, Ordering::AcqRel) {
            self.shared.links.clear();
            debug!(worker_id = self.shared.id, "local endpoint shut down");
            self.network.membership_changed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tessel_api::ControlMessage;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(WorkerId, i32)>>,
        notify: Notify,
    }

    impl InboundHandler for Recorder {
        fn deliver(&self, from: WorkerId, envelope: TransportEnvelope) {
            if let Some(tessel_api::proto::transport_envelope::Payload::Control(c)) = envelope.payload {
                self.seen.lock().unwrap().push((from, c.worker_id));
            }
            self.notify.notify_one();
        }
    }

    async fn wait_for(rec: &Recorder, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while rec.seen.lock().unwrap().len() < n {
                rec.notify.notified().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn delivers_in_send_order() {
        let net = LocalNetwork::new();
        let a = net.attach(1, Arc::new(Recorder::default()));
        let rec = Arc::new(Recorder::default());
        let b = net.attach(2, rec.clone());
        a.add_remote(2, "").unwrap();
        b.add_remote(1, "").unwrap();

        for i in 0..10 {
            a.send(2, TransportEnvelope::control(1, ControlMessage::heartbeat(i)))
                .unwrap();
        }
        wait_for(&rec, 10).await;
        let order: Vec<i32> = rec.seen.lock().unwrap().iter().map(|(_, w)| *w).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn removed_peer_link_is_closed_both_ways() {
        let net = LocalNetwork::new();
        let a = net.attach(1, Arc::new(Recorder::default()));
        let b = net.attach(2, Arc::new(Recorder::default()));
        a.add_remote(2, "").unwrap();
        b.add_remote(1, "").unwrap();
        assert_eq!(a.link_state(2), LinkState::Writable);

        b.remove_remote(1);
        assert_eq!(a.link_state(2), LinkState::Closed);
        assert_eq!(b.link_state(1), LinkState::Closed);
        assert!(a.send(2, TransportEnvelope::control(1, ControlMessage::heartbeat(1))).is_err());

        let waker = Arc::new(Notify::new());
        a.watch_writable(2, waker.clone());
        b.add_remote(1, "").unwrap();
        tokio::time::timeout(Duration::from_secs(1), waker.notified())
            .await
            .unwrap();
        assert_eq!(a.link_state(2), LinkState::Writable);
    }

    #[tokio::test]
    async fn paused_reader_congests_the_sender() {
        let net = LocalNetwork::with_flow_control(FlowControl {
            high_watermark: 64,
            low_watermark: 0,
        });
        let a = net.attach(1, Arc::new(Recorder::default()));
        let rec = Arc::new(Recorder::default());
        let b = net.attach(2, rec.clone());
        a.add_remote(2, "").unwrap();
        b.add_remote(1, "").unwrap();

        b.pause_reading(1);
        while a.link_state(2) == LinkState::Writable {
            a.send(2, TransportEnvelope::control(1, ControlMessage::heartbeat(7)))
                .unwrap();
        }
        assert_eq!(a.link_state(2), LinkState::Congested);
        assert!(rec.seen.lock().unwrap().is_empty());

        let sent = {
            let meter = a.link(2);
            meter.pending_bytes()
        };
        assert!(sent >= 64);

        let waker = Arc::new(Notify::new());
        a.watch_writable(2, waker.clone());
        b.resume_reading(1);
        tokio::time::timeout(Duration::from_secs(1), waker.notified())
            .await
            .unwrap();
        assert_eq!(a.link_state(2), LinkState::Writable);
    }
}
