//! Fabric over the tonic `Transport` service.
//!
//! Every peer gets one sender task that delivers its queue with sequential
//! unary `Deliver` calls, which keeps per-link order. The server side waits
//! on the read gate before handing an envelope to the inbound handler, so a
//! paused peer sees its calls stall and its link congest.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backoff::ExponentialBackoff;
use dashmap::DashMap;
use prost::Message;
use tessel_api::transport::transport_client::TransportClient;
use tessel_api::transport::transport_server::{Transport, TransportServer};
use tessel_api::{DeliveryAck, TransportEnvelope};
use tessel_common::{Error, Result, WorkerId};
use tokio::sync::{mpsc, oneshot, Notify};
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use super::{
    Fabric, FabricBuilder, FlowControl, InboundHandler, LinkMeter, LinkState, MembershipWatchers,
    ReadGate, SendError,
};

/// Builds a [`GrpcFabric`] listening on `listen` and connected to `peers`.
#[derive(Debug, Clone)]
pub struct GrpcFabricBuilder {
    pub listen: SocketAddr,
    pub peers: Vec<(WorkerId, String)>,
    pub flow: FlowControl,
    pub connect_timeout: Duration,
}

pub struct GrpcFabric {
    local_id: WorkerId,
    flow: FlowControl,
    connect_timeout: Duration,
    handler: Arc<dyn InboundHandler>,
    gate: Arc<ReadGate>,
    peers: DashMap<WorkerId, Peer>,
    membership: MembershipWatchers,
    alive: AtomicBool,
    server_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

struct Peer {
    tx: mpsc::UnboundedSender<(TransportEnvelope, usize)>,
    meter: Arc<LinkMeter>,
    reachable: Arc<AtomicBool>,
}

struct InboundService {
    handler: Arc<dyn InboundHandler>,
    gate: Arc<ReadGate>,
}

#[tonic::async_trait]
impl Transport for InboundService {
    async fn deliver(
        &self,
        request: Request<TransportEnvelope>,
    ) -> std::result::Result<Response<DeliveryAck>, Status> {
        let envelope = request.into_inner();
        let from = envelope.sender;
        self.gate.wait_open(from).await;
        self.handler.deliver(from, envelope);
        Ok(Response::new(DeliveryAck {}))
    }
}

#[async_trait::async_trait]
impl FabricBuilder for GrpcFabricBuilder {
    async fn build(
        &self,
        local_id: WorkerId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<dyn Fabric>> {
        let fabric = GrpcFabric::start(self, local_id, handler).await?;
        Ok(fabric)
    }
}

impl GrpcFabric {
    pub async fn start(
        builder: &GrpcFabricBuilder,
        local_id: WorkerId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<GrpcFabric>> {
        let gate = Arc::new(ReadGate::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let service = InboundService {
            handler: handler.clone(),
            gate: gate.clone(),
        };

        let listener = tokio::net::TcpListener::bind(builder.listen).await?;
        let incoming = tonic::transport::server::TcpIncoming::from_listener(listener, true, None)
            .map_err(|e| Error::transport(format!("cannot listen on {}: {e}", builder.listen)))?;
        info!(worker_id = local_id, listen = %builder.listen, "transport server listening");
        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(TransportServer::new(service))
                .serve_with_incoming_shutdown(incoming, async {
                    shutdown_rx.await.ok();
                })
                .await;
            if let Err(e) = result {
                error!(worker_id = local_id, "transport server failed: {e}");
            }
        });

        let fabric = Arc::new(GrpcFabric {
            local_id,
            flow: builder.flow,
            connect_timeout: builder.connect_timeout,
            handler,
            gate,
            peers: DashMap::new(),
            membership: MembershipWatchers::default(),
            alive: AtomicBool::new(true),
            server_shutdown: Mutex::new(Some(shutdown_tx)),
        });
        fabric.add_remote(local_id, &builder.listen.to_string())?;
        for (id, address) in &builder.peers {
            if *id != local_id {
                fabric.add_remote(*id, address)?;
            }
        }
        Ok(fabric)
    }

    fn spawn_peer(&self, id: WorkerId, address: String) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        let meter = Arc::new(LinkMeter::new(self.flow));
        let reachable = Arc::new(AtomicBool::new(true));
        let route = if id == self.local_id {
            Route::Loopback {
                handler: self.handler.clone(),
                gate: self.gate.clone(),
            }
        } else {
            Route::Remote {
                address,
                connect_timeout: self.connect_timeout,
                client: None,
            }
        };
        tokio::spawn(run_peer(self.local_id, id, route, rx, meter.clone(), reachable.clone()));
        Peer {
            tx,
            meter,
            reachable,
        }
    }
}

enum Route {
    Loopback {
        handler: Arc<dyn InboundHandler>,
        gate: Arc<ReadGate>,
    },
    Remote {
        address: String,
        connect_timeout: Duration,
        client: Option<TransportClient<Channel>>,
    },
}

async fn connect(address: &str, connect_timeout: Duration) -> Result<TransportClient<Channel>> {
    let uri = if address.starts_with("http") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let endpoint = Endpoint::from_shared(uri)
        .map_err(|e| Error::transport(format!("bad peer address {address}: {e}")))?
        .connect_timeout(connect_timeout);
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(connect_timeout * 3),
        ..Default::default()
    };
    let channel = backoff::future::retry(policy, || async {
        endpoint.connect().await.map_err(|e| {
            debug!(%address, "connect attempt failed: {e}");
            backoff::Error::transient(e)
        })
    })
    .await
    .map_err(|e| Error::transport(format!("cannot connect to {address}: {e}")))?;
    Ok(TransportClient::new(channel))
}

async fn run_peer(
    local_id: WorkerId,
    peer: WorkerId,
    mut route: Route,
    mut rx: mpsc::UnboundedReceiver<(TransportEnvelope, usize)>,
    meter: Arc<LinkMeter>,
    reachable: Arc<AtomicBool>,
) {
    while let Some((envelope, bytes)) = rx.recv().await {
        match &mut route {
            Route::Loopback { handler, gate } => {
                gate.wait_open(local_id).await;
                handler.deliver(local_id, envelope);
            }
            Route::Remote {
                address,
                connect_timeout,
                client,
            } => {
                if client.is_none() {
                    match connect(address, *connect_timeout).await {
                        Ok(c) => *client = Some(c),
                        Err(e) => {
                            warn!(worker_id = local_id, peer, "{e}");
                            reachable.store(false, Ordering::Release);
                        }
                    }
                }
                if let Some(c) = client.as_mut() {
                    match c.deliver(envelope).await {
                        Ok(_) => reachable.store(true, Ordering::Release),
                        Err(status) => {
                            warn!(worker_id = local_id, peer, "delivery failed: {status}");
                            reachable.store(false, Ordering::Release);
                            *client = None;
                        }
                    }
                }
            }
        }
        meter.drained(bytes);
    }
    debug!(worker_id = local_id, peer, "peer sender stopped");
}

impl Fabric for GrpcFabric {
    fn local_id(&self) -> WorkerId {
        self.local_id
    }

    fn send(&self, to: WorkerId, envelope: TransportEnvelope) -> std::result::Result<(), SendError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(SendError {
                envelope,
                reason: "fabric is shut down".to_string(),
            });
        }
        let Some(peer) = self.peers.get(&to) else {
            return Err(SendError {
                envelope,
                reason: format!("unknown peer {to}"),
            });
        };
        let bytes = envelope.encoded_len();
        peer.meter.enqueued(bytes);
        peer.tx.send((envelope, bytes)).map_err(|e| {
            peer.meter.drained(bytes);
            SendError {
                envelope: (e.0).0,
                reason: format!("sender for peer {to} stopped"),
            }
        })
    }

    fn link_state(&self, to: WorkerId) -> LinkState {
        if !self.alive.load(Ordering::Acquire) {
            return LinkState::Closed;
        }
        match self.peers.get(&to) {
            None => LinkState::Closed,
            Some(p) if !p.reachable.load(Ordering::Acquire) => LinkState::Closed,
            Some(p) if p.meter.is_congested() => LinkState::Congested,
            Some(_) => LinkState::Writable,
        }
    }

    fn watch_writable(&self, to: WorkerId, waker: Arc<Notify>) {
        match self.link_state(to) {
            LinkState::Writable => waker.notify_one(),
            LinkState::Congested => {
                let meter = self.peers.get(&to).map(|p| p.meter.clone());
                match meter {
                    Some(meter) => meter.watch(waker),
                    None => waker.notify_one(),
                }
            }
            LinkState::Closed => self.membership.push(waker),
        }
    }

    fn add_remote(&self, id: WorkerId, address: &str) -> Result<()> {
        let peer = self.spawn_peer(id, address.to_string());
        self.peers.insert(id, peer);
        self.gate.reset(id);
        debug!(worker_id = self.local_id, peer = id, %address, "peer added");
        self.membership.wake_all();
        Ok(())
    }

    fn remove_remote(&self, id: WorkerId) {
        if id == self.local_id {
            return;
        }
        if self.peers.remove(&id).is_some() {
            self.gate.reset(id);
            debug!(worker_id = self.local_id, peer = id, "peer removed");
        }
        self.membership.wake_all();
    }

    fn is_remote_alive(&self, id: WorkerId) -> bool {
        self.link_state(id) != LinkState::Closed
    }

    fn pause_reading(&self, from: WorkerId) {
        self.gate.pause(from);
    }

    fn resume_reading(&self, from: WorkerId) {
        self.gate.resume(from);
    }

    fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.peers.clear();
        let tx = self
            .server_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        self.membership.wake_all();
        info!(worker_id = self.local_id, "transport shut down");
    }
}
