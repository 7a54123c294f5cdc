//! Broker reactor
//!
//! One task owns all routing state and multiplexes three event sources:
//! messages from client connections (frontend), messages from worker
//! connections (backend), and the heartbeat timer. Every accepted connection
//! gets a reader task feeding the reactor and a writer task draining an
//! unbounded queue, so the reactor never waits on a socket.
//!
//! Client connections are identified to workers by an 8-byte identity frame
//! (the connection id, big-endian). Requests travel as
//! `[identity][empty][ACTION][action][key]([payload])` and replies come back
//! with the same envelope.

use crate::metrics::BrokerMetrics;
use crate::registry::WorkerRegistry;
use bytes::Bytes;
use sliceio_common::{BrokerConfig, Error, Result, WorkerIdentity};
use sliceio_proto::{Message, actor, heartbeat, read_message, status, write_message};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Identifier of an accepted connection, unique across both listeners
pub type ConnId = u64;

/// Position of the key frame in an enveloped request
const KEY_FRAME: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Frontend,
    Backend,
}

enum Event {
    Connected {
        side: Side,
        conn_id: ConnId,
        sender: mpsc::UnboundedSender<Message>,
    },
    Message {
        side: Side,
        conn_id: ConnId,
        msg: Message,
    },
    Closed {
        side: Side,
        conn_id: ConnId,
    },
}

fn client_identity(conn_id: ConnId) -> Bytes {
    Bytes::copy_from_slice(&conn_id.to_be_bytes())
}

fn parse_client_identity(frame: &[u8]) -> Option<ConnId> {
    let raw: [u8; 8] = frame.try_into().ok()?;
    Some(ConnId::from_be_bytes(raw))
}

/// Identity announced in `[STATUS][WORKER_READY][datanode][bucket][channel]`
fn parse_ready(msg: &Message) -> Option<WorkerIdentity> {
    let field = |index: usize| -> Option<u32> {
        let raw: [u8; 4] = msg.get(index)?.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    };
    Some(WorkerIdentity::for_channel(field(2)?, field(3)?, field(4)?))
}

/// Request broker bound to its frontend and backend listeners
pub struct Broker {
    config: BrokerConfig,
    frontend: TcpListener,
    backend: TcpListener,
    registry: Arc<WorkerRegistry>,
    metrics: Arc<BrokerMetrics>,
}

impl Broker {
    /// Bind the frontend and backend listeners
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let frontend = TcpListener::bind(&config.frontend).await.map_err(|e| {
            Error::ConnectionFailed(format!("cannot bind frontend {}: {e}", config.frontend))
        })?;
        let backend = TcpListener::bind(&config.backend).await.map_err(|e| {
            Error::ConnectionFailed(format!("cannot bind backend {}: {e}", config.backend))
        })?;
        let registry = Arc::new(WorkerRegistry::new(config.heartbeat.expiry()));

        Ok(Self {
            config,
            frontend,
            backend,
            registry,
            metrics: Arc::new(BrokerMetrics::default()),
        })
    }

    pub fn frontend_addr(&self) -> Result<SocketAddr> {
        Ok(self.frontend.local_addr()?)
    }

    pub fn backend_addr(&self) -> Result<SocketAddr> {
        Ok(self.backend.local_addr()?)
    }

    #[must_use]
    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Self {
            config,
            frontend,
            backend,
            registry,
            metrics,
        } = self;

        info!(
            frontend = %frontend.local_addr()?,
            backend = %backend.local_addr()?,
            stub = config.stub,
            "Broker running"
        );

        let (events_tx, mut events_rx) = mpsc::channel(1024);
        let next_conn_id = Arc::new(AtomicU64::new(1));
        let frontend_task = tokio::spawn(accept_loop(
            Side::Frontend,
            frontend,
            events_tx.clone(),
            Arc::clone(&next_conn_id),
        ));
        let backend_task = tokio::spawn(accept_loop(
            Side::Backend,
            backend,
            events_tx,
            next_conn_id,
        ));

        let mut reactor = Reactor {
            stub: config.stub,
            registry,
            metrics,
            clients: HashMap::new(),
            workers: HashMap::new(),
        };

        let mut ticker = tokio::time::interval(config.heartbeat.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(event) = events_rx.recv() => reactor.handle(event),
                _ = ticker.tick() => reactor.on_heartbeat_tick(),
            }
        }

        frontend_task.abort();
        backend_task.abort();
        info!("Broker stopped");
        Ok(())
    }
}

async fn accept_loop(
    side: Side,
    listener: TcpListener,
    events: mpsc::Sender<Event>,
    next_conn_id: Arc<AtomicU64>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(?side, error = %e, "Accept failed");
                continue;
            }
        };
        let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
        debug!(?side, conn_id, %peer, "Connection accepted");
        if spawn_connection(side, conn_id, stream, events.clone())
            .await
            .is_err()
        {
            // Reactor gone
            return;
        }
    }
}

/// Register a connection with the reactor, then start its reader and writer
async fn spawn_connection(
    side: Side,
    conn_id: ConnId,
    stream: TcpStream,
    events: mpsc::Sender<Event>,
) -> std::result::Result<(), mpsc::error::SendError<Event>> {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(?side, conn_id, error = %e, "Cannot disable Nagle on connection");
    }
    let (mut reader, mut writer) = stream.into_split();
    let (sender, mut outbox) = mpsc::unbounded_channel::<Message>();

    events
        .send(Event::Connected {
            side,
            conn_id,
            sender,
        })
        .await?;

    tokio::spawn(async move {
        while let Some(msg) = outbox.recv().await {
            if let Err(e) = write_message(&mut writer, &msg).await {
                debug!(?side, conn_id, error = %e, "Write failed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(Some(msg)) => {
                    if events
                        .send(Event::Message {
                            side,
                            conn_id,
                            msg,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_protocol() => {
                    warn!(?side, conn_id, error = %e, "Peer broke framing, closing connection");
                    break;
                }
                Err(e) => {
                    debug!(?side, conn_id, error = %e, "Read failed");
                    break;
                }
            }
        }
        let _ = events.send(Event::Closed { side, conn_id }).await;
    });

    Ok(())
}

struct WorkerConn {
    sender: mpsc::UnboundedSender<Message>,
    identity: Option<WorkerIdentity>,
}

struct Reactor {
    stub: bool,
    registry: Arc<WorkerRegistry>,
    metrics: Arc<BrokerMetrics>,
    clients: HashMap<ConnId, mpsc::UnboundedSender<Message>>,
    workers: HashMap<ConnId, WorkerConn>,
}

impl Reactor {
    fn handle(&mut self, event: Event) {
        match event {
            Event::Connected {
                side: Side::Frontend,
                conn_id,
                sender,
            } => {
                BrokerMetrics::incr(&self.metrics.client_connections);
                self.clients.insert(conn_id, sender);
            }
            Event::Connected {
                side: Side::Backend,
                conn_id,
                sender,
            } => {
                BrokerMetrics::incr(&self.metrics.worker_connections);
                self.workers.insert(
                    conn_id,
                    WorkerConn {
                        sender,
                        identity: None,
                    },
                );
            }
            Event::Message {
                side: Side::Frontend,
                conn_id,
                msg,
            } => self.on_frontend(conn_id, msg),
            Event::Message {
                side: Side::Backend,
                conn_id,
                msg,
            } => self.on_backend(conn_id, msg),
            Event::Closed {
                side: Side::Frontend,
                conn_id,
            } => {
                self.clients.remove(&conn_id);
            }
            Event::Closed {
                side: Side::Backend,
                conn_id,
            } => {
                self.workers.remove(&conn_id);
                for identity in self.registry.remove_connection(conn_id) {
                    info!(worker = %identity, conn_id, "Worker disconnected");
                }
            }
        }
    }

    fn on_frontend(&mut self, conn_id: ConnId, mut request: Message) {
        request.wrap(client_identity(conn_id));
        let mut reply = request.sendback();

        if self.stub {
            reply.add_status(status::WORKER_ACK);
            self.relay_to_client(reply);
            return;
        }

        let Some(key) = request.get(KEY_FRAME).cloned() else {
            debug!(client = conn_id, "Request without key frame");
            BrokerMetrics::incr(&self.metrics.requests_rejected);
            reply.add_status(status::WORKER_ERROR);
            self.relay_to_client(reply);
            return;
        };
        if let Some((identity, worker_conn)) = self.registry.choose_worker(&key) {
            let sent = self
                .workers
                .get(&worker_conn)
                .is_some_and(|worker| worker.sender.send(request).is_ok());
            if sent {
                trace!(client = conn_id, worker = %identity, "Request routed");
                BrokerMetrics::incr(&self.metrics.requests_routed);
                return;
            }
            warn!(worker = %identity, "Chosen worker connection is gone");
        } else {
            debug!(client = conn_id, "No worker available");
        }

        BrokerMetrics::incr(&self.metrics.requests_rejected);
        reply.add_status(status::WORKER_ERROR);
        self.relay_to_client(reply);
    }

    fn on_backend(&mut self, conn_id: ConnId, msg: Message) {
        let Some(worker) = self.workers.get_mut(&conn_id) else {
            return;
        };

        if msg.is_status(status::WORKER_READY) {
            let identity =
                parse_ready(&msg).unwrap_or_else(|| WorkerIdentity::for_connection(conn_id));
            info!(worker = %identity, conn_id, "Worker ready");
            worker.identity = Some(identity.clone());
            self.registry.set_worker_ready(&identity, conn_id);
            return;
        }

        let identity = worker
            .identity
            .clone()
            .unwrap_or_else(|| WorkerIdentity::for_connection(conn_id));

        if msg.is_status(actor::OVER) {
            if self.registry.remove(&identity, conn_id) {
                info!(worker = %identity, "Worker signed off");
            }
            return;
        }

        self.registry.set_worker_ready(&identity, conn_id);
        if msg.is_heartbeat(heartbeat::WORKER) {
            trace!(worker = %identity, "Worker heartbeat");
            return;
        }
        self.relay_to_client(msg);
    }

    /// Deliver an enveloped reply to the client named in its identity frame
    fn relay_to_client(&mut self, mut reply: Message) {
        let Some(client) = reply
            .unwrap_identity()
            .as_deref()
            .and_then(parse_client_identity)
        else {
            debug!(reply = ?reply, "Dropping reply without client identity");
            return;
        };

        match self.clients.get(&client) {
            Some(sender) if sender.send(reply).is_ok() => {
                BrokerMetrics::incr(&self.metrics.responses_relayed);
            }
            _ => debug!(client, "Client gone, dropping reply"),
        }
    }

    fn on_heartbeat_tick(&mut self) {
        let beat = Message::heartbeat(heartbeat::BROKER);
        for (identity, conn_id) in self.registry.workers() {
            if let Some(worker) = self.workers.get(&conn_id)
                && worker.sender.send(beat.clone()).is_ok()
            {
                trace!(worker = %identity, "Heartbeat sent");
                BrokerMetrics::incr(&self.metrics.heartbeats_sent);
            }
        }

        let purged = self.registry.purge();
        if !purged.is_empty() {
            self.metrics
                .workers_purged
                .fetch_add(purged.len() as u64, Ordering::Relaxed);
        }
    }
}
