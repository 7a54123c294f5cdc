//! Channel: one connection from a bucket to the broker backend
//!
//! A channel announces itself with `WORKER_READY`, then loops waiting for
//! broker traffic with a timeout of one heartbeat interval:
//!
//! - it sends a worker heartbeat whenever its heartbeat deadline has passed
//! - a broker heartbeat restores full liveness
//! - any other message is a request for the bucket; the reply is sent back
//! - a timeout costs one unit of liveness; at zero the channel sleeps the
//!   current backoff, doubles it up to the cap, and reconnects
//!
//! On stop the channel sends `ACTOR_OVER` to the broker and exits.

use crate::actor::{Actor, ActorContext};
use crate::bucket::BucketService;
use async_trait::async_trait;
use sliceio_common::{
    BucketId, ChannelId, DatanodeId, Error, HeartbeatConfig, Result, WorkerIdentity,
};
use sliceio_proto::{Message, actor, heartbeat, read_message, write_message};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Live connection to the broker.
///
/// Reads happen on a separate task so that waiting with a timeout never
/// drops half a message.
struct BrokerConnection {
    writer: OwnedWriteHalf,
    incoming: mpsc::Receiver<Message>,
    reader: JoinHandle<()>,
}

impl BrokerConnection {
    async fn open(endpoint: &str, ready: &Message) -> Result<Self> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{endpoint}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(endpoint, error = %e, "Cannot disable Nagle on broker connection");
        }
        let (mut read_half, mut writer) = stream.into_split();
        write_message(&mut writer, ready).await?;

        let (tx, incoming) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            loop {
                match read_message(&mut read_half).await {
                    Ok(Some(msg)) => {
                        if tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) if e.is_protocol() => {
                        warn!(error = %e, "Broker broke framing, dropping connection");
                        return;
                    }
                    Err(e) => {
                        debug!(error = %e, "Broker connection read failed");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            writer,
            incoming,
            reader,
        })
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        write_message(&mut self.writer, msg).await
    }

    /// Next message; `None` once the broker side is closed
    async fn recv(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Why a session with the broker ended
enum SessionEnd {
    Stopped,
    Reconnect,
}

/// One broker-facing connection actor of a bucket
pub struct Channel {
    identity: WorkerIdentity,
    ready: Message,
    broker_endpoint: String,
    heartbeat: HeartbeatConfig,
    service: Arc<BucketService>,
}

impl Channel {
    #[must_use]
    pub fn new(
        datanode_id: DatanodeId,
        bucket_id: BucketId,
        channel_id: ChannelId,
        broker_endpoint: String,
        heartbeat: HeartbeatConfig,
        service: Arc<BucketService>,
    ) -> Self {
        Self {
            identity: WorkerIdentity::for_channel(datanode_id, bucket_id, channel_id),
            ready: Message::worker_ready(datanode_id, bucket_id, channel_id),
            broker_endpoint,
            heartbeat,
            service,
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Sleep before reconnecting; false when stopped meanwhile
    async fn back_off(&self, ctx: &ActorContext, backoff: &mut Duration) -> bool {
        let delay = *backoff;
        *backoff = (*backoff * 2).min(self.heartbeat.reconnect_max());
        debug!(channel = %self.identity, delay_ms = delay.as_millis(), "Backing off");
        tokio::select! {
            () = ctx.stopped() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Serve one connection until it is lost or the channel is stopped
    async fn session(
        &self,
        ctx: &ActorContext,
        conn: &mut BrokerConnection,
        mut liveness: u32,
        backoff: &mut Duration,
    ) -> SessionEnd {
        let interval = self.heartbeat.interval();
        let mut heartbeat_at = Instant::now() + interval;

        loop {
            if Instant::now() >= heartbeat_at {
                heartbeat_at = Instant::now() + interval;
                if let Err(e) = conn.send(&Message::heartbeat(heartbeat::WORKER)).await {
                    warn!(channel = %self.identity, error = %e, "Heartbeat send failed");
                    return SessionEnd::Reconnect;
                }
                trace!(channel = %self.identity, "Heartbeat sent");
            }

            let received = tokio::select! {
                () = ctx.stopped() => {
                    if let Err(e) = conn.send(&Message::status(actor::OVER)).await {
                        debug!(channel = %self.identity, error = %e, "Could not sign off");
                    }
                    return SessionEnd::Stopped;
                }
                received = tokio::time::timeout(interval, conn.recv()) => received,
            };

            match received {
                Ok(Some(msg)) if msg.is_heartbeat(heartbeat::BROKER) => {
                    trace!(channel = %self.identity, "Broker heartbeat");
                    liveness = self.heartbeat.liveness;
                    *backoff = self.heartbeat.reconnect_initial();
                }
                Ok(Some(request)) => {
                    let service = Arc::clone(&self.service);
                    let reply = match tokio::task::spawn_blocking(move || service.handle(request))
                        .await
                    {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(channel = %self.identity, error = %e, "Request handler panicked");
                            continue;
                        }
                    };
                    if let Err(e) = conn.send(&reply).await {
                        warn!(channel = %self.identity, error = %e, "Reply send failed");
                        return SessionEnd::Reconnect;
                    }
                }
                Ok(None) => {
                    warn!(channel = %self.identity, "Broker closed the connection");
                    return SessionEnd::Reconnect;
                }
                Err(_) => {
                    liveness = liveness.saturating_sub(1);
                    if liveness == 0 {
                        warn!(channel = %self.identity, "Broker heartbeat lost, reconnecting");
                        return SessionEnd::Reconnect;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Actor for Channel {
    fn name(&self) -> String {
        format!("channel-{}", self.identity)
    }

    async fn run(self, ctx: ActorContext) -> Result<()> {
        ctx.ready();

        let mut backoff = self.heartbeat.reconnect_initial();
        // The first session gets extra slack while the broker learns about us
        let mut liveness = self.heartbeat.liveness.saturating_mul(2);

        loop {
            let opened = tokio::select! {
                () = ctx.stopped() => break,
                opened = BrokerConnection::open(&self.broker_endpoint, &self.ready) => opened,
            };
            let mut conn = match opened {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(channel = %self.identity, error = %e, "Cannot reach broker");
                    if self.back_off(&ctx, &mut backoff).await {
                        continue;
                    }
                    break;
                }
            };
            info!(channel = %self.identity, endpoint = %self.broker_endpoint, "Connected to broker");

            match self.session(&ctx, &mut conn, liveness, &mut backoff).await {
                SessionEnd::Stopped => break,
                SessionEnd::Reconnect => {
                    drop(conn);
                    liveness = self.heartbeat.liveness;
                    if !self.back_off(&ctx, &mut backoff).await {
                        break;
                    }
                }
            }
        }

        info!(channel = %self.identity, "Channel stopped");
        Ok(())
    }
}
