//! Bucket: one storage shard
//!
//! [`BucketService`] decodes PUT/GET/DEL requests and runs them against the
//! shard's [`BucketDb`]; [`Bucket`] is the actor that serves it over a pool
//! of broker channels.

use crate::actor::{Actor, ActorContext, ActorPool};
use crate::channel::Channel;
use async_trait::async_trait;
use bytes::Bytes;
use sliceio_common::{BucketId, DatanodeId, HeartbeatConfig, Result, Slice, SliceKey};
use sliceio_proto::{Message, MsgType, Tag, action, status};
use sliceio_storage::BucketDb;
use std::sync::Arc;
use tracing::{error, info, trace};

/// Request handling for one bucket; shared by all of its channels
pub struct BucketService {
    bucket_id: BucketId,
    db: BucketDb,
}

impl BucketService {
    #[must_use]
    pub fn new(db: BucketDb) -> Self {
        Self {
            bucket_id: db.id(),
            db,
        }
    }

    #[must_use]
    pub const fn bucket_id(&self) -> BucketId {
        self.bucket_id
    }

    #[must_use]
    pub const fn db(&self) -> &BucketDb {
        &self.db
    }

    /// Handle one enveloped request and build its enveloped reply.
    ///
    /// Every request gets exactly one reply; malformed requests and storage
    /// failures are answered with `WORKER_ERROR`.
    #[must_use]
    pub fn handle(&self, request: Message) -> Message {
        let mut reply = request.sendback();
        let mut body = request;
        body.unwrap_identity();

        match self.dispatch(&body) {
            Ok(Outcome::Status(tag)) => reply.add_status(tag),
            Ok(Outcome::Data { key, payload }) => {
                reply.push_back(MsgType::Data.to_frame());
                reply.push_back(key);
                reply.push_back(payload);
            }
            Err(e) => {
                error!(bucket_id = self.bucket_id, error = %e, "Request failed");
                reply.add_status(status::WORKER_ERROR);
            }
        }
        reply
    }

    fn dispatch(&self, body: &Message) -> Result<Outcome> {
        if body.msgtype() != MsgType::Action {
            trace!(bucket_id = self.bucket_id, request = ?body, "Not an action");
            return Ok(Outcome::Status(status::WORKER_ERROR));
        }
        let (Some(tag), Some(key)) = (body.get(1), body.get(2)) else {
            trace!(bucket_id = self.bucket_id, request = ?body, "Missing action or key frame");
            return Ok(Outcome::Status(status::WORKER_ERROR));
        };
        let slice_key = SliceKey::for_key(key, 0);

        if action::PUT.matches(tag) {
            let Some(payload) = body.get(3) else {
                trace!(bucket_id = self.bucket_id, slice = %slice_key, "PUT without payload");
                return Ok(Outcome::Status(status::WORKER_ERROR));
            };
            trace!(bucket_id = self.bucket_id, slice = %slice_key, size = payload.len(), "PUT");
            self.db.write(&Slice::new(slice_key, payload.clone()))?;
            Ok(Outcome::Status(status::WORKER_ACK))
        } else if action::GET.matches(tag) {
            trace!(bucket_id = self.bucket_id, slice = %slice_key, "GET");
            Ok(match self.db.read(&slice_key)? {
                Some(payload) => Outcome::Data {
                    key: key.clone(),
                    payload,
                },
                None => Outcome::Status(status::WORKER_NOTFOUND),
            })
        } else if action::DEL.matches(tag) {
            trace!(bucket_id = self.bucket_id, slice = %slice_key, "DEL");
            Ok(if self.db.delete(&slice_key)? {
                Outcome::Status(status::WORKER_ACK)
            } else {
                Outcome::Status(status::WORKER_NOTFOUND)
            })
        } else {
            trace!(bucket_id = self.bucket_id, action = ?tag, "Unknown action");
            Ok(Outcome::Status(status::WORKER_ERROR))
        }
    }
}

enum Outcome {
    Status(Tag),
    Data { key: Bytes, payload: Bytes },
}

/// Actor running one bucket's channel pool
pub struct Bucket {
    datanode_id: DatanodeId,
    total_channels: u32,
    broker_endpoint: String,
    heartbeat: HeartbeatConfig,
    service: Arc<BucketService>,
}

impl Bucket {
    #[must_use]
    pub fn new(
        datanode_id: DatanodeId,
        total_channels: u32,
        broker_endpoint: String,
        heartbeat: HeartbeatConfig,
        service: Arc<BucketService>,
    ) -> Self {
        Self {
            datanode_id,
            total_channels,
            broker_endpoint,
            heartbeat,
            service,
        }
    }
}

#[async_trait]
impl Actor for Bucket {
    fn name(&self) -> String {
        format!("bucket-{}", self.service.bucket_id())
    }

    async fn run(self, ctx: ActorContext) -> Result<()> {
        let bucket_id = self.service.bucket_id();
        let channels = (0..self.total_channels)
            .map(|channel_id| {
                Channel::new(
                    self.datanode_id,
                    bucket_id,
                    channel_id,
                    self.broker_endpoint.clone(),
                    self.heartbeat.clone(),
                    Arc::clone(&self.service),
                )
            })
            .collect();

        let mut pool = ActorPool::spawn(self.name(), channels).await?;
        ctx.ready();
        info!(bucket_id, channels = pool.len(), "Bucket ready");

        tokio::select! {
            () = ctx.stopped() => {}
            () = pool.wait() => info!(bucket_id, "All channels exited"),
        }
        pool.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sliceio_common::{StorageBackend, StorageConfig};
    use tempfile::TempDir;

    fn service(backend: StorageBackend) -> (TempDir, BucketService) {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend,
            max_dbsize: 1 << 20,
        };
        let db = BucketDb::open(dir.path(), 0, &config).unwrap();
        (dir, BucketService::new(db))
    }

    fn request(tag: Tag, key: &str, payload: Option<&[u8]>) -> Message {
        let mut msg = Message::action(tag, key.to_string(), payload.map(Bytes::copy_from_slice));
        msg.wrap(Bytes::from_static(b"client-7"));
        msg
    }

    /// Strip the envelope, checking it names the original client
    fn open(mut reply: Message) -> Message {
        assert_eq!(reply.unwrap_identity().unwrap().as_ref(), b"client-7");
        reply
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, service) = service(StorageBackend::Redb);
        let payload = [0xA5u8; 16];

        let reply = open(service.handle(request(action::PUT, "alpha", Some(&payload[..]))));
        assert!(reply.is_status(status::WORKER_ACK));

        let reply = open(service.handle(request(action::GET, "alpha", None)));
        assert_eq!(reply.msgtype(), MsgType::Data);
        assert_eq!(reply.get(1).unwrap().as_ref(), b"alpha");
        assert_eq!(reply.get(2).unwrap().as_ref(), &payload);
    }

    #[test]
    fn test_get_missing() {
        let (_dir, service) = service(StorageBackend::Memory);
        let reply = open(service.handle(request(action::GET, "missing", None)));
        assert!(reply.is_status(status::WORKER_NOTFOUND));
    }

    #[test]
    fn test_delete() {
        let (_dir, service) = service(StorageBackend::LogFile);
        let _ = service.handle(request(action::PUT, "doomed", Some(&b"bytes"[..])));

        let reply = open(service.handle(request(action::DEL, "doomed", None)));
        assert!(reply.is_status(status::WORKER_ACK));
        let reply = open(service.handle(request(action::GET, "doomed", None)));
        assert!(reply.is_status(status::WORKER_NOTFOUND));
        let reply = open(service.handle(request(action::DEL, "doomed", None)));
        assert!(reply.is_status(status::WORKER_NOTFOUND));
    }

    #[test]
    fn test_malformed_requests_get_error() {
        let (_dir, service) = service(StorageBackend::Memory);

        // PUT without payload
        let reply = open(service.handle(request(action::PUT, "k", None)));
        assert!(reply.is_status(status::WORKER_ERROR));

        // Action without key
        let mut msg = Message::from_frames([MsgType::Action.to_frame(), action::GET.to_frame()]);
        msg.wrap(Bytes::from_static(b"client-7"));
        let reply = open(service.handle(msg));
        assert!(reply.is_status(status::WORKER_ERROR));

        // Unknown action tag
        let reply = open(service.handle(request(Tag([0x02, 0x7F]), "k", None)));
        assert!(reply.is_status(status::WORKER_ERROR));

        // Missing action frames entirely
        let mut msg = Message::new();
        msg.wrap(Bytes::from_static(b"client-7"));
        let reply = open(service.handle(msg));
        assert!(reply.is_status(status::WORKER_ERROR));
    }
}
