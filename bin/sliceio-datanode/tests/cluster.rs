//! Broker, datanode and client running together over loopback TCP

use bytes::Bytes;
use sliceio_broker::{Broker, WorkerRegistry};
use sliceio_client::{Client, Reply};
use sliceio_common::{BrokerConfig, DatanodeConfig, HeartbeatConfig, StorageBackend, StorageConfig};
use sliceio_datanode::Datanode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        interval_ms: 50,
        liveness: 3,
        reconnect_initial_ms: 20,
        reconnect_max_ms: 100,
    }
}

struct RunningBroker {
    frontend: SocketAddr,
    backend: SocketAddr,
    registry: Arc<WorkerRegistry>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RunningBroker {
    async fn start(frontend: &str, backend: &str) -> Self {
        let broker = Broker::bind(BrokerConfig {
            frontend: frontend.to_string(),
            backend: backend.to_string(),
            http_listen: None,
            stub: false,
            heartbeat: heartbeat(),
        })
        .await
        .unwrap();
        let frontend = broker.frontend_addr().unwrap();
        let backend = broker.backend_addr().unwrap();
        let registry = broker.registry();
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            broker
                .run(async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });
        Self {
            frontend,
            backend,
            registry,
            stop: Some(stop),
            task,
        }
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task).await.unwrap();
    }

    async fn wait_for_workers(&self, count: usize) {
        for _ in 0..400 {
            if self.registry.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} workers, have {}", self.registry.len());
    }
}

impl Drop for RunningBroker {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn datanode_config(dir: &TempDir, broker: &RunningBroker, buckets: u32, channels: u32) -> DatanodeConfig {
    DatanodeConfig {
        datanode_id: 1,
        broker_endpoint: broker.backend.to_string(),
        total_buckets: buckets,
        total_channels: channels,
        data_dir: dir.path().to_path_buf(),
        storage: StorageConfig {
            backend: StorageBackend::Redb,
            max_dbsize: 64 * 1024 * 1024,
        },
        heartbeat: heartbeat(),
    }
}

#[tokio::test]
async fn test_put_then_get_returns_payload() {
    let dir = tempfile::tempdir().unwrap();
    let broker = RunningBroker::start("127.0.0.1:0", "127.0.0.1:0").await;
    let datanode = Datanode::start(datanode_config(&dir, &broker, 2, 2))
        .await
        .unwrap();
    broker.wait_for_workers(datanode.total_workers()).await;

    let mut client = Client::connect(broker.frontend).await.unwrap();
    let payload = Bytes::from(vec![0x5Au8; 16]);
    assert_eq!(client.put("alpha", payload.clone()).await.unwrap(), Reply::Ack);
    assert_eq!(
        client.get("alpha").await.unwrap(),
        Reply::Data {
            key: Bytes::from_static(b"alpha"),
            payload,
        }
    );

    datanode.shutdown().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_missing_key_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let broker = RunningBroker::start("127.0.0.1:0", "127.0.0.1:0").await;
    let datanode = Datanode::start(datanode_config(&dir, &broker, 1, 3))
        .await
        .unwrap();
    broker.wait_for_workers(3).await;

    let mut client = Client::connect(broker.frontend).await.unwrap();
    assert_eq!(client.get("missing").await.unwrap(), Reply::NotFound);

    assert_eq!(client.put("beta", "value").await.unwrap(), Reply::Ack);
    assert_eq!(client.delete("beta").await.unwrap(), Reply::Ack);
    assert_eq!(client.get("beta").await.unwrap(), Reply::NotFound);
    assert_eq!(client.delete("beta").await.unwrap(), Reply::NotFound);

    datanode.shutdown().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_many_keys_across_buckets() {
    let dir = tempfile::tempdir().unwrap();
    let broker = RunningBroker::start("127.0.0.1:0", "127.0.0.1:0").await;
    let datanode = Datanode::start(datanode_config(&dir, &broker, 4, 1))
        .await
        .unwrap();
    broker.wait_for_workers(4).await;

    let mut client = Client::connect(broker.frontend).await.unwrap();
    for i in 0..40 {
        let key = format!("key-{i}");
        assert_eq!(client.put(key.clone(), format!("value-{i}")).await.unwrap(), Reply::Ack);
    }
    // Routing is a pure function of the key, so every read lands on the
    // bucket that took the write
    for i in 0..40 {
        let reply = client.get(format!("key-{i}")).await.unwrap();
        assert_eq!(
            reply.into_payload().unwrap(),
            Bytes::from(format!("value-{i}"))
        );
    }

    let stats = datanode.stats().unwrap();
    assert_eq!(stats.len(), 4);
    datanode.shutdown().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_stopped_datanode_leaves_no_workers() {
    let dir = tempfile::tempdir().unwrap();
    let broker = RunningBroker::start("127.0.0.1:0", "127.0.0.1:0").await;
    let datanode = Datanode::start(datanode_config(&dir, &broker, 1, 2))
        .await
        .unwrap();
    broker.wait_for_workers(2).await;

    datanode.shutdown().await.unwrap();
    broker.wait_for_workers(0).await;

    let mut client = Client::connect(broker.frontend).await.unwrap();
    assert_eq!(client.put("gamma", "value").await.unwrap(), Reply::Error);

    broker.stop().await;
}

#[tokio::test]
async fn test_channels_reconnect_to_restarted_broker() {
    let dir = tempfile::tempdir().unwrap();
    let broker = RunningBroker::start("127.0.0.1:0", "127.0.0.1:0").await;
    let datanode = Datanode::start(datanode_config(&dir, &broker, 1, 2))
        .await
        .unwrap();
    broker.wait_for_workers(2).await;

    let mut client = Client::connect(broker.frontend).await.unwrap();
    assert_eq!(client.put("delta", "persisted").await.unwrap(), Reply::Ack);
    drop(client);

    // Bring a new broker up on the same backend address
    let backend = broker.backend.to_string();
    broker.stop().await;
    let broker = RunningBroker::start("127.0.0.1:0", &backend).await;
    broker.wait_for_workers(2).await;

    let mut client = Client::connect(broker.frontend).await.unwrap();
    assert_eq!(
        client.get("delta").await.unwrap().into_payload().unwrap(),
        Bytes::from_static(b"persisted")
    );

    datanode.shutdown().await.unwrap();
    broker.stop().await;
}
