//! Datanode: the fixed pool of buckets of one process

use crate::actor::ActorPool;
use crate::bucket::{Bucket, BucketService};
use sliceio_common::{DatanodeConfig, Error, Result};
use sliceio_storage::{BucketDb, BucketDbStats};
use std::sync::Arc;
use tracing::info;

/// A running datanode
pub struct Datanode {
    config: DatanodeConfig,
    services: Vec<Arc<BucketService>>,
    pool: ActorPool,
}

impl Datanode {
    /// Open every bucket database, then start the buckets and their channels.
    ///
    /// Storage is opened before any channel connects, so a broken data
    /// directory aborts startup without announcing workers to the broker.
    pub async fn start(config: DatanodeConfig) -> Result<Self> {
        if config.total_buckets == 0 {
            return Err(Error::configuration("total_buckets must be at least 1"));
        }
        if config.total_channels == 0 {
            return Err(Error::configuration("total_channels must be at least 1"));
        }

        let mut services = Vec::with_capacity(config.total_buckets as usize);
        for bucket_id in 0..config.total_buckets {
            let data_dir = config.data_dir.clone();
            let storage = config.storage.clone();
            let db = tokio::task::spawn_blocking(move || {
                BucketDb::open(&data_dir, bucket_id, &storage)
            })
            .await
            .map_err(|e| Error::internal(format!("bucket {bucket_id} open task failed: {e}")))??;
            services.push(Arc::new(BucketService::new(db)));
        }

        let buckets = services
            .iter()
            .map(|service| {
                Bucket::new(
                    config.datanode_id,
                    config.total_channels,
                    config.broker_endpoint.clone(),
                    config.heartbeat.clone(),
                    Arc::clone(service),
                )
            })
            .collect();
        let pool = ActorPool::spawn(format!("datanode-{}", config.datanode_id), buckets).await?;

        info!(
            datanode_id = config.datanode_id,
            buckets = config.total_buckets,
            channels = config.total_channels,
            broker = %config.broker_endpoint,
            "Datanode started"
        );
        Ok(Self {
            config,
            services,
            pool,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &DatanodeConfig {
        &self.config
    }

    /// Number of workers this datanode announces to the broker
    #[must_use]
    pub const fn total_workers(&self) -> usize {
        (self.config.total_buckets as usize) * (self.config.total_channels as usize)
    }

    /// Wait until every bucket has exited on its own
    pub async fn wait(&mut self) {
        self.pool.wait().await;
    }

    /// Per-bucket storage statistics
    pub fn stats(&self) -> Result<Vec<BucketDbStats>> {
        self.services.iter().map(|service| service.db().stats()).collect()
    }

    /// Stop every bucket, then flush and close their databases
    pub async fn shutdown(self) -> Result<()> {
        let result = self.pool.shutdown().await;
        for service in &self.services {
            service.db().flush()?;
        }
        info!(datanode_id = self.config.datanode_id, "Datanode stopped");
        result
    }
}
