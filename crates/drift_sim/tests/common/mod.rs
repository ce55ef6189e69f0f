//! Shared helpers for simulator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drift_sched::scheduler::{
    EmbeddedScheduler, Region, ResponseStream, SchedulerClient, SchedulerConfig,
    SchedulerConnector, Store, StoreId, StoreStats,
};
use drift_sim::{scenario, Driver, RunOutcome, SimConfig};
use tokio_util::sync::CancellationToken;

/// Pause between ticks; keeps runs fast without starving the node tasks.
pub const TICK: Duration = Duration::from_millis(1);

pub fn config(store_num: usize, region_num: usize, max_ticks: u64) -> SimConfig {
    SimConfig {
        store_num,
        region_num,
        max_ticks,
        tick_interval: TICK,
        rpc_timeout: Duration::from_secs(2),
        ..SimConfig::default()
    }
}

pub fn embedded(cfg: &SimConfig) -> Arc<dyn SchedulerConnector> {
    Arc::new(EmbeddedScheduler::new(cfg.scheduler.clone()))
}

/// Prepares and runs `name` to completion, then stops every node. The
/// driver is returned so tests can inspect the final region layout.
pub async fn run_scenario(
    name: &str,
    cfg: &SimConfig,
    connector: Arc<dyn SchedulerConnector>,
) -> (RunOutcome, Driver) {
    let scenario = scenario::build(name, cfg).expect("build scenario");
    let mut driver = Driver::new(scenario, cfg, connector).expect("driver");
    driver.prepare().await.expect("prepare");
    let outcome = driver
        .run(&CancellationToken::new())
        .await
        .expect("run scenario");
    driver.stop().await;
    (outcome, driver)
}

/// Connector whose clients reject every region heartbeat.
pub struct NoRegionHeartbeats {
    inner: EmbeddedScheduler,
}

impl NoRegionHeartbeats {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self {
            inner: EmbeddedScheduler::new(cfg),
        }
    }
}

impl SchedulerConnector for NoRegionHeartbeats {
    fn connect(&self, store_id: StoreId) -> anyhow::Result<Arc<dyn SchedulerClient>> {
        Ok(Arc::new(RejectingClient {
            inner: self.inner.connect(store_id)?,
        }))
    }
}

struct RejectingClient {
    inner: Arc<dyn SchedulerClient>,
}

#[async_trait]
impl SchedulerClient for RejectingClient {
    async fn bootstrap(&self, store: Store, region: Region) -> anyhow::Result<()> {
        self.inner.bootstrap(store, region).await
    }

    async fn put_store(&self, store: Store) -> anyhow::Result<()> {
        self.inner.put_store(store).await
    }

    async fn store_heartbeat(&self, stats: StoreStats) -> anyhow::Result<()> {
        self.inner.store_heartbeat(stats).await
    }

    async fn region_heartbeat(&self, region: Region) -> anyhow::Result<()> {
        anyhow::bail!("region heartbeat for {} rejected", region.id)
    }

    fn take_response_stream(&self) -> Option<ResponseStream> {
        self.inner.take_response_stream()
    }

    async fn alloc_id(&self) -> anyhow::Result<u64> {
        self.inner.alloc_id().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
