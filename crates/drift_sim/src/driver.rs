//! Runs one scenario against a scheduler.
//!
//! Per tick, on the driver task:
//! 1. raft step (leader election, splits)
//! 2. scripted events
//! 3. every node reports queued region changes and ticks, in parallel
//! 4. the scenario checker; success ends the run
//!
//! The run also ends at `max_ticks` (failure) or on cancellation (failure).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use drift_analyzer::{TransferCounter, TransferSummary};
use drift_sched::scheduler::SchedulerConnector;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cluster::{Cluster, Connection};
use crate::config::SimConfig;
use crate::event::EventRunner;
use crate::node::NodeOptions;
use crate::raft::RaftEngine;
use crate::scenario::{CheckContext, Checker, Scenario};
use crate::stats::SchedulerStats;

const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Result of one scenario run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub name: &'static str,
    pub passed: bool,
    pub ticks: u64,
    pub elapsed: Duration,
    pub stats: SchedulerStats,
    pub store_num: usize,
    pub region_num: usize,
    /// Present when the scenario fed peer moves into a transfer counter.
    pub transfers: Option<TransferSummary>,
}

/// One JSON line of the run report.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub name: &'a str,
    pub passed: bool,
    pub ticks: u64,
    pub elapsed_ms: u64,
    pub stats: &'a SchedulerStats,
    pub redundant: Option<u64>,
    pub necessary: Option<u64>,
}

impl RunOutcome {
    pub fn report(&self) -> RunReport<'_> {
        RunReport {
            name: self.name,
            passed: self.passed,
            ticks: self.ticks,
            elapsed_ms: u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX),
            stats: &self.stats,
            redundant: self.transfers.as_ref().map(|t| t.redundant),
            necessary: self.transfers.as_ref().map(|t| t.necessary),
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] total iteration: {}, time cost: {:.3?}",
            if self.passed { "PASS" } else { "FAIL" },
            self.name,
            self.ticks,
            self.elapsed
        )
    }
}

pub struct Driver {
    name: &'static str,
    cluster: Cluster,
    events: EventRunner,
    checker: Checker,
    hook: Option<Arc<TransferCounter>>,
    tick_interval: Duration,
    max_ticks: u64,
    rpc_timeout: Duration,
    tick_count: u64,
    store_num: usize,
    region_num: usize,
}

impl Driver {
    /// Builds the raft engine and one node per initial store. Nothing talks
    /// to the scheduler until [`Driver::prepare`].
    pub fn new(
        scenario: Scenario,
        cfg: &SimConfig,
        connector: Arc<dyn SchedulerConnector>,
    ) -> anyhow::Result<Self> {
        let Scenario {
            name,
            stores,
            regions,
            events,
            split,
            checker,
            analyze_transfers,
            store_num,
            region_num,
        } = scenario;

        let conn = Connection::new();
        let raft = Arc::new(RaftEngine::new(regions, split, &conn, cfg.rpc_timeout));
        let hook = analyze_transfers.then(|| Arc::new(TransferCounter::new()));
        let opts = NodeOptions {
            io_rate: cfg.store_io_rate(),
            rpc_timeout: cfg.rpc_timeout,
            capacity: cfg.store_capacity(),
            available: cfg.store_available(),
        };
        let cluster = Cluster::new(conn, raft, connector, opts, hook.clone());
        for store in stores {
            cluster.create_node(store)?;
        }

        Ok(Self {
            name,
            cluster,
            events: EventRunner::new(events),
            checker,
            hook,
            tick_interval: cfg.tick_interval.max(MIN_TICK_INTERVAL),
            max_ticks: cfg.max_ticks,
            rpc_timeout: cfg.rpc_timeout,
            tick_count: 0,
            store_num,
            region_num,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    async fn call<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(res) => res,
            Err(_) => anyhow::bail!("{what} timed out after {:?}", self.rpc_timeout),
        }
    }

    /// Bootstraps the scheduler from the first region, moves its id
    /// allocator past every id in use and starts all nodes.
    pub async fn prepare(&mut self) -> anyhow::Result<()> {
        let raft = self.cluster.raft();
        let region = raft.bootstrap_region().context("select bootstrap region")?;
        let leader_store = region
            .leader_store_id()
            .with_context(|| format!("bootstrap region {} has no leader", region.id))?;
        let leader = self
            .cluster
            .connection()
            .get(leader_store)
            .with_context(|| format!("bootstrap store {leader_store} is not connected"))?;
        self.call(
            "bootstrap",
            leader.client().bootstrap(leader.store(), region),
        )
        .await
        .context("bootstrap scheduler")?;

        let max_id = raft.max_id();
        loop {
            let id = self.call("alloc id", leader.client().alloc_id()).await?;
            if id > max_id {
                break;
            }
        }

        for node in self.cluster.connection().nodes() {
            node.start()
                .await
                .with_context(|| format!("start node {}", node.id()))?;
        }
        tracing::info!(
            scenario = self.name,
            stores = self.cluster.connection().len(),
            regions = raft.regions().len(),
            "scenario prepared"
        );
        Ok(())
    }

    /// Runs one tick. Returns the checker's verdict.
    pub async fn tick(&mut self) -> anyhow::Result<bool> {
        self.tick_count += 1;
        let tick = self.tick_count;
        self.cluster.raft().step().await?;
        self.events.tick(tick, &self.cluster).await?;

        let mut nodes: FuturesUnordered<_> = self
            .cluster
            .connection()
            .nodes()
            .into_iter()
            .map(|node| {
                tokio::spawn(async move {
                    node.report_region_change().await;
                    // Node schedules count rounds from 0.
                    node.tick(tick - 1).await;
                })
            })
            .collect();
        while let Some(res) = nodes.next().await {
            res.context("node tick task failed")?;
        }

        let stores = self.cluster.store_stats();
        let ctx = CheckContext {
            tick,
            regions: self.cluster.raft().regions(),
            stores: &stores,
        };
        Ok((self.checker)(&ctx))
    }

    /// Ticks until the checker passes, `max_ticks` is reached or `cancel`
    /// fires.
    pub async fn run(&mut self, cancel: &CancellationToken) -> anyhow::Result<RunOutcome> {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut passed = false;
        while self.tick_count < self.max_ticks {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(scenario = self.name, tick = self.tick_count, "run interrupted");
                    break;
                }
                _ = ticker.tick() => {}
            }
            if self.tick().await? {
                passed = true;
                break;
            }
        }

        Ok(RunOutcome {
            name: self.name,
            passed,
            ticks: self.tick_count,
            elapsed: started.elapsed(),
            stats: self.cluster.raft().stats(),
            store_num: self.store_num,
            region_num: self.region_num,
            transfers: self.hook.as_ref().map(|h| h.result()),
        })
    }

    pub async fn stop(&self) {
        self.cluster.stop_all().await;
        tracing::debug!(scenario = self.name, "nodes stopped");
    }
}
