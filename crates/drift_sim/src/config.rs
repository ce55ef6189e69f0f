//! Simulator configuration loaded from a TOML file.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use drift_sched::scheduler::{SchedulerConfig, GIB, MIB};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Stores in the simulated cluster (at least 3).
    pub store_num: usize,
    /// Scenario sizing knob; balance scenarios create
    /// `store_num * region_num / 3` regions.
    pub region_num: usize,
    /// Seed for generated keys.
    pub seed: u64,
    /// Wall-clock pause between ticks.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Ticks before a scenario is declared failed.
    pub max_ticks: u64,
    pub store_capacity_gb: u64,
    pub store_available_gb: u64,
    /// Snapshot bandwidth per store and tick.
    pub store_io_mb_per_tick: u64,
    /// Deadline of every scheduler call.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    pub scheduler: SchedulerConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            store_num: 3,
            region_num: 300,
            seed: 0,
            tick_interval: Duration::from_millis(100),
            max_ticks: 3000,
            store_capacity_gb: 1024,
            store_available_gb: 1024,
            store_io_mb_per_tick: 40,
            rpc_timeout: Duration::from_secs(3),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl SimConfig {
    /// Loads `path`, or returns the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn store_capacity(&self) -> u64 {
        self.store_capacity_gb * GIB
    }

    pub fn store_available(&self) -> u64 {
        self.store_available_gb.min(self.store_capacity_gb) * GIB
    }

    pub fn store_io_rate(&self) -> u64 {
        self.store_io_mb_per_tick * MIB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = SimConfig::from_toml(
            r#"
store_num = 6
tick_interval = "5ms"

[scheduler]
leader_schedule_limit = 8
"#,
        )
        .unwrap();
        assert_eq!(cfg.store_num, 6);
        assert_eq!(cfg.region_num, 300);
        assert_eq!(cfg.tick_interval, Duration::from_millis(5));
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(3));
        assert_eq!(cfg.scheduler.leader_schedule_limit, 8);
        assert_eq!(cfg.scheduler.max_replicas, 3);
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(SimConfig::from_toml("store_count = 4").is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.toml");
        std::fs::write(&path, "region_num = 60\nmax_ticks = 300\n").unwrap();
        let cfg = SimConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.region_num, 60);
        assert_eq!(cfg.max_ticks, 300);
        assert!(SimConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
        assert_eq!(SimConfig::load(None).unwrap(), SimConfig::default());
    }
}
