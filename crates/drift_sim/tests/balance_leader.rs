//! Leader balancing from a cluster whose leaders all sit on one store.

mod common;

use drift_sim::scenario;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leaders_spread_evenly_over_six_stores() {
    let cfg = common::config(6, 60, 300);
    let (outcome, driver) =
        common::run_scenario("balance-leader", &cfg, common::embedded(&cfg)).await;

    assert!(outcome.passed, "{outcome}\n{}", outcome.stats);
    assert!(outcome.ticks <= 300);
    let regions = driver.cluster().raft().regions();
    assert_eq!(regions.len(), 120);
    for store_id in 1..=6 {
        let leaders = regions.leader_count(store_id);
        assert!(
            (19..=21).contains(&leaders),
            "store {store_id} leads {leaders} regions"
        );
    }
    assert!(outcome.stats.total_leader_transfers() > 0);
    assert!(outcome.transfers.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_heartbeats_do_not_stop_the_run() {
    let cfg = common::config(3, 30, 40);
    let connector = std::sync::Arc::new(common::NoRegionHeartbeats::new(cfg.scheduler.clone()));
    let (outcome, driver) = common::run_scenario("balance-leader", &cfg, connector).await;

    assert!(!outcome.passed);
    assert_eq!(outcome.ticks, 40);
    assert_eq!(outcome.stats.total_leader_transfers(), 0);
    assert_eq!(driver.cluster().raft().regions().leader_count(3), 30);
}

#[test]
fn scenario_names_are_unique() {
    let mut names: Vec<&str> = scenario::names().collect();
    let total = names.len();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), total);
    assert_eq!(total, 11);
}
