//! End-to-end HyperMetro behaviour across two simulated arrays bonded
//! through the backend table.

use assert_matches::assert_matches;
use serde_json::json;
use std::sync::Arc;
use storage_backend_plugins::array::{SimulatedArray, SimulatedClientFactory};
use storage_backend_plugins::domain::{ArrayModel, PairRunningStatus};
use storage_backend_plugins::{
    BackendConfig, BackendTable, ClientFactory, Error, ErrorKind, Parameters, PluginRegistry,
    Protocol, RequestContext,
};

const VOLUME_ID: &str = "san-a.pvc-metro";
const LUN: &str = "pvc-metro";

struct Fixture {
    a: Arc<SimulatedArray>,
    b: Arc<SimulatedArray>,
    table: Arc<BackendTable>,
    ctx: RequestContext,
}

fn params(value: serde_json::Value) -> Parameters {
    value.as_object().cloned().unwrap_or_default()
}

fn node(host: &str) -> Parameters {
    params(json!({
        "HostName": host,
        "FCInitiators": [format!("2100{}", host)],
    }))
}

fn san(name: &str, url: &str, remote: &str) -> BackendConfig {
    BackendConfig::new(name, "oceanstor-san", url)
        .with_pools(&["pool0"])
        .with_parameter("protocol", json!("fc"))
        .with_metro_backend(remote, "metro-domain-1")
}

/// Two DoradoV6 arrays bonded as a metro pair, with one paired volume
async fn fixture() -> Fixture {
    let factory = SimulatedClientFactory::new();
    let a = SimulatedArray::new("SN-A", ArrayModel::DoradoV6);
    let b = SimulatedArray::new("SN-B", ArrayModel::DoradoV6);
    a.add_pool("pool0", 1 << 40, 1 << 40);
    b.add_pool("pool0", 1 << 40, 1 << 40);
    factory.add_array("https://array-a", Arc::clone(&a));
    factory.add_array("https://array-b", Arc::clone(&b));
    a.link_metro_peer(&b);

    let factory: Arc<dyn ClientFactory> = Arc::new(factory);
    let registry = PluginRegistry::with_builtin_plugins(factory).unwrap();
    let table = BackendTable::new(registry);
    table.register(san("san-a", "https://array-a", "san-b")).await.unwrap();
    table.register(san("san-b", "https://array-b", "san-a")).await.unwrap();
    table.bond_topology().unwrap();

    let ctx = RequestContext::new("test");
    let info = table
        .create_volume(
            &ctx,
            "san-a",
            LUN,
            &params(json!({"size": 1 << 30, "storagepool": "pool0", "hyperMetro": true})),
        )
        .await
        .unwrap();
    assert!(info.hyper_metro);

    Fixture { a, b, table, ctx }
}

/// Take a backend's array away: fail its next refresh and every relogin
async fn take_offline(table: &BackendTable, array: &SimulatedArray) {
    array.set_fail_queries(true);
    array.set_fail_login(true);
    table.refresh_capabilities().await;
}

#[tokio::test]
async fn test_create_builds_pair_on_both_arrays() {
    let f = fixture().await;

    assert!(f.a.volume(LUN).is_some());
    assert!(f.b.volume(LUN).is_some());
    let pair = f.a.pair_for(LUN).unwrap();
    assert_eq!(pair.domain, "metro-domain-1");
    assert_eq!(pair.remote_object_id, f.b.volume(LUN).unwrap().id);

    // The twin reports the same pair from its own side
    assert!(f.b.volume(LUN).unwrap().is_hypermetro().unwrap());
    let twin = f.b.pair_for(LUN).unwrap();
    assert_eq!(twin.id, pair.id);
    assert_eq!(twin.remote_object_id, f.a.volume(LUN).unwrap().id);
}

#[tokio::test]
async fn test_attach_through_remote_backend_reaches_both_arrays() {
    let f = fixture().await;

    let mapping = f
        .table
        .attach_volume(&f.ctx, "san-b.pvc-metro", &node("node-1"))
        .await
        .unwrap();
    assert_eq!(mapping.host_lun_ids.len(), 2);
    assert!(f.a.is_mapped(LUN, "node-1"));
    assert!(f.b.is_mapped(LUN, "node-1"));
}

#[tokio::test]
async fn test_create_rolls_back_when_twin_fails() {
    let f = fixture().await;

    // The remote pool doesn't exist: the local volume must not survive
    let res = f
        .table
        .create_volume(
            &f.ctx,
            "san-a",
            "pvc-orphan",
            &params(json!({
                "size": 1 << 30,
                "storagepool": "pool0",
                "remotestoragepool": "missing",
                "hyperMetro": true
            })),
        )
        .await;
    assert!(res.unwrap_err().is_not_found());
    assert!(f.a.volume("pvc-orphan").is_none());
    assert!(f.b.volume("pvc-orphan").is_none());
}

#[tokio::test]
async fn test_dual_array_attach_and_detach() {
    let f = fixture().await;

    let mapping = f
        .table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap();
    assert_eq!(mapping.protocol, Protocol::Fc);
    assert_eq!(mapping.host_lun_ids.len(), 2);
    assert_eq!(mapping.target_wwns.len(), 4);
    assert!(f.a.is_mapped(LUN, "node-1"));
    assert!(f.b.is_mapped(LUN, "node-1"));

    f.table
        .detach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap();
    assert!(!f.a.is_mapped(LUN, "node-1"));
    assert!(!f.b.is_mapped(LUN, "node-1"));
}

#[tokio::test]
async fn test_remote_map_failure_is_partial_and_keeps_local_mapping() {
    let f = fixture().await;
    f.b.set_fail_map(true);

    let err = f
        .table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    assert!(err.is_retryable());
    assert!(f.a.is_mapped(LUN, "node-1"));
    assert!(!f.b.is_mapped(LUN, "node-1"));

    // A retry after the remote recovers completes the attach
    f.b.set_fail_map(false);
    f.table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap();
    assert!(f.b.is_mapped(LUN, "node-1"));
}

#[tokio::test]
async fn test_unreachable_remote_degrades_to_local() {
    let f = fixture().await;
    take_offline(&f.table, &f.b).await;

    let mapping = f
        .table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap();
    assert_eq!(mapping.host_lun_ids.len(), 1);
    assert!(f.a.is_mapped(LUN, "node-1"));
    assert_eq!(f.b.mapping_count(), 0);

    let report = f
        .table
        .get("san-a")
        .unwrap()
        .update_backend_capabilities()
        .await
        .unwrap();
    assert!(!report.capabilities.support_metro);
}

#[tokio::test]
async fn test_deregistered_remote_degrades_to_local() {
    let f = fixture().await;
    f.table.deregister("san-b").await.unwrap();

    f.table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap();
    assert!(f.a.is_mapped(LUN, "node-1"));
    assert_eq!(f.b.mapping_count(), 0);
}

#[tokio::test]
async fn test_unreachable_local_runs_on_remote() {
    let f = fixture().await;
    take_offline(&f.table, &f.a).await;

    f.table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap();
    assert!(f.b.is_mapped(LUN, "node-1"));
}

#[tokio::test]
async fn test_unpaired_volume_with_unreachable_local_is_not_reported_gone() {
    let f = fixture().await;
    f.table
        .create_volume(
            &f.ctx,
            "san-a",
            "pvc-plain",
            &params(json!({"size": 1 << 30, "storagepool": "pool0"})),
        )
        .await
        .unwrap();
    f.table
        .attach_volume(&f.ctx, "san-a.pvc-plain", &node("node-1"))
        .await
        .unwrap();
    take_offline(&f.table, &f.a).await;

    // Only the owning array can say the volume is gone
    let err = f
        .table
        .detach_volume(&f.ctx, "san-a.pvc-plain", &node("node-1"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(f.a.is_mapped("pvc-plain", "node-1"));

    let err = f
        .table
        .attach_volume(&f.ctx, "san-a.pvc-plain", &node("node-2"))
        .await
        .unwrap_err();
    assert!(!err.is_not_found());
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_both_sides_unreachable() {
    let f = fixture().await;
    take_offline(&f.table, &f.a).await;
    take_offline(&f.table, &f.b).await;

    let err = f
        .table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn test_missing_pair_is_consistency_error() {
    let f = fixture().await;
    f.a.remove_pair(LUN);

    let err = f
        .table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert_matches!(err, Error::Operation { .. });
    assert_eq!(f.a.mapping_count() + f.b.mapping_count(), 0);
}

#[tokio::test]
async fn test_malformed_relationship_is_treated_as_unpaired() {
    let f = fixture().await;
    f.a.set_relationships(LUN, Some("{HyperMetro: oops"));

    f.table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap();
    assert!(f.a.is_mapped(LUN, "node-1"));
    assert_eq!(f.b.mapping_count(), 0);
}

#[tokio::test]
async fn test_pair_state_is_fetched_every_call() {
    let f = fixture().await;
    let before = f.a.pair_query_count();

    f.table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-1"))
        .await
        .unwrap();
    f.a.set_pair_status(LUN, PairRunningStatus::Paused);
    // A paused pair is logged and the attach still goes ahead on both sides
    f.table
        .attach_volume(&f.ctx, VOLUME_ID, &node("node-2"))
        .await
        .unwrap();
    assert!(f.b.is_mapped(LUN, "node-2"));

    assert_eq!(f.a.pair_query_count() - before, 2);
}

#[tokio::test]
async fn test_teardown_of_missing_volume_succeeds() {
    let f = fixture().await;

    f.table
        .detach_volume(&f.ctx, "san-a.pvc-gone", &node("node-1"))
        .await
        .unwrap();
    let info = f
        .table
        .unstage_volume(&f.ctx, "san-a.pvc-gone", &node("node-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.lun_wwn, None);

    let err = f
        .table
        .attach_volume(&f.ctx, "san-a.pvc-gone", &node("node-1"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_and_expand_reach_both_arrays() {
    let f = fixture().await;

    f.table
        .expand_volume(&f.ctx, VOLUME_ID, 2 << 30)
        .await
        .unwrap();
    assert_eq!(f.a.volume(LUN).unwrap().capacity_sectors, (2 << 30) / 512);
    assert_eq!(f.b.volume(LUN).unwrap().capacity_sectors, (2 << 30) / 512);

    f.table.delete_volume(&f.ctx, VOLUME_ID).await.unwrap();
    assert!(f.a.volume(LUN).is_none());
    assert!(f.b.volume(LUN).is_none());
    assert!(f.a.pair_for(LUN).is_none());
}

#[tokio::test]
async fn test_delete_waits_for_unreachable_remote() {
    let f = fixture().await;
    f.table.deregister("san-b").await.unwrap();

    let err = f.table.delete_volume(&f.ctx, VOLUME_ID).await.unwrap_err();
    assert!(err.is_transient());
    assert!(f.a.volume(LUN).is_some());
}
