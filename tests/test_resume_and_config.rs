mod common;

use std::fs;

use bde_scheduler::domain::collaborators::resource_graph::ResourceGraph;
use bde_scheduler::domain::collaborators::site_store::SiteStore;
use bde_scheduler::domain::model::block::BlockState;
use bde_scheduler::domain::model::flow::FlowState;
use bde_scheduler::domain::model::raw_job::RawJobState;
use bde_scheduler::domain::scheduler::config::TransferAuth;
use bde_scheduler::domain::scheduler;
use bde_scheduler::domain::utils::id::SiteId;
use bde_scheduler::error::{ConversionError, Error};
use bde_scheduler::{build_scheduler_context, load_config};

use common::{Harness, MB, active_task, report, script_happy_portal, status, submit_and_settle, tick};

#[tokio::test]
async fn restart_retires_running_flow_and_resends_its_block() {
    let h = Harness::with_static_path();
    script_happy_portal(&h.portal, 1, false);

    let first = scheduler::start(h.ctx.clone());
    let id = submit_and_settle(&first, "resume").await;
    tick(&first).await;
    let old_task = active_task(&first, &id).await;
    assert!(report(&first, &old_task, 1).await);
    first.shutdown().await.unwrap();

    let second = scheduler::start(h.ctx.clone());
    second.wait_idle().await.unwrap();

    let resumed = status(&second, &id).await;
    assert_eq!(resumed.raw.state, RawJobState::Transferring);
    assert_eq!(resumed.sjobs[0].flows[0].state, FlowState::Done);
    assert_eq!(resumed.sjobs[0].blocks[0].state(), BlockState::Waiting);
    assert_eq!(h.rpc.calls_for("mdtm_stop").len(), 1);
    assert_eq!(h.portal.calls_for("sdn_release_request").len(), 2);

    assert!(!report(&second, &old_task, 3).await);

    tick(&second).await;
    let new_task = active_task(&second, &id).await;
    assert_ne!(new_task, old_task);
    assert!(report(&second, &new_task, 1).await);
    assert!(report(&second, &new_task, 3).await);

    let done = status(&second, &id).await;
    assert_eq!(done.raw.state, RawJobState::Finished);
    assert_eq!(done.raw.tx_bytes, MB);
    assert_eq!(done.sjobs[0].flows.len(), 2);
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_reruns_intake_for_jobs_without_sjobs() {
    let h = Harness::with_static_path();
    script_happy_portal(&h.portal, 2, false);
    let raw = common::submission("pending").into_raw_job(900).unwrap();
    h.store.insert_rawjob(raw.clone()).unwrap();

    let handle = scheduler::start(h.ctx.clone());
    handle.wait_idle().await.unwrap();

    let resumed = status(&handle, &raw.id).await;
    assert_eq!(resumed.raw.size, 2 * MB);
    assert_eq!(resumed.sjobs.len(), 1);
    assert_eq!(h.store.get_sjobs_from_rawjob(&raw.id).len(), 1);
    assert_eq!(h.portal.calls_for("file_expand_and_group").len(), 1);
    handle.shutdown().await.unwrap();
}

#[test]
fn config_and_topology_files_build_a_context() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("scheduler.json");
    let topology_path = dir.path().join("topology.json");
    fs::write(
        &config_path,
        r#"{
            "transferAuth": {"mode": "password", "username": "bde", "password": "pw"},
            "groupSize": "1GB",
            "inactivityTimeoutSecs": 120,
            "network": {"staticWanPaths": [{"srcSite": "a", "dstSite": "b", "vlanSrc": 7, "vlanDst": 8, "bandwidth": 1000}]},
            "portal": {"user": "scheduler", "token": "t0k3n"},
            "rpcGateway": "http://127.0.0.1:9000"
        }"#,
    )
    .unwrap();
    fs::write(&topology_path, serde_json::to_string(&common::topology()).unwrap()).unwrap();

    let config = load_config(&config_path).unwrap();
    assert_eq!(config.group_size, 1024 * 1024 * 1024);
    assert_eq!(config.inactivity_timeout, 120);
    assert!(matches!(config.transfer_auth, TransferAuth::Password { .. }));

    let ctx = build_scheduler_context(&config_path, &topology_path).unwrap();
    assert_eq!(ctx.graph.local_site(), SiteId::new("a"));
    assert_eq!(ctx.graph.launcher_queue().as_deref(), Some("a.launcher"));
    assert_eq!(ctx.store.get_site(&SiteId::new("b")).map(|s| s.url), Some("https://b".to_string()));
    assert!(ctx.network.config().static_path(&SiteId::new("a"), &SiteId::new("b")).is_some());
}

#[test]
fn missing_collaborator_settings_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("scheduler.json");
    let topology_path = dir.path().join("topology.json");
    fs::write(&config_path, r#"{"transferAuth": {"mode": "certificate"}}"#).unwrap();
    fs::write(&topology_path, r#"{"localSite": "a"}"#).unwrap();

    let err = build_scheduler_context(&config_path, &topology_path).unwrap_err();
    assert!(matches!(err, Error::ConfigError(ConversionError::MissingSetting("portal"))));

    fs::write(&config_path, r#"{"transferAuth": {"mode": "kerberos"}}"#).unwrap();
    assert!(matches!(load_config(&config_path), Err(Error::ConfigError(ConversionError::UnknownTransferAuth(_)))));
    assert!(matches!(load_config(dir.path().join("missing.json")), Err(Error::IoError(_))));
}
