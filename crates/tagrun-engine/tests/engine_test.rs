// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine tests driven through the request handlers with mock runners.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::*;
use tagrun_engine::Error;
use tagrun_engine::artifact::{RunOverrides, ScriptState, ServiceState, is_stop_timeout};
use tagrun_engine::handlers::{
    EnableServiceRequest, RunScriptRequest, ServiceLogsRequest, StopRequest, handle_get_service_logs,
    handle_health_check, handle_kill_script, handle_list_apps, handle_restart_script, handle_run_script,
    handle_run_service, handle_set_service_enabled, handle_terminate_script, handle_terminate_service,
};
use tagrun_engine::manifest::AppKind;
use tagrun_engine::repository::{FsRepositorySource, RepositoryInfo, TagInfo};
use tagrun_engine::runner::mock::MOCK_KILLED;
use tagrun_engine::runner::{MockRunner, MockRunnerFactory, Runner};

async fn context_with_demo(factory: Arc<MockRunnerFactory>) -> TestContext {
    let ctx = TestContext::with_factory(factory).await;
    ctx.write_tag(1, "demo", "v1", MANIFEST, &[("main.py", "print('hi')")]);
    ctx.open_tree().await;
    ctx
}

fn run_request(caller: tagrun_engine::handlers::Caller, name: &str, version: &str) -> RunScriptRequest {
    RunScriptRequest {
        target: target(caller, name, version),
        overrides: None,
    }
}

fn stop_request(name: &str, timeout_ms: Option<u64>, escalate: bool) -> StopRequest {
    StopRequest {
        target: target(caller(1), name, "v1"),
        timeout_ms,
        escalate,
    }
}

// ============================================================================
// Projection
// ============================================================================

#[tokio::test]
async fn test_health_check_counts_projected_artifacts() {
    let ctx = context_with_demo(long_running_factory()).await;

    let health = handle_health_check(ctx.state()).await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.repositories, 1);
    assert_eq!(health.scripts, 2);
    assert_eq!(health.services, 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_list_apps_shows_only_own_artifacts() {
    let ctx = TestContext::with_factory(long_running_factory()).await;
    ctx.write_tag(1, "demo", "v1", MANIFEST, &[]);
    ctx.write_tag(2, "other", "v1", "apps:\n  solo:\n    type: python\n    config: {entry_file: solo.py}\n", &[]);
    ctx.open_tree().await;

    let owner = handle_list_apps(ctx.state(), &caller(1)).await.unwrap();
    let mut names: Vec<_> = owner.scripts.iter().map(|s| s.name.as_str()).collect();
    names.sort();
    assert_eq!(names, ["dash", "report"]);
    assert_eq!(owner.services.len(), 1);
    assert_eq!(owner.services[0].state, ServiceState::Inactive);
    assert!(!owner.services[0].enabled);

    let other = handle_list_apps(ctx.state(), &caller(2)).await.unwrap();
    assert_eq!(other.scripts.len(), 1);
    assert_eq!(other.scripts[0].name, "solo");
    assert!(other.services.is_empty());

    ctx.shutdown().await;
}

// ============================================================================
// Scripts
// ============================================================================

#[tokio::test]
async fn test_run_script_applies_overrides() {
    let factory = long_running_factory();
    let ctx = context_with_demo(factory.clone()).await;

    let snapshot = handle_run_script(
        ctx.state(),
        RunScriptRequest {
            target: target(caller(1), "report", "v1"),
            overrides: Some(RunOverrides {
                env: Some(BTreeMap::from([("EXTRA".to_string(), "1".to_string())])),
                cli_args: Some(vec!["--fast".to_string()]),
                ..Default::default()
            }),
        },
    )
    .await
    .unwrap();
    assert_eq!(snapshot.state, ScriptState::Active);
    assert_eq!(snapshot.owner_id, 1);

    let (_, runner) = factory
        .created()
        .into_iter()
        .find(|(kind, _)| *kind == AppKind::Python)
        .unwrap();
    let runs = runner.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].entry_file, "main.py");
    assert_eq!(runs[0].env["MODE"], "full");
    assert_eq!(runs[0].env["EXTRA"], "1");
    assert_eq!(runs[0].env["RELEASE_MODE"], "true");
    assert_eq!(runs[0].cli_args, ["--fast"]);

    let materialized = ctx.run_dir.join("1/demo/v1/main.py");
    assert!(materialized.exists());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_run_script_twice_is_rejected() {
    let ctx = context_with_demo(long_running_factory()).await;

    handle_run_script(ctx.state(), run_request(caller(1), "report", "v1"))
        .await
        .unwrap();
    let second = handle_run_script(ctx.state(), run_request(caller(1), "report", "v1")).await;
    assert!(matches!(second, Err(Error::AlreadyRunning { .. })));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_web_app_reports_port() {
    let ctx = context_with_demo(long_running_factory()).await;

    let snapshot = handle_run_script(ctx.state(), run_request(caller(1), "dash", "v1"))
        .await
        .unwrap();
    assert_eq!(snapshot.kind, AppKind::Streamlit);
    assert!(snapshot.port.is_some());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_unknown_target_is_not_found() {
    let ctx = context_with_demo(long_running_factory()).await;

    let missing = handle_run_script(ctx.state(), run_request(caller(1), "nope", "v1")).await;
    assert!(matches!(missing, Err(Error::NotFound(_))));

    // Other users do not see the owner's artifacts without a grant.
    let foreign = handle_run_script(ctx.state(), run_request(caller(2), "report", "v1")).await;
    assert!(matches!(foreign, Err(Error::NotFound(_))));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_latest_resolves_newest_release() {
    let ctx = context_with_demo(long_running_factory()).await;
    ctx.write_tag(1, "demo", "v2", MANIFEST, &[]);
    let report = ctx
        .index()
        .publish_release(
            1,
            &TagInfo {
                name: "v2".to_string(),
                created_at: Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap(),
            },
        )
        .await
        .unwrap();
    assert!(report.applied);

    let snapshot = handle_run_script(ctx.state(), run_request(caller(1), "report", "latest"))
        .await
        .unwrap();
    assert_eq!(snapshot.version, "v2");

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_terminate_script() {
    let ctx = context_with_demo(long_running_factory()).await;
    handle_run_script(ctx.state(), run_request(caller(1), "report", "v1"))
        .await
        .unwrap();

    let response = handle_terminate_script(ctx.state(), stop_request("report", None, false))
        .await
        .unwrap();
    assert_eq!(response.exit_code, -15);

    let state = ctx.state();
    let stopped = wait_until(Duration::from_secs(2), || async move {
        let view = handle_list_apps(state, &caller(1)).await.unwrap();
        view.scripts
            .iter()
            .any(|s| s.name == "report" && s.state == ScriptState::Inactive && s.exit_code == Some(-15))
    })
    .await;
    assert!(stopped);

    // Stopping again is rejected.
    let again = handle_terminate_script(ctx.state(), stop_request("report", None, false)).await;
    assert!(matches!(again, Err(Error::InvalidRequest(_))));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_terminate_timeout_escalates_only_when_asked() {
    let factory = Arc::new(MockRunnerFactory::new(
        MockRunner::never_completing().ignoring_terminate(),
    ));
    let ctx = context_with_demo(factory).await;
    handle_run_script(ctx.state(), run_request(caller(1), "report", "v1"))
        .await
        .unwrap();

    let timed_out = handle_terminate_script(ctx.state(), stop_request("report", Some(50), false)).await;
    assert!(timed_out.as_ref().is_err_and(is_stop_timeout));

    let escalated = handle_terminate_script(ctx.state(), stop_request("report", Some(50), true))
        .await
        .unwrap();
    assert_eq!(escalated.exit_code, MOCK_KILLED);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_kill_and_restart_script() {
    let factory = long_running_factory();
    let ctx = context_with_demo(factory.clone()).await;
    handle_run_script(ctx.state(), run_request(caller(1), "report", "v1"))
        .await
        .unwrap();

    let killed = handle_kill_script(ctx.state(), stop_request("report", Some(1000), false))
        .await
        .unwrap();
    assert_eq!(killed.exit_code, MOCK_KILLED);

    let restarted = handle_restart_script(ctx.state(), run_request(caller(1), "report", "v1"))
        .await
        .unwrap();
    assert_eq!(restarted.state, ScriptState::Active);

    // Restarting a running script stops it first.
    handle_restart_script(ctx.state(), run_request(caller(1), "report", "v1"))
        .await
        .unwrap();
    let (_, runner) = factory
        .created()
        .into_iter()
        .find(|(kind, _)| *kind == AppKind::Python)
        .unwrap();
    assert_eq!(runner.runs().len(), 3);
    assert!(runner.is_running());

    ctx.shutdown().await;
}

// ============================================================================
// Services
// ============================================================================

#[tokio::test]
async fn test_enable_service_starts_and_disable_stops() {
    let ctx = context_with_demo(long_running_factory()).await;
    let worker = || target(caller(1), "worker", "v1");

    let enabled = handle_set_service_enabled(
        ctx.state(),
        EnableServiceRequest {
            target: worker(),
            enabled: true,
            auto_start: true,
        },
    )
    .await
    .unwrap();
    assert!(enabled.enabled);
    assert_eq!(enabled.state, ServiceState::Active);
    assert!(enabled.started_at.is_some());
    assert!(ctx.run_dir.join("1/demo/v1/worker.enabled").exists());

    let disabled = handle_set_service_enabled(
        ctx.state(),
        EnableServiceRequest {
            target: worker(),
            enabled: false,
            auto_start: false,
        },
    )
    .await
    .unwrap();
    assert!(!disabled.enabled);

    let state = ctx.state();
    let stopped = wait_until(Duration::from_secs(2), || async move {
        let view = handle_list_apps(state, &caller(1)).await.unwrap();
        view.services[0].state == ServiceState::Inactive
    })
    .await;
    assert!(stopped);

    let logs = handle_get_service_logs(
        ctx.state(),
        ServiceLogsRequest {
            target: worker(),
            limit: 10,
        },
    )
    .await
    .unwrap();
    assert!(logs.iter().any(|line| line.ends_with("Starting service...")));
    assert!(logs.iter().any(|line| line.ends_with("Service has been terminated")));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_enabled_service_restarts_after_terminate() {
    let ctx = context_with_demo(long_running_factory()).await;
    let worker = || target(caller(1), "worker", "v1");

    handle_set_service_enabled(
        ctx.state(),
        EnableServiceRequest {
            target: worker(),
            enabled: true,
            auto_start: true,
        },
    )
    .await
    .unwrap();

    let response = handle_terminate_service(
        ctx.state(),
        StopRequest {
            target: worker(),
            timeout_ms: Some(1000),
            escalate: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(response.exit_code, -15);

    let state = ctx.state();
    let restarted = wait_until(Duration::from_secs(2), || async move {
        let logs = handle_get_service_logs(
            state,
            ServiceLogsRequest {
                target: worker(),
                limit: 50,
            },
        )
        .await
        .unwrap();
        logs.iter()
            .filter(|line| line.ends_with("Starting service..."))
            .count()
            >= 2
    })
    .await;
    assert!(restarted);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failing_service_reports_failed_to_start() {
    let ctx = context_with_demo(Arc::new(MockRunnerFactory::new(MockRunner::failing()))).await;

    let result = handle_run_service(ctx.state(), &target(caller(1), "worker", "v1")).await;
    assert!(matches!(result, Err(Error::StartupFailed { attempts: 3, .. })));

    let view = handle_list_apps(ctx.state(), &caller(1)).await.unwrap();
    assert_eq!(view.services[0].state, ServiceState::FailedToStart);
    assert_eq!(view.services[0].exit_code, Some(1));

    ctx.shutdown().await;
}

// ============================================================================
// Sharing
// ============================================================================

#[tokio::test]
async fn test_release_grant_projects_and_withdraws_clone() {
    let ctx = context_with_demo(long_running_factory()).await;
    let grantee = caller_with_grants(2, &["python;report;v1"], &[]);

    let view = handle_list_apps(ctx.state(), &grantee).await.unwrap();
    assert_eq!(view.scripts.len(), 1);
    assert_eq!(view.scripts[0].name, "report");
    assert_eq!(view.scripts[0].owner_id, 1);
    assert_eq!(view.scripts[0].shared_to, Some(2));

    let snapshot = handle_run_script(ctx.state(), run_request(grantee.clone(), "report", "v1"))
        .await
        .unwrap();
    assert_eq!(snapshot.state, ScriptState::Active);
    assert!(ctx.run_dir.join("2/demo/v1").exists());

    // The owner's copy is untouched by the grantee's run.
    let owner_view = handle_list_apps(ctx.state(), &caller(1)).await.unwrap();
    let owner_report = owner_view.scripts.iter().find(|s| s.name == "report").unwrap();
    assert_eq!(owner_report.state, ScriptState::Inactive);
    assert_eq!(owner_report.shared_to, None);

    // Dropping the grant removes the clone.
    let view = handle_list_apps(ctx.state(), &caller(2)).await.unwrap();
    assert!(view.scripts.is_empty());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_trusted_user_sees_every_artifact() {
    let ctx = context_with_demo(long_running_factory()).await;
    let grantee = caller_with_grants(2, &[], &[1]);

    let view = handle_list_apps(ctx.state(), &grantee).await.unwrap();
    assert_eq!(view.scripts.len(), 2);
    assert_eq!(view.services.len(), 1);
    assert!(view.services.iter().all(|s| s.shared_to == Some(2)));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_grant_with_wrong_kind_is_ignored() {
    let ctx = context_with_demo(long_running_factory()).await;
    let grantee = caller_with_grants(2, &["service;report;v1", "python;report;v9"], &[]);

    let view = handle_list_apps(ctx.state(), &grantee).await.unwrap();
    assert!(view.scripts.is_empty());
    assert!(view.services.is_empty());

    ctx.shutdown().await;
}

// ============================================================================
// Release lifecycle
// ============================================================================

#[tokio::test]
async fn test_publish_rejects_name_used_by_another_repository() {
    let ctx = context_with_demo(long_running_factory()).await;

    let other_root = ctx.repos_root.join("2/copycat");
    std::fs::create_dir_all(&other_root).unwrap();
    let (repo, failures) = ctx
        .index()
        .open_repository(
            RepositoryInfo {
                id: 50,
                name: "copycat".to_string(),
                owner_id: 2,
                owner_name: "bob".to_string(),
            },
            Arc::new(FsRepositorySource::new(&other_root)),
        )
        .await
        .unwrap();
    assert!(failures.is_empty());
    assert!(repo.releases().is_empty());

    ctx.write_tag(2, "copycat", "v1", MANIFEST, &[]);
    let tag = TagInfo {
        name: "v1".to_string(),
        created_at: Utc::now(),
    };
    let result = ctx.index().publish_release(50, &tag).await;
    assert!(matches!(result, Err(Error::NameUnavailable(_))));
    assert!(repo.releases().is_empty());
    assert!(other_root.join("v1").exists());

    ctx.write_tag(2, "copycat", "v2uc", MANIFEST, &[]);
    let unconfigured = TagInfo {
        name: "v2uc".to_string(),
        created_at: Utc::now(),
    };
    let result = ctx.index().publish_release(50, &unconfigured).await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_delete_release_stops_and_purges_artifacts() {
    let factory = long_running_factory();
    let ctx = context_with_demo(factory.clone()).await;
    handle_run_script(ctx.state(), run_request(caller(1), "report", "v1"))
        .await
        .unwrap();

    let report = ctx.index().delete_release(1, "v1").await.unwrap();
    assert!(report.applied);
    assert!(report.failures.is_empty());

    assert!(ctx.index().scripts().is_empty());
    assert!(ctx.index().services().is_empty());
    assert!(factory.created().iter().all(|(_, runner)| !runner.is_running()));
    assert!(!ctx.tag_dir(1, "demo", "v1").exists());
    assert!(!ctx.run_dir.join("1/demo/v1").exists());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_delete_repository_keeps_tags() {
    let ctx = context_with_demo(long_running_factory()).await;

    let failures = ctx.index().delete_repository(1).await.unwrap();
    assert!(failures.is_empty());
    assert!(ctx.index().repositories().is_empty());
    assert!(ctx.index().scripts().is_empty());
    assert!(ctx.tag_dir(1, "demo", "v1").exists());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_running_artifacts() {
    let factory = long_running_factory();
    let ctx = context_with_demo(factory.clone()).await;
    handle_run_script(ctx.state(), run_request(caller(1), "report", "v1"))
        .await
        .unwrap();
    handle_run_service(ctx.state(), &target(caller(1), "worker", "v1"))
        .await
        .unwrap();
    assert!(factory.created().iter().any(|(_, runner)| runner.is_running()));

    ctx.shutdown().await;
    assert!(factory.created().iter().all(|(_, runner)| !runner.is_running()));
}
