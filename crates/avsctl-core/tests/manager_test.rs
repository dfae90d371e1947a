//! Lifecycle tests for the NodeManager against a mock runtime
//!
//! Packages are materialized directly into the temp arena as plain trees
//! (no git history), which the engine treats like local packages: version
//! pinning is skipped and the requested version is recorded as-is.

use avsctl_config::{GlobalConfig, NodeOption, OptionSpec};
use avsctl_core::test_support::{MockCall, MockRuntime};
use avsctl_core::{temp_key, DataDir, InstallRequest, NodeManager, PullRef, UpdateRequest};
use avsctl_core::{CoreError, LocalInstallRequest, PluginRunOptions};
use avsctl_provider::{LogOptions, RuntimeError};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const URL: &str = "https://github.com/acme/mock-avs";

fn write_package_tree(root: &Path) {
    write_package_tree_with_manifest(
        root,
        "name: mock-avs\nplugin:\n  image: acme/plugin:v1\nprofiles:\n  - health-checker\n",
    );
}

fn write_package_tree_with_manifest(root: &Path, manifest: &str) {
    let pkg = root.join("pkg");
    fs::create_dir_all(pkg.join("health-checker")).unwrap();
    fs::write(pkg.join("manifest.yml"), manifest).unwrap();
    fs::write(
        pkg.join("health-checker").join("profile.yml"),
        concat!(
            "options:\n",
            "  - name: main-port\n",
            "    target: MAIN_PORT\n",
            "    type: port\n",
            "    default: 8080\n",
            "monitoring:\n",
            "  targets:\n",
            "    - service: main-service\n",
            "      port: 9090\n",
            "      path: /metrics\n",
            "api:\n",
            "  service: main-service\n",
            "  port: 8080\n",
        ),
    )
    .unwrap();
    fs::write(
        pkg.join("health-checker").join("docker-compose.yml"),
        "services:\n  main-service:\n    image: acme/mock-avs:latest\n",
    )
    .unwrap();
}

fn seed_temp(datadir: &DataDir, url: &str) -> String {
    let key = temp_key(url);
    let root = datadir.init_temp(&key).unwrap();
    write_package_tree(&root);
    key
}

fn defaulted_options() -> Vec<NodeOption> {
    let spec = OptionSpec {
        name: "main-port".to_string(),
        target: "MAIN_PORT".to_string(),
        kind: "port".to_string(),
        help: String::new(),
        default: None,
        validate: None,
    };
    let mut option = NodeOption::from_spec(spec).unwrap();
    option.set("8080").unwrap();
    vec![option]
}

fn install_request(version: &str) -> InstallRequest {
    InstallRequest {
        url: URL.to_string(),
        version: version.to_string(),
        commit: "0".repeat(40),
        profile: "health-checker".to_string(),
        tag: "default".to_string(),
        options: defaulted_options(),
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    manager: NodeManager,
    calls: Arc<Mutex<Vec<MockCall>>>,
    compose_create_result: Arc<Mutex<avsctl_provider::Result<()>>>,
    log_lines: Arc<Mutex<std::collections::HashMap<String, Vec<String>>>>,
}

/// Build a manager over a temp data directory and a mock runtime with
/// one running service
fn harness() -> Harness {
    let runtime = MockRuntime::new();
    runtime.add_service("ct_main", "mock-avs-default-main-service-1", "running", "main-service");

    let calls = runtime.calls.clone();
    let compose_create_result = runtime.compose_create_result.clone();
    let log_lines = runtime.log_lines.clone();

    let tmp = tempfile::tempdir().unwrap();
    let datadir = DataDir::open(tmp.path()).unwrap();
    let manager =
        NodeManager::with_datadir(Some(Box::new(runtime)), GlobalConfig::default(), datadir);

    Harness {
        _tmp: tmp,
        manager,
        calls,
        compose_create_result,
        log_lines,
    }
}

#[tokio::test]
async fn test_install_creates_instance() {
    let h = harness();
    let key = seed_temp(h.manager.datadir(), URL);

    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();
    assert_eq!(id, "mock-avs-default");

    let datadir = h.manager.datadir();
    assert!(datadir.has_instance(&id));
    assert!(datadir.env_path(&id).exists());
    assert!(datadir.compose_path(&id).exists());
    assert!(!datadir.has_temp(&key));

    let state = datadir.instance(&id).unwrap();
    assert_eq!(state.version, "v3.0.3");
    assert_eq!(state.profile, "health-checker");
    assert_eq!(state.api_target.as_ref().unwrap().port, 8080);
    assert_eq!(
        state.plugin.as_ref().unwrap().image.as_deref(),
        Some("acme/plugin:v1")
    );

    let calls = h.calls.lock().unwrap();
    let compose = datadir.compose_path(&id);
    assert!(calls.contains(&MockCall::ComposeCreate {
        path: compose.clone(),
        build: true
    }));
    assert!(calls.contains(&MockCall::ComposeUp { path: compose }));
}

#[tokio::test]
async fn test_install_without_pull_fails() {
    let h = harness();
    let result = h.manager.install(install_request("v3.0.3")).await;
    assert!(matches!(result, Err(CoreError::TempNotFound(_))));
}

#[tokio::test]
async fn test_install_twice_fails() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    h.manager.install(install_request("v3.0.3")).await.unwrap();

    seed_temp(h.manager.datadir(), URL);
    let result = h.manager.install(install_request("v3.0.3")).await;
    assert!(matches!(result, Err(CoreError::InstanceExists(_))));
}

#[tokio::test]
async fn test_failed_install_is_a_noop() {
    let h = harness();
    let key = seed_temp(h.manager.datadir(), URL);

    *h.compose_create_result.lock().unwrap() = Err(RuntimeError::Compose {
        verb: "create".to_string(),
        message: "no space left on device".to_string(),
    });

    let result = h.manager.install(install_request("v3.0.3")).await;
    assert!(result.is_err());

    let datadir = h.manager.datadir();
    assert!(!datadir.has_instance("mock-avs-default"));
    assert!(!datadir.instance_dir("mock-avs-default").exists());
    assert!(!datadir.has_temp(&key));
}

#[tokio::test]
async fn test_install_with_unknown_profile_fails() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);

    let mut request = install_request("v3.0.3");
    request.profile = "does-not-exist".to_string();
    let result = h.manager.install(request).await;
    assert!(matches!(result, Err(CoreError::ProfileNotFound(_))));
}

#[tokio::test]
async fn test_uninstall_tears_everything_down() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();
    let compose = h.manager.datadir().compose_path(&id);

    h.manager.uninstall(&id).await.unwrap();

    assert!(!h.manager.datadir().has_instance(&id));
    assert!(h.calls.lock().unwrap().contains(&MockCall::ComposeDown {
        path: compose,
        volumes: true
    }));
}

#[tokio::test]
async fn test_backup_restore_round_trip() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();

    let datadir = h.manager.datadir();
    let original_state = fs::read(datadir.instance_dir(&id).join("state.json")).unwrap();
    let original_env = fs::read(datadir.env_path(&id)).unwrap();

    let backup_id = h.manager.backup(&id).await.unwrap();

    let backups = h.manager.backup_list().unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].id, backup_id);
    assert_eq!(backups[0].instance_id, id);
    assert_eq!(backups[0].version, "v3.0.3");
    assert!(backups[0].size_bytes > 0);

    // Drift the live instance, then restore over it
    fs::write(datadir.env_path(&id), "MAIN_PORT=9999\n").unwrap();
    let restored = h.manager.restore(&backup_id, false).await.unwrap();
    assert_eq!(restored, id);

    assert_eq!(
        fs::read(datadir.instance_dir(&id).join("state.json")).unwrap(),
        original_state
    );
    assert_eq!(fs::read(datadir.env_path(&id)).unwrap(), original_env);
    assert!(datadir.instance_lock_path(&id).exists());
}

#[tokio::test]
async fn test_update_to_same_version_is_refused() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();

    seed_temp(h.manager.datadir(), URL);
    let result = h
        .manager
        .pull_update(&id, PullRef::Version("v3.0.3".to_string()))
        .await;
    assert!(matches!(
        result,
        Err(CoreError::VersionAlreadyInstalled { .. })
    ));
}

#[tokio::test]
async fn test_pull_update_merges_installed_values() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();

    seed_temp(h.manager.datadir(), URL);
    let result = h
        .manager
        .pull_update(&id, PullRef::Version("v3.0.4".to_string()))
        .await
        .unwrap();

    assert_eq!(result.old_version, "v3.0.3");
    assert_eq!(result.new_version, "v3.0.4");
    assert_eq!(result.merged.options.len(), 1);
    // Installed value carried over from the rendered .env
    assert_eq!(result.merged.options[0].value(), Some("8080"));
    assert!(result.merged.deprecated.is_empty());
}

#[tokio::test]
async fn test_update_with_backup_restores_on_failed_install() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();
    seed_temp(h.manager.datadir(), URL);

    // Uninstall succeeds, the new install fails at compose create
    *h.compose_create_result.lock().unwrap() = Err(RuntimeError::Compose {
        verb: "create".to_string(),
        message: "image build broke".to_string(),
    });

    let result = h
        .manager
        .update(UpdateRequest {
            instance_id: id.clone(),
            reference: PullRef::Version("v3.0.4".to_string()),
            backup: true,
            option_values: Vec::new(),
            run_after: false,
        })
        .await;

    // The original install error surfaces, not a rollback error
    match result {
        Err(CoreError::Runtime(RuntimeError::Compose { verb, .. })) => {
            assert_eq!(verb, "create")
        }
        other => panic!("expected the original compose error, got {:?}", other.err()),
    }

    // The pre-update instance is back
    let state = h.manager.datadir().instance(&id).unwrap();
    assert_eq!(state.version, "v3.0.3");
    assert_eq!(h.manager.backup_list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_without_backup_surfaces_error_without_restore() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();
    seed_temp(h.manager.datadir(), URL);

    *h.compose_create_result.lock().unwrap() = Err(RuntimeError::Compose {
        verb: "create".to_string(),
        message: "boom".to_string(),
    });

    let result = h
        .manager
        .update(UpdateRequest {
            instance_id: id.clone(),
            reference: PullRef::Version("v3.0.4".to_string()),
            backup: false,
            option_values: Vec::new(),
            run_after: false,
        })
        .await;

    assert!(result.is_err());
    // No backup, no restore: the instance is gone
    assert!(!h.manager.datadir().has_instance(&id));
}

#[tokio::test]
async fn test_plugin_runs_on_host_network() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();

    let mut output = Vec::new();
    let exit = h
        .manager
        .run_plugin(
            &id,
            vec!["--port".to_string(), "8081".to_string()],
            PluginRunOptions {
                host_network: true,
                ..Default::default()
            },
            &mut output,
        )
        .await
        .unwrap();
    assert_eq!(exit, 0);

    let calls = h.calls.lock().unwrap();
    assert!(calls.contains(&MockCall::Pull {
        image: "acme/plugin:v1".to_string()
    }));
    assert!(calls.iter().any(|c| matches!(
        c,
        MockCall::Run { image, network, args, .. }
            if image == "acme/plugin:v1"
                && network.as_deref() == Some("host")
                && args == &["--port".to_string(), "8081".to_string()]
    )));
    // The pulled image is removed by default
    assert!(calls.contains(&MockCall::RemoveImage {
        image: "acme/plugin:v1".to_string()
    }));
}

#[tokio::test]
async fn test_plugin_joins_instance_network_by_default() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();

    let mut output = Vec::new();
    let exit = h
        .manager
        .run_plugin(&id, Vec::new(), PluginRunOptions::default(), &mut output)
        .await
        .unwrap();
    assert_eq!(exit, 0);

    let calls = h.calls.lock().unwrap();
    // The network comes from the instance's first running container
    assert!(calls.contains(&MockCall::ContainerNetworks {
        id: "ct_main".to_string()
    }));
    assert!(calls.iter().any(|c| matches!(
        c,
        MockCall::Run { image, network, .. }
            if image == "acme/plugin:v1" && network.as_deref() == Some("mock_network")
    )));
}

#[tokio::test]
async fn test_plugin_requires_running_instance() {
    let runtime = MockRuntime::new();
    // No running services at all
    let tmp = tempfile::tempdir().unwrap();
    let datadir = DataDir::open(tmp.path()).unwrap();
    let manager =
        NodeManager::with_datadir(Some(Box::new(runtime)), GlobalConfig::default(), datadir);

    seed_temp(manager.datadir(), URL);
    // Monitoring is not installed, so the install succeeds even though
    // no service comes up
    let id = manager.install(install_request("v3.0.3")).await.unwrap();

    let mut output = Vec::new();
    let result = manager
        .run_plugin(&id, Vec::new(), PluginRunOptions::default(), &mut output)
        .await;
    assert!(matches!(result, Err(CoreError::InstanceNotRunning(_))));
}

#[tokio::test]
async fn test_node_logs_tail_limits_lines_per_service() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();

    let lines: Vec<String> = (1..=8).map(|i| format!("line {}", i)).collect();
    h.log_lines.lock().unwrap().insert(
        "ct_main".to_string(),
        lines,
    );

    let (_tx, cancel) = watch::channel(false);
    let mut output = Vec::new();
    h.manager
        .node_logs(
            &mut output,
            &id,
            &LogOptions {
                tail: Some("6".to_string()),
                ..Default::default()
            },
            cancel,
        )
        .await
        .unwrap();

    let text = String::from_utf8(output).unwrap();
    let emitted: Vec<&str> = text.lines().collect();
    assert_eq!(emitted.len(), 6);
    assert!(emitted.iter().all(|l| l.starts_with("main-service: ")));
    assert_eq!(emitted[0], "main-service: line 3");
    assert_eq!(emitted[5], "main-service: line 8");
}

#[tokio::test]
async fn test_install_registers_monitoring_targets() {
    let h = harness();
    h.manager.monitoring().install_stack().unwrap();

    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();

    let registered = h.manager.monitoring().registered_targets().unwrap();
    assert_eq!(registered.len(), 1);
    let target = &registered[&id];
    assert_eq!(target.host, "172.18.0.2");
    assert_eq!(target.port, 9090);
    assert_eq!(target.path, "/metrics");
    assert_eq!(target.network, "mock_network");
}

#[tokio::test]
async fn test_uninstall_deregisters_monitoring_targets() {
    let h = harness();
    h.manager.monitoring().install_stack().unwrap();

    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();
    assert_eq!(h.manager.monitoring().registered_targets().unwrap().len(), 1);

    h.manager.uninstall(&id).await.unwrap();
    assert!(h.manager.monitoring().registered_targets().unwrap().is_empty());
}

#[tokio::test]
async fn test_list_instances_reports_running() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();

    let summaries = h.manager.list_instances().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].id, id);
    assert!(summaries[0].running);
    assert_eq!(summaries[0].version, "v3.0.3");
}

#[tokio::test]
async fn test_pull_reuses_materialized_temp_without_force() {
    let h = harness();
    let key = seed_temp(h.manager.datadir(), URL);

    let pulled = h
        .manager
        .pull(URL, PullRef::Version("v3.0.3".to_string()), false)
        .await
        .unwrap();
    assert_eq!(pulled.name, "mock-avs");
    assert_eq!(pulled.version, "v3.0.3");
    assert_eq!(pulled.profiles.len(), 1);
    assert!(pulled.has_plugin);
    // A pull does not consume the temp entry; install does
    assert!(h.manager.datadir().has_temp(&key));
}

#[tokio::test]
async fn test_update_respects_upgrade_matrix() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();

    // The new manifest only allows upgrading to v3.0.4 from v3.0.0
    let key = temp_key(URL);
    let root = h.manager.datadir().init_temp(&key).unwrap();
    write_package_tree_with_manifest(
        &root,
        concat!(
            "name: mock-avs\n",
            "upgrade:\n",
            "  v3.0.4: [\"v3.0.0\"]\n",
            "profiles:\n",
            "  - health-checker\n",
        ),
    );

    let result = h
        .manager
        .pull_update(&id, PullRef::Version("v3.0.4".to_string()))
        .await;
    assert!(matches!(result, Err(CoreError::UpgradeNotSupported { .. })));
}

#[tokio::test]
async fn test_run_reregisters_and_stop_deregisters_targets() {
    let h = harness();
    h.manager.monitoring().install_stack().unwrap();

    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();
    assert_eq!(h.manager.monitoring().registered_targets().unwrap().len(), 1);

    h.manager.stop(&id).await.unwrap();
    assert!(h.manager.monitoring().registered_targets().unwrap().is_empty());
    assert!(h
        .calls
        .lock()
        .unwrap()
        .iter()
        .any(|c| matches!(c, MockCall::ComposeStop { .. })));

    h.manager.run(&id).await.unwrap();
    assert_eq!(h.manager.monitoring().registered_targets().unwrap().len(), 1);
}

#[tokio::test]
async fn test_restore_with_run_after_starts_stack() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();
    let backup_id = h.manager.backup(&id).await.unwrap();

    let ups_before = h
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| matches!(c, MockCall::ComposeUp { .. }))
        .count();

    h.manager.restore(&backup_id, true).await.unwrap();

    let ups_after = h
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| matches!(c, MockCall::ComposeUp { .. }))
        .count();
    assert!(ups_after > ups_before);
    assert!(h.manager.datadir().has_instance(&id));
}

#[tokio::test]
async fn test_restore_unknown_backup_fails() {
    let h = harness();
    let result = h.manager.restore("feedfeedfeedfeed", false).await;
    assert!(matches!(result, Err(CoreError::BackupNotFound(_))));
}

#[tokio::test]
async fn test_backup_of_unknown_instance_fails() {
    let h = harness();
    let result = h.manager.backup("ghost-default").await;
    assert!(matches!(result, Err(CoreError::InstanceNotFound(_))));
}

#[tokio::test]
async fn test_local_install() {
    let h = harness();

    let src = tempfile::tempdir().unwrap();
    write_package_tree(src.path());

    let id = h
        .manager
        .local_install(LocalInstallRequest {
            path: src.path().to_path_buf(),
            name: None,
            profile: "health-checker".to_string(),
            tag: "default".to_string(),
            options: defaulted_options(),
        })
        .await
        .unwrap();
    assert_eq!(id, "mock-avs-default");

    let state = h.manager.datadir().instance(&id).unwrap();
    assert_eq!(state.version, "v0.0.0");
    assert_eq!(state.commit, "0".repeat(40));
    assert!(h.manager.datadir().compose_path(&id).exists());
}

#[tokio::test]
async fn test_update_rejects_unknown_option_override() {
    let h = harness();
    seed_temp(h.manager.datadir(), URL);
    let id = h.manager.install(install_request("v3.0.3")).await.unwrap();
    seed_temp(h.manager.datadir(), URL);

    let result = h
        .manager
        .update(UpdateRequest {
            instance_id: id,
            reference: PullRef::Version("v3.0.4".to_string()),
            backup: false,
            option_values: vec![("no-such-option".to_string(), "1".to_string())],
            run_after: false,
        })
        .await;
    assert!(matches!(result, Err(CoreError::InvalidState(_))));
}

#[tokio::test]
async fn test_disconnected_manager_lists_but_cannot_mutate() {
    let tmp = tempfile::tempdir().unwrap();
    let datadir = DataDir::open(tmp.path()).unwrap();
    let manager = NodeManager::with_datadir(None, GlobalConfig::default(), datadir);

    assert!(!manager.is_connected());
    assert!(manager.list_instances().await.unwrap().is_empty());

    seed_temp(manager.datadir(), URL);
    let result = manager.install(install_request("v3.0.3")).await;
    assert!(matches!(result, Err(CoreError::NotConnected(_))));
}
