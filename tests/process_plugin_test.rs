//! External-process plugins end to end: scaffold, install, enable, run.
#![cfg(unix)]

mod common;

use serial_test::serial;

use commit_ai::plugin::{
    EnvironmentSnapshot, HookContext, HookPhase, InstallSource, PluginCategory, PluginFactories,
    PluginState, ScaffoldRequest, scaffold_plugin,
};
use commit_ai::{LoadErrorCause, PluginError};

use common::TestHome;

fn scaffold(home: &TestHome, name: &str, category: PluginCategory) -> std::path::PathBuf {
    scaffold_plugin(
        &home.source_dir(),
        &ScaffoldRequest {
            name: name.to_string(),
            category,
            author: Some("Test User".to_string()),
            description: "scaffolded in a test".to_string(),
        },
    )
    .expect("scaffold failed")
}

#[tokio::test]
#[serial]
async fn test_scaffolded_hook_runs_through_dispatch() {
    let home = TestHome::new();
    let manager = home.open(PluginFactories::new(), EnvironmentSnapshot::new());
    let dir = scaffold(&home, "lint-guard", PluginCategory::WorkflowHook);

    manager.install(&InstallSource::Path(dir)).unwrap();
    assert!(home.plugins_dir().join("lint-guard/plugin.sh").is_file());
    manager.validate("lint-guard").unwrap();
    manager.enable("lint-guard").unwrap();

    let context = HookContext {
        files: vec!["src/lib.rs".to_string()],
        ..HookContext::default()
    };
    let report = manager.dispatch(HookPhase::PreCommit, &context).await;
    assert!(report.is_success());
    assert_eq!(report.plugin_ids(), vec!["lint-guard"]);
    assert_eq!(report.outcomes[0].detail, "ok");
}

#[tokio::test]
#[serial]
async fn test_scaffolded_plugins_pass_self_test() {
    let home = TestHome::new();
    let manager = home.open(PluginFactories::new(), EnvironmentSnapshot::new());

    for (name, category) in [
        ("my-provider", PluginCategory::AiProvider),
        ("my-template", PluginCategory::Template),
        ("my-notifier", PluginCategory::Integration),
    ] {
        let dir = scaffold(&home, name, category);
        manager.install(&InstallSource::Path(dir)).unwrap();
        let report = manager.test(name).await.unwrap();
        assert!(report.is_success(), "{}: {:?}", name, report.checks);
    }
}

#[test]
#[serial]
fn test_version_mismatch_blocks_enable() {
    let home = TestHome::new();
    let manager = home.open(PluginFactories::new(), EnvironmentSnapshot::new());
    let dir = scaffold(&home, "drifted", PluginCategory::Template);

    // The manifest claims a version the executable does not report.
    let manifest_path = dir.join("plugin.json");
    let content = std::fs::read_to_string(&manifest_path).unwrap();
    std::fs::write(&manifest_path, content.replace("\"0.1.0\"", "\"0.2.0\"")).unwrap();

    manager.install(&InstallSource::Path(dir)).unwrap();
    manager.validate("drifted").unwrap();
    let err = manager.enable("drifted").unwrap_err();
    assert!(matches!(
        err,
        PluginError::Load(ref e) if e.cause == LoadErrorCause::VersionMismatch
    ));
    assert_eq!(
        manager.show("drifted").unwrap().manifest.state,
        PluginState::Validated
    );
}

#[test]
#[serial]
fn test_missing_executable_is_import_failure() {
    let home = TestHome::new();
    let manager = home.open(PluginFactories::new(), EnvironmentSnapshot::new());
    let dir = scaffold(&home, "no-script", PluginCategory::Integration);
    std::fs::remove_file(dir.join("plugin.sh")).unwrap();

    manager.install(&InstallSource::Path(dir)).unwrap();
    manager.validate("no-script").unwrap();
    let err = manager.enable("no-script").unwrap_err();
    assert!(matches!(
        err,
        PluginError::Load(ref e) if e.cause == LoadErrorCause::ImportFailure
    ));
}
