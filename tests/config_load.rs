//! Integration test: configuration parsing, defaults, and validation.

use std::io::Write;

use toolgate::config::Config;

#[test]
fn empty_document_uses_defaults() {
    let cfg = Config::parse("{}").expect("empty config should parse");
    assert_eq!(cfg.plugins_dir, "plugins/installed");
    assert!(!cfg.validation.strict);
    assert_eq!(cfg.runs.termination_grace_ms, 2000);
    assert_eq!(cfg.async_jobs.max_concurrent_per_run, 10);
    assert_eq!(cfg.async_jobs.retention_secs, 3600);
    assert!(cfg.exec.blocked_commands.is_empty());
}

#[test]
fn full_document_parses() {
    let yaml = r#"
plugins_dir: /opt/toolgate/plugins
validation:
  strict: true
runs:
  termination_grace_ms: 250
async_jobs:
  max_concurrent_per_run: 2
  retention_secs: 60
exec:
  blocked_commands: [curl, wget]
  workdir: /tmp/toolgate-work
"#;
    let cfg = Config::parse(yaml).expect("config should parse");
    assert_eq!(cfg.plugins_dir, "/opt/toolgate/plugins");
    assert!(cfg.validation.strict);
    assert_eq!(cfg.runs.termination_grace_ms, 250);
    assert_eq!(cfg.async_jobs.max_concurrent_per_run, 2);
    assert_eq!(cfg.exec.blocked_commands, vec!["curl", "wget"]);
    assert_eq!(cfg.exec_workdir().to_string_lossy(), "/tmp/toolgate-work");
}

#[test]
fn unknown_fields_are_rejected() {
    let err = Config::parse("plugins_dir: x\nagents: []\n").unwrap_err();
    assert!(format!("{err:#}").contains("agents"), "got: {err:#}");
}

#[test]
fn semantic_checks_reject_bad_values() {
    assert!(Config::parse("runs:\n  termination_grace_ms: 0\n").is_err());
    assert!(Config::parse("async_jobs:\n  max_concurrent_per_run: 0\n").is_err());
    assert!(Config::parse("plugins_dir: '  '\n").is_err());
    assert!(Config::parse("exec:\n  blocked_commands: ['rm -rf']\n").is_err());
}

#[tokio::test]
async fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::load(&dir.path().join("absent.yaml"))
        .await
        .expect("missing config is not an error");
    assert!(cfg.plugins_path().ends_with("plugins/installed"));
    assert!(cfg.plugins_path().is_absolute() || cfg.plugins_path().starts_with("."));
}

#[tokio::test]
async fn load_and_save_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "plugins_dir: /srv/plugins\nvalidation:\n  strict: true").unwrap();

    let cfg = Config::load(&path).await.unwrap();
    assert_eq!(cfg.plugins_dir, "/srv/plugins");
    assert!(cfg.validation.strict);

    let out = dir.path().join("saved.yaml");
    cfg.save(&out).await.unwrap();
    let reloaded = Config::load(&out).await.unwrap();
    assert_eq!(reloaded.plugins_dir, cfg.plugins_dir);
    assert!(reloaded.validation.strict);
}
