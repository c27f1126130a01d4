//! Tests for configuration loading and validation

use std::collections::HashMap;
use std::time::Duration;

use batch_scheduler::config::SchedulerConfig;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn test_defaults_from_lookup() {
    let cfg = SchedulerConfig::from_lookup(lookup(&[("AUTH_KEY", "secret")])).unwrap();
    assert_eq!(cfg.port, 8042);
    assert_eq!(cfg.ram, 8192);
    assert!(cfg.cpu >= 1);
    assert_eq!(cfg.flush_age, Duration::from_secs(24 * 3600));
    assert_eq!(cfg.compose_bin, "docker-compose");
    assert_eq!(cfg.project, "batch");
    assert!(!cfg.recompose);
    assert!(cfg.validators.contains_key("compose"));
    assert_eq!(cfg.validator_dir(), cfg.data_dir.join("validator"));
}

#[test]
fn test_overrides_from_lookup() {
    let cfg = SchedulerConfig::from_lookup(lookup(&[
        ("AUTH_KEY", "secret"),
        ("PORT", "9000"),
        ("DATA_DIR", "/var/lib/batch"),
        ("BATCH_TMP", "/scratch"),
        ("CPU", "3"),
        ("RAM", "512"),
        ("FLUSH_AGE", "1h30m"),
        ("RECOMPOSE", "true"),
    ]))
    .unwrap();
    assert_eq!(cfg.port, 9000);
    assert_eq!(cfg.cpu, 3);
    assert_eq!(cfg.ram, 512);
    assert_eq!(cfg.flush_age, Duration::from_secs(5400));
    assert!(cfg.recompose);
    assert_eq!(cfg.validator_dir().to_str(), Some("/scratch"));
    assert_eq!(cfg.workdir_root().to_str(), Some("/var/lib/batch/wd"));
    assert_eq!(cfg.store_path().to_str(), Some("/var/lib/batch/store/tasks.jsonl"));
}

#[test]
fn test_rejected_values() {
    assert!(SchedulerConfig::from_lookup(lookup(&[])).is_err());
    assert!(SchedulerConfig::from_lookup(lookup(&[("AUTH_KEY", "k"), ("CPU", "0")])).is_err());
    assert!(SchedulerConfig::from_lookup(lookup(&[("AUTH_KEY", "k"), ("PORT", "http")])).is_err());
    assert!(SchedulerConfig::from_lookup(lookup(&[("AUTH_KEY", "k"), ("FLUSH_AGE", "soon")])).is_err());
    assert!(SchedulerConfig::from_lookup(lookup(&[("AUTH_KEY", "k"), ("DATA_DIR", "relative")])).is_err());
}

#[test]
fn test_from_json_str() {
    let cfg = SchedulerConfig::from_json_str(
        r#"{"auth_key":"secret","cpu":2,"ram":4,"flush_age":"10m","validators":{"dummy":{}}}"#,
    )
    .unwrap();
    assert_eq!(cfg.cpu, 2);
    assert_eq!(cfg.flush_age, Duration::from_secs(600));
    assert!(!cfg.validators.contains_key("compose"));

    let err = SchedulerConfig::from_json_str(r#"{"auth_key":"secret","ram":0}"#).unwrap_err();
    assert!(err.contains("ram"));
    let err = SchedulerConfig::from_json_str(
        r#"{"auth_key":"secret","validators":{"compose":{"NoSuchRule":true}}}"#,
    )
    .unwrap_err();
    assert!(err.contains("validators invalid"));
}

#[test]
fn test_ensure_data_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = SchedulerConfig::new("secret");
    cfg.data_dir = dir.path().to_path_buf();
    cfg.ensure_data_dirs().unwrap();
    assert!(cfg.validator_dir().is_dir());
    assert!(cfg.workdir_root().is_dir());
    assert!(cfg.store_path().parent().unwrap().is_dir());
}
