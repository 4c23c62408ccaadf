use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use qaflow::cli::{Cli, QaflowConfig, base_settings, parse_vars};
use qaflow::engine::IntentPolicy;
use qaflow::governor::GovernorLimits;
use tempfile::NamedTempFile;

fn load_str(yaml: &str) -> anyhow::Result<QaflowConfig> {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();
    QaflowConfig::load(Some(f.path()))
}

#[test]
fn load_valid_config_all_fields() {
    let yaml = r#"
host: "127.0.0.1"
port: 8080
data_dir: "custom/runs"
flows_dir: "my_flows"
max_body: 2097152
max_concurrent_runs: 8
max_runs_per_key: 3
page_parallelism: 4
intent_policy: auto_smoke
retention_days: 30
sweep_interval_s: 600
production_envs: [live]
test_account_marker: qa
"#;

    let cfg = load_str(yaml).unwrap();

    assert_eq!(cfg.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(cfg.port, Some(8080));
    assert_eq!(cfg.data_dir.as_deref(), Some("custom/runs"));
    assert_eq!(cfg.flows_dir.as_deref(), Some("my_flows"));
    assert_eq!(cfg.max_body, Some(2097152));
    assert_eq!(cfg.max_concurrent_runs, Some(8));
    assert_eq!(cfg.max_runs_per_key, Some(3));
    assert_eq!(cfg.page_parallelism, Some(4));
    assert_eq!(cfg.intent_policy.as_deref(), Some("auto_smoke"));
    assert_eq!(cfg.retention_days, Some(30));
    assert_eq!(cfg.sweep_interval_s, Some(600));
    assert_eq!(cfg.production_envs, Some(vec!["live".to_string()]));
    assert_eq!(cfg.test_account_marker.as_deref(), Some("qa"));
    assert!(cfg.backend.is_none());
    assert!(cfg.browser.is_none());
}

#[test]
fn load_partial_config() {
    let cfg = load_str("port: 9090\n").unwrap();

    assert_eq!(cfg.port, Some(9090));
    assert!(cfg.host.is_none());
    assert!(cfg.data_dir.is_none());
    assert!(cfg.flows_dir.is_none());
    assert!(cfg.max_concurrent_runs.is_none());
    assert!(cfg.intent_policy.is_none());
}

#[test]
fn nested_backend_and_browser_sections() {
    let yaml = r#"
backend:
  api_url: https://jobs.internal
  namespace: qa
  timeout_s: 600
browser:
  endpoint: http://browser:9323
  timeout_s: 12.5
"#;

    let cfg = load_str(yaml).unwrap();

    let backend = cfg.backend.unwrap();
    assert_eq!(backend.api_url.as_deref(), Some("https://jobs.internal"));
    assert_eq!(backend.namespace, "qa");
    assert_eq!(backend.timeout_s, 600);
    // Unset keys keep their defaults.
    assert_eq!(backend.poll_interval_s, 5);
    assert_eq!(backend.image, "qaflow-runner:latest");

    let browser = cfg.browser.unwrap();
    assert_eq!(browser.endpoint.as_deref(), Some("http://browser:9323"));
    assert_eq!(browser.timeout_s, Some(12.5));
    assert!(browser.script.is_none());
}

#[test]
fn missing_explicit_path_returns_error() {
    let result = QaflowConfig::load(Some(std::path::Path::new("/nonexistent/qaflow.yaml")));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Config file not found")
    );
}

#[test]
fn default_config_is_empty() {
    let cfg = QaflowConfig::default();
    assert!(cfg.host.is_none());
    assert!(cfg.port.is_none());
    assert!(cfg.data_dir.is_none());
    assert!(cfg.backend.is_none());
}

#[test]
fn invalid_yaml_returns_error() {
    let result = load_str("port: [this is not valid yaml for a u16");
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file")
    );
}

#[test]
fn unknown_keys_are_ignored() {
    let yaml = r#"
port: 4000
unknown_setting: true
another_random_key: "hello"
"#;
    let cfg = load_str(yaml).unwrap();
    assert_eq!(cfg.port, Some(4000));
}

// ===== Settings precedence =====

#[test]
fn flags_win_over_config_values() {
    let cfg = load_str(
        r#"
data_dir: from-config
max_concurrent_runs: 7
max_runs_per_key: 2
page_parallelism: 0
intent_policy: stop_after_discovery
retention_days: 3
production_envs: [live]
"#,
    )
    .unwrap();
    let cli = Cli::parse_from(["qaflow", "--data-dir", "from-flag", "stats"]);

    let settings = base_settings(&cli, &cfg).unwrap();
    assert_eq!(settings.data_dir, PathBuf::from("from-flag"));
    assert_eq!(settings.limits, GovernorLimits::new(7, 2));
    assert_eq!(settings.page_parallelism, 1);
    assert_eq!(settings.intent_policy, IntentPolicy::StopAfterDiscovery);
    assert_eq!(settings.retention_days, 3);
    assert_eq!(settings.guards.production_envs, vec!["live".to_string()]);
}

#[test]
fn driver_wait_comes_from_config() {
    let cli = Cli::parse_from(["qaflow", "stats"]);
    let defaults = base_settings(&cli, &QaflowConfig::default()).unwrap();
    assert_eq!(defaults.driver_wait, std::time::Duration::from_secs(30));

    let cfg = load_str("driver_wait_s: 5\n").unwrap();
    let settings = base_settings(&cli, &cfg).unwrap();
    assert_eq!(settings.driver_wait, std::time::Duration::from_secs(5));
}

#[test]
fn bad_intent_policy_is_rejected() {
    let cfg = load_str("intent_policy: yolo\n").unwrap();
    let cli = Cli::parse_from(["qaflow", "stats"]);
    let err = base_settings(&cli, &cfg).unwrap_err();
    assert!(format!("{:#}", err).contains("intent_policy"));
}

// ===== Flow variables =====

#[test]
fn parse_vars_splits_on_first_equals() {
    let vars = parse_vars(&[
        "base_url=https://app.test/?a=b".to_string(),
        " user =qa-test".to_string(),
        "empty=".to_string(),
    ])
    .unwrap();
    assert_eq!(vars["base_url"], "https://app.test/?a=b");
    assert_eq!(vars["user"], "qa-test");
    assert_eq!(vars["empty"], "");
}

#[test]
fn parse_vars_rejects_malformed_pairs() {
    assert!(parse_vars(&["novalue".to_string()]).is_err());
    assert!(parse_vars(&["=value".to_string()]).is_err());
}
