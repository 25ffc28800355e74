//! Tests for tracker configuration loading.

use super::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_yaml(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(yaml.as_bytes()).expect("write");
    file
}

#[test]
fn test_defaults_validate() {
    let config = TrackerConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.poll_interval(), Duration::from_secs(3));
    assert_eq!(config.milestones, vec![CanonicalStatus::QualityReview]);
    assert!(config.auto_connect);
}

#[test]
fn test_empty_document_is_all_defaults() {
    let config: TrackerConfig = serde_yaml::from_str("{}").unwrap();
    assert_eq!(config, TrackerConfig::default());
}

#[test]
fn test_load_partial_file() {
    let file = write_yaml(
        r#"
status_url: "https://api.example.com/workflows/{id}"
poll_interval_ms: 500
backoff:
  cap_ms: 5000
milestones: [content_creation, quality_review]
auto_connect: false
"#,
    );
    let config = TrackerConfig::load(file.path()).unwrap();

    assert_eq!(config.status_url, "https://api.example.com/workflows/{id}");
    assert_eq!(config.poll_interval_ms, 500);
    assert_eq!(config.backoff.cap_ms, 5_000);
    assert_eq!(config.backoff.base_ms, 1_000);
    assert_eq!(
        config.milestones,
        vec![CanonicalStatus::ContentCreation, CanonicalStatus::QualityReview]
    );
    assert!(!config.auto_connect);
    assert_eq!(config.events_url, TrackerConfig::default().events_url);
}

#[test]
fn test_load_rejects_invalid_values() {
    let zero_interval = write_yaml("poll_interval_ms: 0\n");
    assert!(TrackerConfig::load(zero_interval.path()).is_err());

    let no_placeholder = write_yaml("events_url: \"ws://localhost/ws\"\n");
    let err = TrackerConfig::load(no_placeholder.path()).unwrap_err();
    assert!(err.to_string().contains("events_url"));

    let bad_credit = write_yaml("partial_credit: 1.5\n");
    assert!(TrackerConfig::load(bad_credit.path()).is_err());

    let bad_backoff = write_yaml("backoff:\n  factor: 0.5\n");
    assert!(TrackerConfig::load(bad_backoff.path()).is_err());
}

#[test]
fn test_load_reports_missing_and_malformed_files() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    let err = TrackerConfig::load(&missing).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));

    let garbage = write_yaml("poll_interval_ms: [not, a, number]\n");
    let err = TrackerConfig::load(garbage.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn test_load_or_default_prefers_explicit_path() {
    let file = write_yaml("max_restarts: 9\n");
    let config = TrackerConfig::load_or_default(Some(file.path())).unwrap();
    assert_eq!(config.max_restarts, 9);
}

#[test]
fn test_track_options_builder() {
    let options = TrackOptions::new()
        .poll_interval(Duration::from_millis(250))
        .auto_connect(false);
    assert_eq!(options.poll_interval, Some(Duration::from_millis(250)));
    assert_eq!(options.auto_connect, Some(false));
    assert!(options.on_transition.is_none());
    assert!(format!("{:?}", options).contains("auto_connect"));
}
