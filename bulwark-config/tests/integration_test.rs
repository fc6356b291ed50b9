//! Integration tests for bulwark-config

use bulwark_config::*;
use bulwark_core::{FnCommand, IsolationStrategy};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_file(suffix: &str, content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_toml_file() {
    let file = write_file(
        ".toml",
        r#"
        [defaults]
        pool_capacity = 16
        error_threshold_percent = 25

        [groups.payments]
        pool_capacity = 2
        pool_queue_depth = 0
        run_timeout_ms = 0
        "#,
    );

    let settings = Settings::from_file(file.path()).unwrap();
    let payments = settings.group_config("payments").unwrap();

    assert_eq!(payments.pool_capacity, 2);
    assert_eq!(payments.pool_queue_depth, 0);
    assert_eq!(payments.error_threshold_percent, 25);
    assert!(payments.run_timeout.is_none());
}

#[test]
fn test_load_json_file() {
    let file = write_file(
        ".json",
        r#"{ "groups": { "search": { "isolation": "inline", "sleep_window_ms": 2000 } } }"#,
    );

    let settings = Settings::from_file(file.path()).unwrap();
    let search = settings.group_config("search").unwrap();

    assert_eq!(search.isolation, IsolationStrategy::Inline);
    assert_eq!(search.sleep_window, Duration::from_secs(2));
}

#[test]
fn test_load_env_file() {
    let file = write_file(
        ".env",
        "BULWARK_MIN_REQUEST_VOLUME=5\nBULWARK_GROUP_USERS__WINDOW_BUCKET_COUNT=4\n",
    );

    let settings = Settings::from_file(file.path()).unwrap();
    assert_eq!(settings.defaults.min_request_volume, Some(5));
    assert_eq!(settings.group_config("users").unwrap().window_bucket_count, 4);
}

#[test]
fn test_unsupported_and_missing_files() {
    let file = write_file(".yaml", "pool_capacity: 3");
    assert!(matches!(
        Settings::from_file(file.path()),
        Err(ConfigError::LoadError(_))
    ));

    assert!(Settings::from_file("/nonexistent/bulwark.toml").is_err());
}

#[test]
fn test_invalid_group_reported() {
    let file = write_file(
        ".toml",
        r#"
        [groups.bad]
        error_threshold_percent = 150
        "#,
    );

    let settings = Settings::from_file(file.path()).unwrap();
    let err = settings.validate().unwrap_err();
    assert!(err.to_string().contains("bad"));
}

#[tokio::test]
async fn test_engine_from_settings() {
    let file = write_file(
        ".toml",
        r#"
        [groups.limited]
        pool_capacity = 1
        pool_queue_depth = 0
        "#,
    );

    let engine = Settings::from_file(file.path())
        .unwrap()
        .build_engine()
        .unwrap();

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let blocker = {
        let gate = gate.clone();
        Arc::new(FnCommand::new("limited", move |_: (), _ctx| {
            let gate = gate.clone();
            async move {
                let _permit = gate.acquire().await;
                Ok::<_, bulwark_core::BoxError>(1)
            }
        }))
    };

    let first = engine.submit(blocker.clone(), ());
    let second = engine.submit(blocker, ());

    let err = second.result_async().await.unwrap_err();
    assert!(err.is_rejection());

    gate.add_permits(1);
    assert_eq!(first.result_async().await.unwrap(), 1);
}
