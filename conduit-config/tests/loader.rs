use std::fs;

use conduit_config::{ConfigGuardRailError, ConfigLoader, ConfigSource};
use tempfile::tempdir;

#[test]
fn explicit_toml_file_wins_over_inline_json() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("engine.toml");
    fs::write(
        &path,
        "[pool]\npool_size = 7\n\n[operations]\nkeep_latest_per_resource = true\n",
    )
    .unwrap();

    let load = ConfigLoader::new()
        .with_path(&path)
        .with_inline_json(r#"{"pool":{"pool_size":2}}"#)
        .load()
        .unwrap();

    assert_eq!(load.source, ConfigSource::Path(path));
    assert_eq!(load.config.pool.pool_size, 7);
    assert!(load.config.operations.keep_latest_per_resource);
    assert_eq!(load.config.pool.queue_capacity, 100);
}

#[test]
fn inline_json_is_used_without_a_path() {
    let dir = tempdir().unwrap();
    let load = ConfigLoader::new()
        .with_inline_json(r#"{"cascade":{"tenant_label_key":"org"}}"#)
        .with_search_root(dir.path())
        .load()
        .unwrap();

    assert_eq!(load.source, ConfigSource::EnvInline);
    assert_eq!(load.config.cascade.tenant_label_key, "org");
}

#[test]
fn default_candidates_are_searched_in_order() {
    let dir = tempdir().unwrap();
    fs::create_dir(dir.path().join("config")).unwrap();
    fs::write(
        dir.path().join("config/conduit.json"),
        r#"{"pool":{"pool_size":3}}"#,
    )
    .unwrap();
    fs::write(dir.path().join("conduit.json"), r#"{"pool":{"pool_size":5}}"#).unwrap();

    let load = ConfigLoader::new()
        .with_search_root(dir.path())
        .load()
        .unwrap();

    assert_eq!(load.source, ConfigSource::File(dir.path().join("conduit.json")));
    assert_eq!(load.config.pool.pool_size, 5);
}

#[test]
fn nothing_configured_yields_defaults() {
    let dir = tempdir().unwrap();
    let load = ConfigLoader::new()
        .with_search_root(dir.path())
        .load()
        .unwrap();

    assert_eq!(load.source, ConfigSource::Default);
    assert_eq!(load.config, conduit_config::EngineConfig::default());
    assert!(load.warnings.is_empty());
}

#[test]
fn guard_rail_violation_fails_the_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("engine.json");
    fs::write(&path, r#"{"operations":{"job_timeout_secs":60}}"#).unwrap();

    let err = ConfigLoader::new().with_path(&path).load().unwrap_err();
    let guard_rail = err
        .downcast_ref::<ConfigGuardRailError>()
        .expect("guard rail error in the chain");
    assert!(matches!(
        guard_rail,
        ConfigGuardRailError::IntervalTooShort {
            field: "job_timeout_secs",
            ..
        }
    ));
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempdir().unwrap();
    let err = ConfigLoader::new()
        .with_path(dir.path().join("absent.toml"))
        .load()
        .unwrap_err();
    assert!(err.to_string().contains("failed to read engine config"));
}
