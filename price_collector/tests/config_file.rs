use std::io::Write;

use price_collector::config::{ConfigError, DATABASE_URL_ENV, load_config_path};
use serial_test::serial;
use snapshot_ingestor::providers::{ProviderInitError, coingecko::provider::API_KEY_ENV};
use tempfile::NamedTempFile;

fn config_file(body: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().expect("tempfile");
    f.write_all(body.as_bytes()).expect("write config");
    f
}

fn clear_env() {
    // SAFETY: tests touching the environment are serialized
    unsafe {
        std::env::remove_var(DATABASE_URL_ENV);
        std::env::remove_var(API_KEY_ENV);
    }
}

#[test]
#[serial]
fn database_url_env_overrides_the_file() {
    clear_env();
    let f = config_file("database_url = \"from-file.db\"\n");
    assert_eq!(load_config_path(f.path()).unwrap().database_url, "from-file.db");

    unsafe { std::env::set_var(DATABASE_URL_ENV, "sqlite:from-env.db") };
    assert_eq!(load_config_path(f.path()).unwrap().database_url, "sqlite:from-env.db");
    clear_env();
}

#[test]
#[serial]
fn required_api_key_must_be_in_the_environment() {
    clear_env();
    let f = config_file("[upstream]\nrequire_api_key = true\n");
    let cfg = load_config_path(f.path()).unwrap();

    let err = cfg.upstream_config().unwrap_err();
    assert!(matches!(err, ProviderInitError::MissingEnvVar { .. }));

    unsafe { std::env::set_var(API_KEY_ENV, "demo-key") };
    let upstream = cfg.upstream_config().unwrap();
    assert!(upstream.api_key.is_some());
    clear_env();
}

#[test]
#[serial]
fn optional_api_key_is_picked_up_when_present() {
    clear_env();
    let cfg = load_config_path(config_file("").path()).unwrap();
    assert!(cfg.upstream_config().unwrap().api_key.is_none());

    unsafe { std::env::set_var(API_KEY_ENV, "demo-key") };
    assert!(cfg.upstream_config().unwrap().api_key.is_some());
    clear_env();
}

#[test]
fn unreadable_path_is_a_read_error() {
    let err = load_config_path("/definitely/not/here/collector.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}
