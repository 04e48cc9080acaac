use std::collections::BTreeMap;
use std::io::Write;

use tickstream_metadata::{ClientConfig, MetadataError, RefreshSettings, SettingsStore};

#[test]
fn test_config_file_with_settings_section() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
name: desk
endpoint:
  host: stream.example.com
sources: [bitget, upbit, binance]
cache:
  initial_timeout_ms: 1500
metrics:
  tick_ms: 100
settings:
  symbolsRefreshInterval: 600000
  orderbookRefreshInterval: 100
"#
    )
    .unwrap();

    let config = ClientConfig::load(file.path()).unwrap();
    assert_eq!(config.sources.len(), 3);
    assert_eq!(config.cache.initial_timeout_ms, 1500);
    assert_eq!(config.cache.symbols_ttl_ms, 300_000);
    assert_eq!(config.metrics.tick_ms, 100);
    assert_eq!(config.settings.symbols_refresh_interval_ms, 600_000);
    assert_eq!(config.settings.orderbook_refresh_interval_ms, 100);
    assert!(config.settings.background_updates);
}

#[test]
fn test_out_of_range_settings_rejected_at_load() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
name: desk
endpoint:
  host: stream.example.com
settings:
  ohlcRefreshInterval: 10
"#
    )
    .unwrap();

    let err = ClientConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, MetadataError::Validation(_)));
}

#[test]
fn test_settings_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SettingsStore::new(dir.path().join("nested").join("settings.yaml"));

    // missing file yields defaults
    assert_eq!(store.load().unwrap(), RefreshSettings::default());

    let settings = RefreshSettings {
        ticker_refresh_interval_ms: 2_000,
        background_updates: false,
        ..RefreshSettings::default()
    };
    store.save(&settings).unwrap();
    assert_eq!(store.load().unwrap(), settings);

    // persisted as flat string pairs
    let raw = std::fs::read_to_string(store.path()).unwrap();
    let pairs: BTreeMap<String, String> = serde_yaml::from_str(&raw).unwrap();
    assert_eq!(pairs["tickerRefreshInterval"], "2000");
    assert_eq!(pairs["backgroundUpdates"], "false");
}

#[test]
fn test_hand_edited_store_is_clamped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(
        &path,
        "tickerRefreshInterval: '500'\norderbookRefreshInterval: '5000'\ntheme: dark\n",
    )
    .unwrap();

    let settings = SettingsStore::new(&path).load().unwrap();
    assert_eq!(settings.ticker_refresh_interval_ms, 1_000);
    assert_eq!(settings.orderbook_refresh_interval_ms, 1_000);
    assert_eq!(settings.ohlc_refresh_interval_ms, RefreshSettings::default().ohlc_refresh_interval_ms);
}

#[test]
fn test_hand_edited_store_accepts_bare_scalars() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(
        &path,
        "tickerRefreshInterval: 2000\nbackgroundUpdates: false\nohlcRefreshInterval: '3000'\nlayout:\n  columns: 3\n",
    )
    .unwrap();

    let settings = SettingsStore::new(&path).load().unwrap();
    assert_eq!(settings.ticker_refresh_interval_ms, 2_000);
    assert!(!settings.background_updates);
    assert_eq!(settings.ohlc_refresh_interval_ms, 3_000);
}

#[test]
fn test_nested_value_for_known_key_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(&path, "tickerRefreshInterval:\n  ms: 2000\n").unwrap();

    let err = SettingsStore::new(&path).load().unwrap_err();
    assert!(matches!(err, MetadataError::Validation(_)));
}
