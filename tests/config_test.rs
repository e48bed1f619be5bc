use dyntable::config::{AppConfig, ConfigManager, CONFIG_FILE};
use dyntable::refresh::ColumnTyping;
use dyntable::value_range::NumericDetection;
use dyntable::AggregateFunction;
use std::fs;
use tempfile::TempDir;

// Helper to create a temporary config directory for testing
fn setup_test_config_dir() -> (TempDir, ConfigManager) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_manager = ConfigManager::with_dir(temp_dir.path().join("dyntable"));
    (temp_dir, config_manager)
}

#[test]
fn test_default_config() {
    let config = AppConfig::default();

    assert_eq!(config.version, "0.1");

    assert!(!config.display.align_positive_negative);
    assert!(config.display.show_cell_bars);
    assert!(config.display.emit_cross_filters);
    assert_eq!(config.display.page_size, 0);
    assert_eq!(config.display.numeric_detection, NumericDetection::FirstRow);

    assert_eq!(config.transport.host, "localhost:8088");
    assert_eq!(config.transport.endpoint, "api/v1/chart/data");
    assert_eq!(config.transport.timeout_secs, 60);

    assert_eq!(config.query.column_typing, ColumnTyping::Coarse);
    assert_eq!(config.default_aggregate().unwrap(), AggregateFunction::Sum);

    assert_eq!(config.performance.event_poll_interval_ms, 25);
    assert_eq!(config.theme.colors.bar_negative, "#962020");
    assert!(!config.debug.enabled);
}

#[test]
fn test_write_default_config() {
    let (_temp_dir, config_manager) = setup_test_config_dir();

    let config_path = config_manager
        .write_default_config(false)
        .expect("Failed to write config");
    assert!(config_path.exists());
    assert!(config_path.ends_with(CONFIG_FILE));

    let content = fs::read_to_string(&config_path).expect("Failed to read config");
    for section in [
        "[display]",
        "[transport]",
        "[query]",
        "[layout]",
        "[theme.colors]",
        "[debug]",
    ] {
        assert!(content.contains(section), "missing {}", section);
    }

    let loaded = AppConfig::load_with(&config_manager).expect("template should load");
    assert_eq!(loaded, AppConfig::default());
}

#[test]
fn test_write_config_without_force_fails_if_exists() {
    let (_temp_dir, config_manager) = setup_test_config_dir();

    config_manager
        .write_default_config(false)
        .expect("First write should succeed");

    let result = config_manager.write_default_config(false);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("already exists"));

    let forced = config_manager
        .write_default_config(true)
        .expect("Write with force should succeed");
    assert!(forced.exists());
}

#[test]
fn test_missing_file_yields_defaults() {
    let (_temp_dir, config_manager) = setup_test_config_dir();
    let config = AppConfig::load_with(&config_manager).expect("Should load default config");
    assert_eq!(config, AppConfig::default());
}

#[test]
fn test_partial_user_config_keeps_defaults() {
    let (_temp_dir, config_manager) = setup_test_config_dir();
    config_manager
        .ensure_config_dir()
        .expect("Failed to create config dir");

    let user_config = r##"
[display]
align_positive_negative = true
page_size = 20

[transport]
host = "superset.internal:443"
protocol = "https"

[query]
default_aggregate = "Count Distinct"
column_typing = "declared"

[theme.colors]
bar_positive = "#3060a0"
"##;
    fs::write(config_manager.config_path(CONFIG_FILE), user_config)
        .expect("Failed to write user config");

    let config = AppConfig::load_with(&config_manager).expect("Failed to load config");
    assert!(config.display.align_positive_negative);
    assert_eq!(config.display.page_size, 20);
    assert_eq!(config.transport.host, "superset.internal:443");
    assert_eq!(config.transport.protocol, "https");
    assert_eq!(
        config.default_aggregate().unwrap(),
        AggregateFunction::CountDistinct
    );
    assert_eq!(config.query.column_typing, ColumnTyping::Declared);
    assert_eq!(config.theme.colors.bar_positive, "#3060a0");

    // untouched values keep their defaults
    assert!(config.display.show_cell_bars);
    assert_eq!(config.transport.timeout_secs, 60);
    assert_eq!(config.theme.colors.bar_negative, "#962020");

    let settings = config.refresh_settings();
    assert_eq!(settings.page_size, 20);
    assert!(settings.chart_defaults.align_positive_negative);
    assert_eq!(settings.column_typing, ColumnTyping::Declared);
}

#[test]
fn test_invalid_user_config_is_rejected() {
    let (_temp_dir, config_manager) = setup_test_config_dir();
    config_manager
        .ensure_config_dir()
        .expect("Failed to create config dir");

    fs::write(
        config_manager.config_path(CONFIG_FILE),
        "[display]\npage_size = 15\n",
    )
    .expect("Failed to write config");
    let err = AppConfig::load_with(&config_manager).unwrap_err();
    assert!(err.to_string().contains("page_size"));

    fs::write(
        config_manager.config_path(CONFIG_FILE),
        "[query]\ndefault_aggregate = \"MEDIAN\"\n",
    )
    .expect("Failed to write config");
    assert!(AppConfig::load_with(&config_manager).is_err());

    fs::write(config_manager.config_path(CONFIG_FILE), "not = [valid").expect("write");
    let err = AppConfig::load_with(&config_manager).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}
