//! Tests for root folder resolution and TOML helpers
//!
//! Tests touching LIBRIS_ROOT_FOLDER are #[serial] to avoid ENV races.

use libris_common::config::{
    load_toml_config, write_toml_config, LoggingConfig, RootFolderInitializer, RootFolderResolver,
    ROOT_FOLDER_ENV,
};
use serde::{Deserialize, Serialize};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct SampleConfig {
    root_folder: Option<PathBuf>,
    #[serde(default)]
    logging: LoggingConfig,
}

#[test]
#[serial]
fn test_cli_argument_wins_over_env() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/libris-env-folder");

    let resolver = RootFolderResolver::new("test-module")
        .with_cli_arg(Some(PathBuf::from("/tmp/libris-cli-folder")));
    assert_eq!(resolver.resolve(), PathBuf::from("/tmp/libris-cli-folder"));

    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_env_var_wins_over_toml() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("libris.toml");
    std::fs::write(&config_path, "root_folder = \"/tmp/libris-toml-folder\"\n").unwrap();

    env::set_var(ROOT_FOLDER_ENV, "/tmp/libris-env-folder");
    let resolver = RootFolderResolver::new("test-module").with_config_file(Some(config_path));
    assert_eq!(resolver.resolve(), PathBuf::from("/tmp/libris-env-folder"));
    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_toml_root_folder_used_without_env() {
    env::remove_var(ROOT_FOLDER_ENV);

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("libris.toml");
    std::fs::write(&config_path, "root_folder = \"/tmp/libris-toml-folder\"\n").unwrap();

    let resolver = RootFolderResolver::new("test-module").with_config_file(Some(config_path));
    assert_eq!(resolver.resolve(), PathBuf::from("/tmp/libris-toml-folder"));
}

#[test]
#[serial]
fn test_missing_config_falls_back_to_default() {
    env::remove_var(ROOT_FOLDER_ENV);

    let resolver = RootFolderResolver::new("test-module")
        .with_config_file(Some(PathBuf::from("/nonexistent/libris.toml")));
    let root = resolver.resolve();
    assert!(!root.as_os_str().is_empty());
}

#[test]
fn test_initializer_creates_directory() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("nested").join("libris");

    let initializer = RootFolderInitializer::new(root.clone());
    initializer.ensure_directory_exists().unwrap();

    assert!(root.is_dir());
    assert_eq!(initializer.database_path(), root.join("libris.db"));
}

#[test]
fn test_toml_write_then_load() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("conf").join("libris.toml");

    let config = SampleConfig {
        root_folder: Some(PathBuf::from("/srv/libris")),
        logging: LoggingConfig {
            level: "debug".to_string(),
            ansi: false,
        },
    };
    write_toml_config(&config, &path).unwrap();

    let loaded: SampleConfig = load_toml_config(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_load_rejects_malformed_toml() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "root_folder = [unterminated").unwrap();

    let result: libris_common::Result<SampleConfig> = load_toml_config(&path);
    assert!(matches!(result, Err(libris_common::Error::Config(_))));
}
