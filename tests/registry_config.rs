//! Source registry loading: env path override, fallback order, and hot
//! reload through the handle.

use licita_radar::model::SourceName;
use licita_radar::sources::{RegistryHandle, SourceRegistry, ENV_SOURCES_CONFIG_PATH};

const MINIMAL: &str = r#"
[[sources]]
code = "pncp"
display_name = "PNCP"
base_url = "https://pncp.gov.br/api/consulta"
priority = 1
"#;

#[serial_test::serial]
#[test]
fn env_path_takes_precedence() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("sources.toml");
    std::fs::write(&path, MINIMAL).unwrap();

    std::env::set_var(ENV_SOURCES_CONFIG_PATH, path.display().to_string());
    let reg = SourceRegistry::load().unwrap();
    std::env::remove_var(ENV_SOURCES_CONFIG_PATH);

    assert_eq!(reg.all().len(), 1);
    assert!(reg.get(SourceName::Pncp).is_some());
}

#[serial_test::serial]
#[test]
fn env_path_to_missing_file_is_an_error() {
    std::env::set_var(ENV_SOURCES_CONFIG_PATH, "/definitely/not/here.toml");
    let res = SourceRegistry::load();
    std::env::remove_var(ENV_SOURCES_CONFIG_PATH);
    assert!(res.is_err());
}

#[serial_test::serial]
#[test]
fn reload_swaps_the_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("sources.toml");
    std::fs::write(&path, MINIMAL).unwrap();
    std::env::set_var(ENV_SOURCES_CONFIG_PATH, path.display().to_string());

    let handle = RegistryHandle::new(SourceRegistry::default_seed());
    assert_eq!(handle.snapshot().all().len(), 5);

    let n = handle.reload().unwrap();
    assert_eq!(n, 1);
    assert_eq!(handle.snapshot().all().len(), 1);

    // A broken file keeps the previous registry.
    std::fs::write(&path, "not toml at all [").unwrap();
    assert!(handle.reload().is_err());
    assert_eq!(handle.snapshot().all().len(), 1);

    std::env::remove_var(ENV_SOURCES_CONFIG_PATH);
}
