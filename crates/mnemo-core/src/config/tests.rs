use std::io::Write;
use std::path::{Path, PathBuf};

use serial_test::serial;

use super::*;

const ENV_KEYS: [&str; 8] = [
    "MNEMO_DATA_DIR",
    "MNEMO_EMBED_PROVIDER",
    "MNEMO_EMBED_BASE_URL",
    "MNEMO_EMBED_MODEL",
    "MNEMO_EMBED_API_KEY",
    "MNEMO_SEARCH_K",
    "MNEMO_TAG_LIMIT",
    "MNEMO_HISTORY_LIMIT",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

#[test]
fn defaults() {
    let config = Config::default();
    assert_eq!(config.memory.data_dir, PathBuf::from("./data"));
    assert_eq!(config.memory.index_file, "index.mnix");
    assert_eq!(config.memory.catalogue_file, "catalogue.db");
    assert_eq!(config.embedding.provider, EmbeddingProviderKind::Ollama);
    assert_eq!(config.embedding.base_url, "http://localhost:11434");
    assert_eq!(config.embedding.model, "all-minilm");
    assert!(config.embedding.api_key.is_none());
    assert_eq!(config.search.default_k, 5);
    assert_eq!(config.search.default_tag_limit, 20);
    config.validate().unwrap();
}

#[test]
#[serial]
fn missing_file_yields_defaults() {
    clear_env();
    let config = Config::load(Path::new("/nonexistent/mnemo.toml")).unwrap();
    assert_eq!(config.memory.index_file, "index.mnix");
    assert_eq!(config.search.default_k, 5);
}

#[test]
#[serial]
fn partial_file_fills_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mnemo.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(
        f,
        r#"
[memory]
data_dir = "/srv/mnemo"

[embedding]
provider = "compatible"
base_url = "http://embed.local/v1"
model = "text-embedding-3-small"
"#
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.memory.data_dir, PathBuf::from("/srv/mnemo"));
    assert_eq!(config.memory.catalogue_file, "catalogue.db");
    assert_eq!(config.embedding.provider, EmbeddingProviderKind::Compatible);
    assert_eq!(config.embedding.model, "text-embedding-3-small");
    assert_eq!(config.search.default_tag_limit, 20);
}

#[test]
#[serial]
fn malformed_file_is_an_error() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[memory\ndata_dir = 3").unwrap();
    let err = Config::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("failed to parse config file"));
}

#[test]
#[serial]
fn unknown_provider_in_file_is_an_error() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("provider.toml");
    std::fs::write(&path, "[embedding]\nprovider = \"claude\"\n").unwrap();
    assert!(Config::load(&path).is_err());
}

#[test]
#[serial]
fn env_overrides_apply() {
    clear_env();
    let mut config = Config::default();

    unsafe {
        std::env::set_var("MNEMO_DATA_DIR", "/tmp/mnemo-env");
        std::env::set_var("MNEMO_EMBED_PROVIDER", "Compatible");
        std::env::set_var("MNEMO_EMBED_BASE_URL", "http://embed:8080/v1");
        std::env::set_var("MNEMO_EMBED_MODEL", "bge-small");
        std::env::set_var("MNEMO_EMBED_API_KEY", "sk-test");
        std::env::set_var("MNEMO_SEARCH_K", "12");
        std::env::set_var("MNEMO_TAG_LIMIT", "3");
        std::env::set_var("MNEMO_HISTORY_LIMIT", "40");
    }
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.memory.data_dir, PathBuf::from("/tmp/mnemo-env"));
    assert_eq!(config.embedding.provider, EmbeddingProviderKind::Compatible);
    assert_eq!(config.embedding.base_url, "http://embed:8080/v1");
    assert_eq!(config.embedding.model, "bge-small");
    assert_eq!(config.embedding.api_key.as_deref(), Some("sk-test"));
    assert_eq!(config.search.default_k, 12);
    assert_eq!(config.search.default_tag_limit, 3);
    assert_eq!(config.search.default_history_limit, 40);
}

#[test]
#[serial]
fn invalid_env_values_are_ignored() {
    clear_env();
    let mut config = Config::default();

    unsafe {
        std::env::set_var("MNEMO_EMBED_PROVIDER", "claude");
        std::env::set_var("MNEMO_SEARCH_K", "many");
        std::env::set_var("MNEMO_TAG_LIMIT", "-1");
    }
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.embedding.provider, EmbeddingProviderKind::Ollama);
    assert_eq!(config.search.default_k, 5);
    assert_eq!(config.search.default_tag_limit, 20);
}

#[test]
#[serial]
fn env_overrides_file_values() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mnemo.toml");
    std::fs::write(&path, "[search]\ndefault_k = 7\n").unwrap();

    unsafe { std::env::set_var("MNEMO_SEARCH_K", "9") };
    let config = Config::load(&path).unwrap();
    clear_env();

    assert_eq!(config.search.default_k, 9);
}

#[test]
fn validate_rejects_clashing_file_names() {
    let mut config = Config::default();
    config.memory.catalogue_file = config.memory.index_file.clone();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.memory.index_file = "  ".into();
    assert!(config.validate().is_err());
}

#[test]
fn debug_redacts_api_key() {
    let mut config = Config::default();
    config.embedding.api_key = Some("sk-very-secret".into());
    let debug = format!("{config:?}");
    assert!(!debug.contains("sk-very-secret"));
    assert!(debug.contains("[REDACTED]"));
}

#[test]
fn api_key_is_not_serialized() {
    let mut config = Config::default();
    config.embedding.api_key = Some("sk-very-secret".into());
    let toml = toml::to_string(&config).unwrap();
    assert!(!toml.contains("sk-very-secret"));
    assert!(toml.contains("[embedding]"));
}

#[test]
fn memory_options_follow_config() {
    let mut config = Config::default();
    config.memory.data_dir = PathBuf::from("/var/lib/mnemo");
    config.memory.index_file = "vectors.mnix".into();
    let options = config.memory_options();
    assert_eq!(options.index_path(), PathBuf::from("/var/lib/mnemo/vectors.mnix"));
    assert_eq!(
        options.catalogue_path(),
        PathBuf::from("/var/lib/mnemo/catalogue.db")
    );
}
