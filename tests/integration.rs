use std::path::Path;

use mnemo_core::bootstrap::open_service;
use mnemo_core::config::{Config, EmbeddingProviderKind};
use mnemo_memory::{AddStatus, IndexStatus, NewRecord};
use serial_test::serial;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("mnemo.toml");
    let data_dir = dir.join("data");
    std::fs::write(
        &path,
        format!(
            r#"
[memory]
data_dir = "{}"

[embedding]
provider = "mock"
model = "mock-embedding"

[search]
default_k = 3
"#,
            data_dir.display()
        ),
    )
    .unwrap();
    path
}

fn clear_env() {
    for key in ["MNEMO_DATA_DIR", "MNEMO_EMBED_PROVIDER", "MNEMO_SEARCH_K"] {
        unsafe { std::env::remove_var(key) };
    }
}

#[tokio::test]
#[serial]
async fn config_file_to_search_roundtrip() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&write_config(dir.path())).unwrap();
    assert_eq!(config.embedding.provider, EmbeddingProviderKind::Mock);

    let service = open_service(&config).await.unwrap();
    assert_eq!(service.index_status(), &IndexStatus::Fresh);

    let added = service
        .add(
            NewRecord::new("c1", "user", "the cat sat on the mat")
                .with_id("m1")
                .with_tags(["pets"]),
            false,
        )
        .await
        .unwrap();
    assert_eq!(added.status, AddStatus::Added);
    service
        .add(
            NewRecord::new("c1", "assistant", "quarterly revenue grew")
                .with_id("m2")
                .with_tags(["finance"]),
            false,
        )
        .await
        .unwrap();

    let hits = service
        .search("cat on the mat", config.search.default_k)
        .await
        .unwrap();
    assert_eq!(hits[0].stable_id, "m1");
    service.close().await.unwrap();

    let service = open_service(&config).await.unwrap();
    assert_eq!(service.index_status(), &IndexStatus::Loaded { entries: 2 });
    let tagged = service.search_by_tag("finance", 10).await.unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].role, "assistant");
    service.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn env_data_dir_overrides_file() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path());
    let override_dir = dir.path().join("elsewhere");

    unsafe { std::env::set_var("MNEMO_DATA_DIR", &override_dir) };
    let config = Config::load(&path).unwrap();
    clear_env();

    let service = open_service(&config).await.unwrap();
    service.close().await.unwrap();
    assert!(override_dir.join("catalogue.db").exists());
    assert!(!dir.path().join("data").exists());
}
