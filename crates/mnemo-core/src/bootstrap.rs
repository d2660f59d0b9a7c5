//! Application bootstrap: config resolution, embedder and memory construction.

use std::path::{Path, PathBuf};

use anyhow::Context;
use mnemo_llm::any::AnyEmbedder;
use mnemo_llm::compatible::CompatibleEmbedder;
use mnemo_llm::ollama::OllamaEmbedder;
use mnemo_memory::MemoryService;

use crate::config::{Config, EmbeddingProviderKind};

const DEFAULT_CONFIG_PATH: &str = "mnemo.toml";

/// Priority: CLI `--config` > `MNEMO_CONFIG` env > `mnemo.toml`.
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("MNEMO_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

/// Build the embedding backend selected by `config.embedding.provider`.
///
/// # Errors
///
/// Returns an error if the selected backend is not compiled in.
pub fn create_embedder(config: &Config) -> anyhow::Result<AnyEmbedder> {
    let embedding = &config.embedding;
    match embedding.provider {
        EmbeddingProviderKind::Ollama => Ok(AnyEmbedder::Ollama(OllamaEmbedder::new(
            &embedding.base_url,
            embedding.model.clone(),
        ))),
        EmbeddingProviderKind::Compatible => {
            if embedding.api_key.is_none() {
                tracing::debug!("compatible embedder configured without an API key");
            }
            Ok(AnyEmbedder::Compatible(CompatibleEmbedder::new(
                &embedding.base_url,
                embedding.api_key.clone(),
                embedding.model.clone(),
            )))
        }
        #[cfg(feature = "mock")]
        EmbeddingProviderKind::Mock => Ok(AnyEmbedder::Mock(
            mnemo_llm::mock::MockEmbedder::default(),
        )),
        #[cfg(not(feature = "mock"))]
        EmbeddingProviderKind::Mock => {
            anyhow::bail!("embedding provider `mock` requires the `mock` feature")
        }
    }
}

/// Validate `config`, build its embedder and open the memory store.
///
/// # Errors
///
/// Returns an error if the config is invalid, the embedder cannot be built,
/// or the store under `memory.data_dir` cannot be opened.
pub async fn open_service(config: &Config) -> anyhow::Result<MemoryService<AnyEmbedder>> {
    config.validate()?;
    let embedder = create_embedder(config)?;
    tracing::debug!(
        provider = %config.embedding.provider,
        model = %config.embedding.model,
        "embedding provider selected"
    );
    MemoryService::open(config.memory_options(), embedder)
        .await
        .with_context(|| {
            format!(
                "failed to open memory store in {}",
                config.memory.data_dir.display()
            )
        })
}
