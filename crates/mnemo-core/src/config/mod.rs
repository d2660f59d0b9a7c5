mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::Path;

use anyhow::Context;

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject settings no store could be opened with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.memory.index_file.trim().is_empty() {
            anyhow::bail!("memory.index_file must not be empty");
        }
        if self.memory.catalogue_file.trim().is_empty() {
            anyhow::bail!("memory.catalogue_file must not be empty");
        }
        if self.memory.index_file == self.memory.catalogue_file {
            anyhow::bail!("memory.index_file and memory.catalogue_file must differ");
        }
        if self.embedding.model.trim().is_empty() {
            anyhow::bail!("embedding.model must not be empty");
        }
        Ok(())
    }

    /// Options for [`mnemo_memory::MemoryService::open`].
    #[must_use]
    pub fn memory_options(&self) -> mnemo_memory::MemoryOptions {
        mnemo_memory::MemoryOptions {
            data_dir: self.memory.data_dir.clone(),
            index_file: self.memory.index_file.clone(),
            catalogue_file: self.memory.catalogue_file.clone(),
        }
    }
}
