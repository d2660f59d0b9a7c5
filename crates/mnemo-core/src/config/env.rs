use std::str::FromStr;

use super::{Config, EmbeddingProviderKind};

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let v = std::env::var(key).ok()?;
    if let Ok(parsed) = v.trim().parse::<T>() {
        Some(parsed)
    } else {
        tracing::warn!("ignoring invalid {key} value: {v}");
        None
    }
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MNEMO_DATA_DIR") {
            self.memory.data_dir = v.into();
        }
        if let Ok(v) = std::env::var("MNEMO_EMBED_PROVIDER") {
            if let Ok(kind) = serde_json::from_value::<EmbeddingProviderKind>(
                serde_json::Value::String(v.to_lowercase()),
            ) {
                self.embedding.provider = kind;
            } else {
                tracing::warn!("ignoring invalid MNEMO_EMBED_PROVIDER value: {v}");
            }
        }
        if let Ok(v) = std::env::var("MNEMO_EMBED_BASE_URL") {
            self.embedding.base_url = v;
        }
        if let Ok(v) = std::env::var("MNEMO_EMBED_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("MNEMO_EMBED_API_KEY")
            && !v.is_empty()
        {
            self.embedding.api_key = Some(v);
        }
        if let Some(k) = parse_env::<usize>("MNEMO_SEARCH_K") {
            self.search.default_k = k;
        }
        if let Some(limit) = parse_env::<usize>("MNEMO_TAG_LIMIT") {
            self.search.default_tag_limit = limit;
        }
        if let Some(limit) = parse_env::<usize>("MNEMO_HISTORY_LIMIT") {
            self.search.default_history_limit = limit;
        }
    }
}
