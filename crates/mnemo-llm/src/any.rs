use crate::compatible::CompatibleEmbedder;
use crate::error::LlmError;
#[cfg(feature = "mock")]
use crate::mock::MockEmbedder;
use crate::ollama::OllamaEmbedder;
use crate::provider::EmbeddingProvider;

macro_rules! delegate_embedder {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyEmbedder::Ollama($p) => $expr,
            AnyEmbedder::Compatible($p) => $expr,
            #[cfg(feature = "mock")]
            AnyEmbedder::Mock($p) => $expr,
        }
    };
}

/// Runtime-selected embedding backend.
#[derive(Debug, Clone)]
pub enum AnyEmbedder {
    Ollama(OllamaEmbedder),
    Compatible(CompatibleEmbedder),
    #[cfg(feature = "mock")]
    Mock(MockEmbedder),
}

impl EmbeddingProvider for AnyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        delegate_embedder!(self, |p| p.embed(text).await)
    }

    fn model(&self) -> &str {
        delegate_embedder!(self, |p| p.model())
    }

    fn name(&self) -> &str {
        delegate_embedder!(self, |p| p.name())
    }
}
