use crate::error::LlmError;

/// Maps text to a fixed-length vector.
///
/// Implementations must be deterministic for a given model version. The
/// vectors they return are not required to be normalized.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single piece of text.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or returns a malformed vector.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, LlmError>> + Send;

    /// Identifier of the embedding model, recorded next to every stored vector.
    fn model(&self) -> &str;

    fn name(&self) -> &str;
}

/// Reject empty vectors and non-finite components.
///
/// # Errors
///
/// Returns [`LlmError::Malformed`] describing the first problem found.
pub fn validate_embedding(provider: &str, vector: &[f32]) -> Result<(), LlmError> {
    if vector.is_empty() {
        return Err(LlmError::Malformed {
            provider: provider.into(),
            reason: "empty vector".into(),
        });
    }
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(LlmError::Malformed {
            provider: provider.into(),
            reason: format!("non-finite component at position {pos}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_finite_vector() {
        assert!(validate_embedding("test", &[0.1, -0.2, 3.0]).is_ok());
    }

    #[test]
    fn validate_rejects_empty() {
        let err = validate_embedding("test", &[]).unwrap_err();
        assert!(err.to_string().contains("empty vector"));
    }

    #[test]
    fn validate_rejects_nan() {
        let err = validate_embedding("test", &[0.0, f32::NAN]).unwrap_err();
        assert!(err.to_string().contains("position 1"));
    }

    #[test]
    fn validate_rejects_infinity() {
        assert!(validate_embedding("test", &[f32::INFINITY]).is_err());
    }
}
