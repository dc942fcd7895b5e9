//! Physical vector collection naming
//!
//! All tenants share one physical collection per vector size. Isolation is a
//! `collection_id` field in each point's payload.

use crate::config::EmbeddingConfig;
use crate::error::{SyncError, SyncResult};

pub const LARGE_DIMENSIONS: usize = 3072;
pub const SMALL_DIMENSIONS: usize = 1536;
pub const MINILM_DIMENSIONS: usize = 384;

/// Payload field carrying the logical collection a point belongs to
pub const TENANT_FIELD: &str = "collection_id";

/// Vector size used when nothing is configured explicitly
pub fn default_vector_size(config: &EmbeddingConfig) -> usize {
    match (config.dimensions, &config.api_key) {
        (Some(dimensions), _) => dimensions,
        (None, Some(_)) => LARGE_DIMENSIONS,
        (None, None) => MINILM_DIMENSIONS,
    }
}

/// Shared physical collection for a vector size
pub fn physical_collection_name(dimensions: usize) -> String {
    match dimensions {
        LARGE_DIMENSIONS => "shared_text_embedding_3_large".to_string(),
        SMALL_DIMENSIONS => "shared_text_embedding_3_small".to_string(),
        MINILM_DIMENSIONS => "shared_minilm_l6_v2".to_string(),
        other => format!("shared_custom_{other}"),
    }
}

/// OpenAI embedding model for a vector size; an explicit override always wins
pub fn openai_model_for_size(dimensions: usize, model_override: Option<&str>) -> SyncResult<String> {
    if let Some(model) = model_override.filter(|m| !m.is_empty()) {
        return Ok(model.to_string());
    }
    match dimensions {
        LARGE_DIMENSIONS => Ok("text-embedding-3-large".to_string()),
        SMALL_DIMENSIONS => Ok("text-embedding-3-small".to_string()),
        other => Err(SyncError::Configuration(format!(
            "no OpenAI embedding model produces {other}-dimensional vectors"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_vector_size_priority() {
        let mut config = EmbeddingConfig::default();
        assert_eq!(default_vector_size(&config), 384);

        config.api_key = Some("sk-test".into());
        assert_eq!(default_vector_size(&config), 3072);

        config.dimensions = Some(768);
        assert_eq!(default_vector_size(&config), 768);
    }

    #[test]
    fn test_physical_names() {
        assert_eq!(physical_collection_name(3072), "shared_text_embedding_3_large");
        assert_eq!(physical_collection_name(1536), "shared_text_embedding_3_small");
        assert_eq!(physical_collection_name(384), "shared_minilm_l6_v2");
        assert_eq!(physical_collection_name(768), "shared_custom_768");
    }

    #[test]
    fn test_model_selection() {
        assert_eq!(openai_model_for_size(3072, None).unwrap(), "text-embedding-3-large");
        assert_eq!(openai_model_for_size(1536, None).unwrap(), "text-embedding-3-small");
        assert_eq!(openai_model_for_size(384, Some("my-model")).unwrap(), "my-model");
        assert!(matches!(
            openai_model_for_size(384, None),
            Err(SyncError::Configuration(_))
        ));
    }
}
