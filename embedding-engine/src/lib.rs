//! Text embedding, similarity ranking and clustering.

pub mod cluster;
pub mod embedder;
pub mod ranker;
pub mod similarity;
mod stopwords;

pub use cluster::{cluster, TextClusterer};
pub use embedder::{Embedder, HashingEmbedder, SentenceEmbedder};
pub use ranker::{Ranker, RankerFallback, Ranking, ScorerKind};
pub use similarity::{cosine_similarity, jaccard_similarity};

use personasim_core::{CoreError, FallbackSetting, RankingSettings};
use std::sync::Arc;
use tracing::{info, warn};

/// Builds the embedder named by the ranking settings.
///
/// A configured model directory that fails to load degrades to the hashing embedder
/// unless embedding failures are configured to be fatal.
pub fn embedder_from_settings(settings: &RankingSettings) -> Result<Arc<dyn Embedder>, CoreError> {
    match &settings.model_dir {
        Some(dir) => match SentenceEmbedder::load(dir) {
            Ok(embedder) => Ok(Arc::new(embedder)),
            Err(error) if settings.on_embedding_failure == FallbackSetting::Lexical => {
                warn!(
                    "Could not load sentence model from {}: {}. Using hashing embedder",
                    dir.display(),
                    error
                );
                Ok(Arc::new(HashingEmbedder::new(settings.hashing_dimension)))
            }
            Err(error) => Err(error),
        },
        None => {
            info!(
                "No sentence model configured, using hashing embedder ({} dims)",
                settings.hashing_dimension
            );
            Ok(Arc::new(HashingEmbedder::new(settings.hashing_dimension)))
        }
    }
}
