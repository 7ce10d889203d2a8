use crate::embedder::Embedder;
use crate::similarity::{cosine_similarity, jaccard_similarity};
use personasim_core::{
    CandidatePost, CoreError, EmbeddingError, ErrorExt, FallbackSetting, RankingSettings,
    ScorerSetting, TargetPost,
};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerKind {
    Embedding,
    Lexical,
    /// Embedding was requested but failed; Jaccard scores were used instead.
    LexicalFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankerFallback {
    Lexical,
    Fail,
}

impl From<FallbackSetting> for RankerFallback {
    fn from(setting: FallbackSetting) -> Self {
        match setting {
            FallbackSetting::Lexical => RankerFallback::Lexical,
            FallbackSetting::Fail => RankerFallback::Fail,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ranking {
    pub candidates: Vec<CandidatePost>,
    pub scorer: ScorerKind,
}

impl Ranking {
    fn empty(scorer: ScorerKind) -> Self {
        Self {
            candidates: Vec::new(),
            scorer,
        }
    }
}

pub struct Ranker {
    embedder: Arc<dyn Embedder>,
    use_embeddings: bool,
    fallback: RankerFallback,
}

impl Ranker {
    pub fn new(embedder: Arc<dyn Embedder>, fallback: RankerFallback) -> Self {
        Self {
            embedder,
            use_embeddings: true,
            fallback,
        }
    }

    /// Scores with Jaccard token overlap only; the embedder is never called.
    pub fn lexical(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            use_embeddings: false,
            fallback: RankerFallback::Lexical,
        }
    }

    pub fn from_settings(embedder: Arc<dyn Embedder>, settings: &RankingSettings) -> Self {
        match settings.scorer {
            ScorerSetting::Embedding => Self::new(embedder, settings.on_embedding_failure.into()),
            ScorerSetting::Lexical => Self::lexical(embedder),
        }
    }

    /// Returns at most `top_k` candidates ordered by descending similarity to the
    /// target, each carrying its `similarity_score`. Ties keep fetch order.
    pub fn rank(
        &self,
        target: &TargetPost,
        candidates: Vec<CandidatePost>,
        top_k: usize,
    ) -> Result<Ranking, CoreError> {
        let preferred = if self.use_embeddings {
            ScorerKind::Embedding
        } else {
            ScorerKind::Lexical
        };
        if candidates.is_empty() {
            return Ok(Ranking::empty(preferred));
        }

        let target_text = target.comparison_text();
        let candidate_texts: Vec<String> =
            candidates.iter().map(|c| c.comparison_text()).collect();

        let (scores, scorer) = if self.use_embeddings {
            match self.embedding_scores(&target_text, &candidate_texts) {
                Ok(scores) => (scores, ScorerKind::Embedding),
                Err(error) => match self.fallback {
                    RankerFallback::Lexical => {
                        warn!(
                            "Embedding similarity failed ({}), falling back to token overlap",
                            error
                        );
                        error.log_warn();
                        (
                            lexical_scores(&target_text, &candidate_texts),
                            ScorerKind::LexicalFallback,
                        )
                    }
                    RankerFallback::Fail => {
                        return Err(CoreError::RetrievalFailure {
                            reason: error.to_string(),
                        })
                    }
                },
            }
        } else {
            (
                lexical_scores(&target_text, &candidate_texts),
                ScorerKind::Lexical,
            )
        };

        let total = candidates.len();
        let mut scored: Vec<(f32, CandidatePost)> = scores.into_iter().zip(candidates).collect();
        // Stable: equal scores keep fetch order.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        scored.truncate(top_k);

        let ranked: Vec<CandidatePost> = scored
            .into_iter()
            .map(|(score, mut candidate)| {
                candidate.similarity_score = Some(score);
                candidate
            })
            .collect();

        info!(
            "Ranked {} candidates, kept top {} ({:?})",
            total,
            ranked.len(),
            scorer
        );
        if let Some(best) = ranked.first() {
            debug!(
                post_id = %best.id,
                score = best.similarity_score.unwrap_or_default(),
                "Best match"
            );
        }

        Ok(Ranking {
            candidates: ranked,
            scorer,
        })
    }

    fn embedding_scores(
        &self,
        target_text: &str,
        candidate_texts: &[String],
    ) -> Result<Vec<f32>, CoreError> {
        let mut texts = Vec::with_capacity(candidate_texts.len() + 1);
        texts.push(target_text.to_string());
        texts.extend(candidate_texts.iter().cloned());

        let vectors = self.embedder.embed(&texts)?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            }
            .into());
        }

        let expected = self.embedder.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: bad.len(),
            }
            .into());
        }

        let (target_vector, candidate_vectors) = vectors.split_at(1);
        Ok(candidate_vectors
            .iter()
            .map(|v| cosine_similarity(&target_vector[0], v))
            .collect())
    }
}

fn lexical_scores(target_text: &str, candidate_texts: &[String]) -> Vec<f32> {
    candidate_texts
        .iter()
        .map(|text| jaccard_similarity(target_text, text))
        .collect()
}
