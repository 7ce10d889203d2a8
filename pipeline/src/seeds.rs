//! Persona seeds from ranked candidates, either per author or per text cluster.

use corpus_client::CorpusFetcher;
use embedding_engine::TextClusterer;
use personasim_core::{
    CandidatePost, CorpusSettings, ErrorExt, PersonaSeed, PersonaSettings, SeedMode, SourceKey,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SeedBuilder {
    fetcher: Arc<dyn CorpusFetcher>,
    clusterer: TextClusterer,
    mode: SeedMode,
    num_clusters: usize,
    max_sentences: usize,
    history_limit: usize,
    min_source_texts: usize,
    max_seeds: usize,
}

impl SeedBuilder {
    pub fn new(
        fetcher: Arc<dyn CorpusFetcher>,
        persona: &PersonaSettings,
        corpus: &CorpusSettings,
    ) -> Self {
        Self {
            fetcher,
            clusterer: TextClusterer::default(),
            mode: persona.seed_mode,
            num_clusters: persona.num_clusters,
            max_sentences: persona.max_sentences,
            history_limit: corpus.author_history_limit,
            min_source_texts: persona.min_source_texts,
            max_seeds: persona.max_personas,
        }
    }

    pub fn mode(&self) -> SeedMode {
        self.mode
    }

    pub async fn build(&self, candidates: &[CandidatePost]) -> Vec<PersonaSeed> {
        match self.mode {
            SeedMode::Cluster => self.cluster_seeds(candidates),
            SeedMode::Author => self.author_seeds(candidates).await,
        }
    }

    /// Clusters the first `max_sentences` top-level comment bodies.
    pub fn cluster_seeds(&self, candidates: &[CandidatePost]) -> Vec<PersonaSeed> {
        let sentences = collect_sentences(candidates, self.max_sentences);
        info!("Collected {} sentences for clustering", sentences.len());

        self.clusterer
            .cluster(&sentences, self.num_clusters)
            .into_iter()
            .map(|(id, texts)| PersonaSeed {
                source_texts: texts,
                source_key: SourceKey::Cluster(id),
            })
            .collect()
    }

    /// One seed per distinct top-level author, built from their recent comments.
    /// Stops fetching once enough seeds meet the size threshold to fill the persona cap.
    pub async fn author_seeds(&self, candidates: &[CandidatePost]) -> Vec<PersonaSeed> {
        let mut seen = HashSet::new();
        let mut seeds = Vec::new();
        let mut eligible = 0usize;

        let authors = candidates
            .iter()
            .flat_map(|post| post.comments.iter())
            .map(|comment| comment.author.as_str());

        for author in authors {
            if eligible >= self.max_seeds {
                debug!("Enough author seeds collected, not fetching more histories");
                break;
            }
            if !seen.insert(author) {
                continue;
            }

            match self
                .fetcher
                .fetch_author_history(author, self.history_limit)
                .await
            {
                Ok(history) => {
                    let source_texts: Vec<String> =
                        history.into_iter().map(|comment| comment.body).collect();
                    if source_texts.len() >= self.min_source_texts {
                        eligible += 1;
                    }
                    seeds.push(PersonaSeed {
                        source_texts,
                        source_key: SourceKey::Author(author.to_string()),
                    });
                }
                Err(e) => {
                    warn!("Could not fetch history for {}: {}", author, e);
                    e.log_warn();
                }
            }
        }

        info!(
            "Built {} author seeds ({} with at least {} comments)",
            seeds.len(),
            eligible,
            self.min_source_texts
        );
        seeds
    }
}

pub fn collect_sentences(candidates: &[CandidatePost], max_sentences: usize) -> Vec<String> {
    candidates
        .iter()
        .flat_map(|post| post.comments.iter())
        .map(|comment| comment.body.trim())
        .filter(|body| !body.is_empty())
        .take(max_sentences)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use personasim_core::{CommentRecord, CoreError, CorpusError};
    use std::sync::Mutex;

    struct HistoryFetcher {
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CorpusFetcher for HistoryFetcher {
        async fn fetch_candidates(
            &self,
            _category: &str,
            _flair: Option<&str>,
            _nsfw: bool,
            _limit: u32,
        ) -> Result<Vec<CandidatePost>, CoreError> {
            Ok(Vec::new())
        }

        async fn fetch_comments(
            &self,
            _post_id: &str,
            _max_comments: usize,
        ) -> Result<Vec<CommentRecord>, CoreError> {
            Ok(Vec::new())
        }

        async fn fetch_author_history(
            &self,
            author: &str,
            _limit: usize,
        ) -> Result<Vec<CommentRecord>, CoreError> {
            self.requested.lock().unwrap().push(author.to_string());
            let comment = |body: String| CommentRecord {
                author: author.to_string(),
                body,
                score: 1,
            };
            match author {
                "suspended" => Err(CorpusError::Forbidden {
                    resource: "/user/suspended/comments".to_string(),
                }
                .into()),
                "lurker" => Ok(vec![comment("only one".to_string())]),
                _ => Ok((0..6)
                    .map(|i| comment(format!("{} says {}", author, i)))
                    .collect()),
            }
        }
    }

    fn post_with(authors: &[&str]) -> CandidatePost {
        CandidatePost {
            id: "p".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            score: 1,
            flair: None,
            nsfw: false,
            url: String::new(),
            comments: authors
                .iter()
                .map(|a| CommentRecord {
                    author: a.to_string(),
                    body: format!("{} thinks RAM matters", a),
                    score: 1,
                })
                .collect(),
            similarity_score: Some(0.5),
        }
    }

    fn builder(mode: SeedMode, max_personas: usize) -> (SeedBuilder, Arc<HistoryFetcher>) {
        let fetcher = Arc::new(HistoryFetcher {
            requested: Mutex::new(Vec::new()),
        });
        let persona = PersonaSettings {
            seed_mode: mode,
            max_personas,
            num_clusters: 2,
            ..Default::default()
        };
        (
            SeedBuilder::new(fetcher.clone(), &persona, &CorpusSettings::default()),
            fetcher,
        )
    }

    #[test]
    fn test_collect_sentences_caps_and_skips_blank() {
        let mut post = post_with(&["a", "b", "c"]);
        post.comments[1].body = "  ".to_string();
        let sentences = collect_sentences(&[post.clone(), post], 3);
        assert_eq!(
            sentences,
            vec!["a thinks RAM matters", "c thinks RAM matters", "a thinks RAM matters"]
        );
    }

    #[tokio::test]
    async fn test_cluster_seeds_cover_every_sentence() {
        let (builder, fetcher) = builder(SeedMode::Cluster, 100);
        let seeds = builder.build(&[post_with(&["a", "b", "c"])]).await;

        let total: usize = seeds.iter().map(|s| s.source_texts.len()).sum();
        assert_eq!(total, 3);
        assert!(seeds
            .iter()
            .all(|s| matches!(s.source_key, SourceKey::Cluster(_))));
        assert!(fetcher.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_author_seeds_dedup_and_skip_failures() {
        let (builder, fetcher) = builder(SeedMode::Author, 100);
        let posts = [
            post_with(&["alice", "suspended", "lurker"]),
            post_with(&["alice", "bob"]),
        ];
        let seeds = builder.build(&posts).await;

        let keys: Vec<String> = seeds.iter().map(|s| s.source_key.to_string()).collect();
        assert_eq!(keys, vec!["author:alice", "author:lurker", "author:bob"]);
        assert_eq!(seeds[0].source_texts.len(), 6);
        assert_eq!(seeds[0].source_texts[0], "alice says 0");
        assert_eq!(seeds[1].source_texts, vec!["only one"]);
        assert_eq!(
            *fetcher.requested.lock().unwrap(),
            vec!["alice", "suspended", "lurker", "bob"]
        );
    }

    #[tokio::test]
    async fn test_author_seeds_stop_at_cap() {
        let (builder, fetcher) = builder(SeedMode::Author, 1);
        let seeds = builder.build(&[post_with(&["lurker", "alice", "bob"])]).await;

        assert_eq!(seeds.len(), 2);
        assert_eq!(fetcher.requested.lock().unwrap().len(), 2);
    }
}
