use async_trait::async_trait;
use corpus_client::CorpusFetcher;
use database::{BackupWriter, NewSubmission, SafePersister, SqliteStore};
use embedding_engine::{HashingEmbedder, Ranker};
use llm_interface::{EngineConfig, GenerationEngine, LlmProvider, Sleeper};
use personasim_core::{
    AppConfig, CandidatePost, CommentRecord, CoreError, LlmError, ScorerSetting, TargetPost,
};
use pipeline::Pipeline;
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct NoopSleeper;

#[async_trait]
impl Sleeper for NoopSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Persona prompts get a persona, everything else gets a comment.
struct FakeModel {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl LlmProvider for FakeModel {
    fn name(&self) -> &str {
        "fake"
    }

    async fn complete(&self, prompt: &str, _want_json: bool) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if prompt.starts_with("Create persona") {
            Ok(r#"```json
{"interests": ["laptops", "saving money"], "personality_traits": ["practical"],
 "likely_demographics": "student on a budget"}
```"#
                .to_string())
        } else {
            Ok(r#"{"author": "budget_builder", "content": "Grab a refurbished ThinkPad."}"#
                .to_string())
        }
    }
}

/// Three candidates; only the closest one has comments.
struct FakeCorpus {
    comment_requests: Mutex<Vec<String>>,
}

fn candidate(id: &str, title: &str, body: &str) -> CandidatePost {
    CandidatePost {
        id: id.to_string(),
        title: title.to_string(),
        body: body.to_string(),
        score: 10,
        flair: None,
        nsfw: false,
        url: format!("https://reddit.com/r/pcmasterrace/comments/{}", id),
        comments: Vec::new(),
        similarity_score: None,
    }
}

#[async_trait]
impl CorpusFetcher for FakeCorpus {
    async fn fetch_candidates(
        &self,
        category: &str,
        _flair: Option<&str>,
        nsfw: bool,
        _limit: u32,
    ) -> Result<Vec<CandidatePost>, CoreError> {
        assert_eq!(category, "pcmasterrace");
        assert!(!nsfw);
        Ok(vec![
            candidate("mouse", "Gaming mouse recommendations", "Need a wireless mouse"),
            candidate(
                "college",
                "Best budget laptop for college?",
                "Looking for something under $600",
            ),
            candidate("battery", "Budget laptop battery life", "Which laptop lasts longest"),
        ])
    }

    async fn fetch_comments(
        &self,
        post_id: &str,
        _max_comments: usize,
    ) -> Result<Vec<CommentRecord>, CoreError> {
        self.comment_requests
            .lock()
            .unwrap()
            .push(post_id.to_string());
        if post_id != "college" {
            return Ok(Vec::new());
        }
        Ok(vec![
            CommentRecord {
                author: "alice".to_string(),
                body: "Refurbished business laptops are the best value".to_string(),
                score: 25,
            },
            CommentRecord {
                author: "bob".to_string(),
                body: "Get more RAM instead of a faster CPU".to_string(),
                score: 12,
            },
        ])
    }

    async fn fetch_author_history(
        &self,
        _author: &str,
        _limit: usize,
    ) -> Result<Vec<CommentRecord>, CoreError> {
        Ok(Vec::new())
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.ranking.scorer = ScorerSetting::Lexical;
    config.ranking.top_k = 3;
    config.persona.num_clusters = 1;
    config.persona.min_source_texts = 2;
    config
}

fn build_pipeline(config: &AppConfig) -> (Pipeline, Arc<FakeCorpus>, Arc<FakeModel>) {
    let corpus = Arc::new(FakeCorpus {
        comment_requests: Mutex::new(Vec::new()),
    });
    let model = Arc::new(FakeModel {
        prompts: Mutex::new(Vec::new()),
    });
    let engine = Arc::new(
        GenerationEngine::new(model.clone(), EngineConfig::from(&config.generation))
            .with_sleeper(Arc::new(NoopSleeper)),
    );
    let ranker = Ranker::from_settings(Arc::new(HashingEmbedder::new(384)), &config.ranking);
    (
        Pipeline::new(config, corpus.clone(), ranker, engine),
        corpus,
        model,
    )
}

fn temp_dir(prefix: &str) -> PathBuf {
    env::temp_dir().join(format!("{}_{}", prefix, uuid::Uuid::new_v4()))
}

fn laptop_target() -> TargetPost {
    TargetPost {
        id: 7,
        title: "Best budget laptop?".to_string(),
        body: "Looking for <$500".to_string(),
        category: "pcmasterrace".to_string(),
        flair: None,
        nsfw: false,
    }
}

#[tokio::test]
async fn test_budget_laptop_run_produces_one_comment() {
    let config = test_config();
    let (pipeline, corpus, model) = build_pipeline(&config);
    let backups = temp_dir("personasim_e2e_backups");
    let pipeline = pipeline.with_persister(SafePersister::backup_only(BackupWriter::new(&backups)));

    let result = pipeline.run_pipeline(&laptop_target()).await;

    assert!(!result.is_aborted());
    // Ranked by keyword overlap with the target.
    assert_eq!(
        *corpus.comment_requests.lock().unwrap(),
        vec!["college", "battery", "mouse"]
    );

    // Two sentences, one cluster, one persona.
    assert_eq!(result.personas.len(), 1);
    let persona = &result.personas[0];
    assert_eq!(persona.persona_id.to_string(), "persona_1");
    assert!(!persona.interests.is_empty());
    assert_eq!(
        persona.source_text,
        "- Refurbished business laptops are the best value\n- Get more RAM instead of a faster CPU"
    );

    assert_eq!(result.comments.len(), 1);
    let comment = &result.comments[0];
    assert_eq!(comment.submission_id, 7);
    assert_eq!(comment.author, "budget_builder");
    assert_eq!(comment.persona_id, Some(persona.persona_id));

    let prompts = model.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("Title: Best budget laptop?"));

    let persistence = result.persistence.as_ref().unwrap();
    assert!(persistence.backup_written);
    assert!(!persistence.remote_written);
    assert_eq!(result.summary().success_rate, 100.0);

    let _ = std::fs::remove_dir_all(backups);
}

#[tokio::test]
async fn test_no_candidates_aborts_run() {
    struct EmptyCorpus;

    #[async_trait]
    impl CorpusFetcher for EmptyCorpus {
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
            unreachable!("no candidates to fetch comments for")
        }

        async fn fetch_author_history(
            &self,
            _author: &str,
            _limit: usize,
        ) -> Result<Vec<CommentRecord>, CoreError> {
            unreachable!("no authors to fetch")
        }
    }

    let config = test_config();
    let model = Arc::new(FakeModel {
        prompts: Mutex::new(Vec::new()),
    });
    let engine = Arc::new(
        GenerationEngine::new(model.clone(), EngineConfig::default())
            .with_sleeper(Arc::new(NoopSleeper)),
    );
    let ranker = Ranker::lexical(Arc::new(HashingEmbedder::new(384)));
    let pipeline = Pipeline::new(&config, Arc::new(EmptyCorpus), ranker, engine);

    let result = pipeline.run_pipeline(&laptop_target()).await;

    assert!(result.is_aborted());
    assert!(result.personas.is_empty());
    assert!(result.comments.is_empty());
    assert!(model.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_run_latest_persists_to_store() {
    let db_path = temp_dir("personasim_e2e").with_extension("db");
    let store = Arc::new(
        SqliteStore::connect(&format!("sqlite://{}", db_path.display()))
            .await
            .unwrap(),
    );
    store.run_migrations().await.unwrap();

    let config = test_config();
    let (pipeline, _corpus, _model) = build_pipeline(&config);
    let backups = temp_dir("personasim_e2e_backups");
    let pipeline = pipeline.with_persister(SafePersister::new(
        BackupWriter::new(&backups),
        store.clone(),
        "comments",
    ));

    let empty = pipeline.run_latest(store.as_ref()).await;
    assert_eq!(empty.abort_reason.as_deref(), Some("no submissions found"));

    let target = store
        .insert_target(&NewSubmission {
            title: "Best budget laptop?".to_string(),
            body: "Looking for <$500".to_string(),
            category: "pcmasterrace".to_string(),
            flair: None,
            nsfw: false,
        })
        .await
        .unwrap();

    let result = pipeline.run_latest(store.as_ref()).await;
    assert_eq!(result.comments.len(), 1);
    assert_eq!(result.comments[0].submission_id, target.id);

    let persistence = result.persistence.unwrap();
    assert!(persistence.backup_written);
    assert!(persistence.remote_written);
    assert_eq!(store.count_rows("comments").await.unwrap(), 1);

    // A second run writes the same author again and hits the unique constraint.
    let rerun = pipeline.run_latest(store.as_ref()).await;
    let failure = rerun.persistence.unwrap().remote_failure.unwrap();
    assert_eq!(failure.kind, personasim_core::RemoteFailureKind::DuplicateKey);
    assert_eq!(store.count_rows("comments").await.unwrap(), 1);

    let _ = std::fs::remove_dir_all(backups);
    let _ = std::fs::remove_file(db_path);
}
