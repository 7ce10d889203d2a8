//! The end-to-end run: rank candidates, seed and synthesize personas, generate one
//! comment per persona, then persist.

use corpus_client::CorpusFetcher;
use database::{SafePersister, TargetSource};
use embedding_engine::Ranker;
use llm_interface::GenerationEngine;
use personasim_core::{
    AppConfig, CandidatePost, CoreError, ErrorExt, ErrorReporter, PipelineResult, TargetPost,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod assembler;
pub mod commenter;
pub mod report;
pub mod seeds;
pub mod synthesizer;

#[cfg(test)]
mod testing;

pub use assembler::ResultAssembler;
pub use commenter::CommentGenerator;
pub use report::format_results;
pub use seeds::SeedBuilder;
pub use synthesizer::{PersonaSchema, PersonaSynthesizer};

pub struct Pipeline {
    fetcher: Arc<dyn CorpusFetcher>,
    ranker: Ranker,
    engine: Arc<GenerationEngine>,
    seeds: SeedBuilder,
    synthesizer: PersonaSynthesizer,
    commenter: CommentGenerator,
    persister: Option<SafePersister>,
    post_limit: u32,
    top_k: usize,
    max_comments_per_post: usize,
}

impl Pipeline {
    pub fn new(
        config: &AppConfig,
        fetcher: Arc<dyn CorpusFetcher>,
        ranker: Ranker,
        engine: Arc<GenerationEngine>,
    ) -> Self {
        Self {
            seeds: SeedBuilder::new(fetcher.clone(), &config.persona, &config.corpus),
            synthesizer: PersonaSynthesizer::new(engine.clone(), &config.persona),
            commenter: CommentGenerator::new(engine.clone()),
            fetcher,
            ranker,
            engine,
            persister: None,
            post_limit: config.corpus.post_limit,
            top_k: config.ranking.top_k,
            max_comments_per_post: config.corpus.max_comments_per_post,
        }
    }

    pub fn with_persister(mut self, persister: SafePersister) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Runs against the newest submission of `source`.
    pub async fn run_latest(&self, source: &dyn TargetSource) -> PipelineResult {
        match source.get_latest_target().await {
            Ok(Some(target)) => self.run_pipeline(&target).await,
            Ok(None) => {
                warn!("No submissions found");
                PipelineResult::aborted("no submissions found")
            }
            Err(e) => {
                e.log_error();
                PipelineResult::aborted(format!("could not load the latest submission: {}", e))
            }
        }
    }

    /// Always returns a result. Only a missing candidate pool aborts the run; every
    /// other failure drops the affected persona or comment and carries on.
    pub async fn run_pipeline(&self, target: &TargetPost) -> PipelineResult {
        info!(
            submission_id = target.id,
            category = %target.category,
            flair = ?target.flair,
            nsfw = target.nsfw,
            "Starting run for '{}'",
            target.title
        );

        let candidates = match self.similar_posts(target).await {
            Ok(candidates) => candidates,
            Err(reason) => return PipelineResult::aborted(reason),
        };

        debug!("Building persona seeds in {:?} mode", self.seeds.mode());
        let seeds = self.seeds.build(&candidates).await;
        if seeds.is_empty() {
            warn!("No persona seeds could be built from {} posts", candidates.len());
        }

        let mut assembler = ResultAssembler::new(target.id);
        let personas = self
            .synthesizer
            .synthesize_all(seeds, assembler.sequence_mut())
            .await;
        for persona in personas {
            if let Err(e) = assembler.add_persona(persona) {
                e.log_warn();
            }
        }

        if assembler.personas().is_empty() {
            info!("No personas generated");
            return assembler.finish();
        }

        let personas = assembler.personas().to_vec();
        info!(
            "Generating comments for {} personas (approximately {:.1} minutes)",
            personas.len(),
            self.engine
                .config()
                .estimated_duration(personas.len())
                .as_secs_f64()
                / 60.0
        );

        for (index, persona) in personas.iter().enumerate() {
            debug!(
                "Processing persona {}/{}: {}",
                index + 1,
                personas.len(),
                persona.persona_id
            );
            if let Some(comment) = self.commenter.generate(persona, target).await {
                if let Err(e) = assembler.add_comment(comment) {
                    e.log_warn();
                }
            } else {
                warn!("Skipped persona {}", persona.persona_id);
            }
        }

        let mut result = assembler.finish();
        let summary = result.summary();
        info!(
            "Generated {} out of {} comments ({:.1}%)",
            summary.total_comments, summary.total_personas, summary.success_rate
        );

        if let Some(persister) = &self.persister {
            let outcome = persister
                .persist(target.id, &result.personas, &result.comments)
                .await;
            if let Some(failure) = &outcome.remote_failure {
                ErrorReporter::new().report_warning(&CoreError::PersistenceFailure {
                    kind: failure.kind,
                    message: failure.message.clone(),
                });
            }
            result.persistence = Some(outcome);
        }

        let metrics = self.engine.metrics();
        debug!(
            provider = self.engine.provider_name(),
            calls = metrics.calls,
            successes = metrics.successes,
            exhaustions = metrics.exhaustions,
            quota_hits = metrics.quota_hits,
            "Generation engine totals"
        );
        result
    }

    /// Fetches, ranks and attaches top-level comments. `Err` carries the abort reason.
    async fn similar_posts(&self, target: &TargetPost) -> Result<Vec<CandidatePost>, String> {
        let fetched = match self
            .fetcher
            .fetch_candidates(
                &target.category,
                target.flair.as_deref(),
                target.nsfw,
                self.post_limit,
            )
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                e.log_error();
                return Err(format!("could not fetch candidate posts: {}", e));
            }
        };
        info!("Found {} matching posts", fetched.len());
        if fetched.is_empty() {
            return Err(format!("no matching posts found in {}", target.category));
        }

        let ranking = self
            .ranker
            .rank(target, fetched, self.top_k)
            .map_err(|e| {
                e.log_error();
                format!("could not rank candidate posts: {}", e)
            })?;
        info!(
            "Top {} similar posts ranked with {:?} scorer",
            ranking.candidates.len(),
            ranking.scorer
        );

        let mut candidates = ranking.candidates;
        for (rank, post) in candidates.iter_mut().enumerate() {
            debug!(
                "{}. {} (similarity {:.3}, score {})",
                rank + 1,
                post.title,
                post.similarity_score.unwrap_or_default(),
                post.score
            );
            match self
                .fetcher
                .fetch_comments(&post.id, self.max_comments_per_post)
                .await
            {
                Ok(comments) => post.comments = comments,
                Err(e) => {
                    warn!("Could not fetch comments for {}: {}", post.id, e);
                    e.log_warn();
                }
            }
        }
        Ok(candidates)
    }
}
