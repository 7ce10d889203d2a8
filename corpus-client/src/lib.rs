//! Reddit corpus access: candidate posts, their comments, and author histories.

use async_trait::async_trait;
use personasim_core::{CandidatePost, CommentRecord, CoreError};

pub mod api;
pub mod auth;
pub mod rate_limiter;


pub use api::RedditApiClient;
pub use auth::{AppToken, RedditCredentials};
pub use rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};

#[async_trait]
pub trait CorpusFetcher: Send + Sync {
    /// Posts from `category` whose NSFW flag equals `nsfw` and, when given, whose flair
    /// matches. `limit` bounds the posts inspected, not the posts returned.
    async fn fetch_candidates(
        &self,
        category: &str,
        flair: Option<&str>,
        nsfw: bool,
        limit: u32,
    ) -> Result<Vec<CandidatePost>, CoreError>;

    /// Top-level comments of a post, deleted authors skipped.
    async fn fetch_comments(
        &self,
        post_id: &str,
        max_comments: usize,
    ) -> Result<Vec<CommentRecord>, CoreError>;

    /// Recent comments written by `author`, blank bodies skipped.
    async fn fetch_author_history(
        &self,
        author: &str,
        limit: usize,
    ) -> Result<Vec<CommentRecord>, CoreError>;
}
