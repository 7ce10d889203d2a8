use crate::auth::{oauth_client, request_app_token, AppToken, RedditCredentials};
use crate::rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
use crate::CorpusFetcher;
use async_trait::async_trait;
use oauth2::basic::BasicClient;
use personasim_core::{CandidatePost, CommentRecord, CoreError, CorpusError, CorpusSettings};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const REDDIT_API_BASE: &str = "https://oauth.reddit.com";
const MAX_PAGE_SIZE: u32 = 100;
const DELETED_AUTHOR: &str = "[deleted]";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListing<T> {
    pub kind: String,
    pub data: RedditListingData<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListingData<T> {
    pub children: Vec<RedditListingChild<T>>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditListingChild<T> {
    pub kind: String,
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditPostData {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub over_18: bool,
    #[serde(default)]
    pub link_flair_text: Option<String>,
}

/// Comment payload. `more` placeholders share the listing but carry none of these fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedditCommentData {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub score: i64,
}

pub struct RedditApiClient {
    http_client: Client,
    oauth: BasicClient,
    credentials: RedditCredentials,
    token: Mutex<Option<AppToken>>,
    rate_limiter: Arc<RateLimiter>,
    history_keep: usize,
}

impl RedditApiClient {
    pub fn new(credentials: RedditCredentials, settings: &CorpusSettings) -> Result<Self, CoreError> {
        let http_client = Client::builder()
            .user_agent(&credentials.user_agent)
            .timeout(Duration::from_secs(30))
            .build()?;
        let oauth = oauth_client(&credentials)?;

        Ok(Self {
            http_client,
            oauth,
            credentials,
            token: Mutex::new(None),
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig::reddit_oauth())),
            history_keep: settings.author_history_keep,
        })
    }

    pub fn from_env(settings: &CorpusSettings) -> Result<Self, CoreError> {
        Self::new(RedditCredentials::from_env(settings)?, settings)
    }

    pub async fn get_rate_limit_status(&self) -> RateLimitStatus {
        self.rate_limiter.get_rate_limit_status().await
    }

    async fn access_token(&self) -> Result<String, CoreError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| !t.needs_refresh()) {
            return Ok(token.access_token.clone());
        }
        let token =
            request_app_token(&self.oauth, &self.http_client, &self.credentials.user_agent).await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    pub async fn make_request(
        &self,
        method: Method,
        endpoint: &str,
        access_token: &str,
        query_params: &[(&str, String)],
    ) -> Result<Response, CoreError> {
        let url = format!("{}{}", REDDIT_API_BASE, endpoint);

        let permit = self.rate_limiter.acquire_permit().await;
        debug!(
            "Acquired rate limit permit for {} {} after {:?}",
            method, endpoint, permit.queue_wait_time
        );

        let request_builder = self
            .http_client
            .request(method.clone(), &url)
            .bearer_auth(access_token)
            .query(query_params);

        debug!("Making Reddit API request: {} {}", method, endpoint);
        let response = match request_builder.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Network error for {} {}: {}", method, endpoint, e);
                if e.is_timeout() {
                    return Err(CorpusError::RequestTimeout.into());
                }
                return Err(CoreError::Network(e));
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        warn!("Request failed with status: {} for {}", status, endpoint);
        if status.as_u16() == 429 {
            self.rate_limiter.record_rate_limited().await;
        }
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        Err(classify_status(status.as_u16(), endpoint, retry_after).into())
    }

    /// GETs and decodes `endpoint`, refreshing the token once on a 401.
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query_params: &[(&str, String)],
    ) -> Result<T, CoreError> {
        let token = self.access_token().await?;
        let response = match self
            .make_request(Method::GET, endpoint, &token, query_params)
            .await
        {
            Err(CoreError::Corpus(CorpusError::InvalidToken)) => {
                warn!("Reddit token rejected, refreshing");
                self.invalidate_token().await;
                let token = self.access_token().await?;
                self.make_request(Method::GET, endpoint, &token, query_params)
                    .await?
            }
            other => other?,
        };

        response.json::<T>().await.map_err(|e| {
            error!("Failed to parse response from {}: {}", endpoint, e);
            CoreError::from(CorpusError::InvalidResponse {
                details: format!("Failed to parse {}: {}", endpoint, e),
            })
        })
    }

    pub async fn get_subreddit_posts(
        &self,
        subreddit: &str,
        limit: u32,
        after: Option<&str>,
    ) -> Result<RedditListing<RedditPostData>, CoreError> {
        let endpoint = format!("/r/{}/hot", subreddit);
        let mut params = vec![("limit", limit.to_string()), ("raw_json", "1".to_string())];
        if let Some(after) = after {
            params.push(("after", after.to_string()));
        }
        self.get_json(&endpoint, &params).await
    }
}

#[async_trait]
impl CorpusFetcher for RedditApiClient {
    async fn fetch_candidates(
        &self,
        category: &str,
        flair: Option<&str>,
        nsfw: bool,
        limit: u32,
    ) -> Result<Vec<CandidatePost>, CoreError> {
        let subreddit = normalize_category(category);
        if subreddit.is_empty() {
            return Err(CorpusError::CategoryNotFound {
                category: category.to_string(),
            }
            .into());
        }

        let mut raw = Vec::new();
        let mut after: Option<String> = None;
        while (raw.len() as u32) < limit {
            let page_size = (limit - raw.len() as u32).min(MAX_PAGE_SIZE);
            let listing = self
                .get_subreddit_posts(subreddit, page_size, after.as_deref())
                .await?;
            let page_len = listing.data.children.len();
            raw.extend(listing.data.children.into_iter().map(|child| child.data));
            after = listing.data.after;
            if page_len == 0 || after.is_none() {
                break;
            }
        }
        raw.truncate(limit as usize);

        let fetched = raw.len();
        let candidates = filter_posts(raw, flair, nsfw);
        info!(
            "Fetched {} posts from r/{}, {} match nsfw={} flair={:?}",
            fetched,
            subreddit,
            candidates.len(),
            nsfw,
            flair
        );
        Ok(candidates)
    }

    async fn fetch_comments(
        &self,
        post_id: &str,
        max_comments: usize,
    ) -> Result<Vec<CommentRecord>, CoreError> {
        let endpoint = format!("/comments/{}", post_id);
        let params = [
            ("sort", "top".to_string()),
            ("depth", "1".to_string()),
            ("limit", max_comments.to_string()),
            ("raw_json", "1".to_string()),
        ];
        let thread: Vec<RedditListing<serde_json::Value>> = self.get_json(&endpoint, &params).await?;
        let comments = top_level_comments(thread, max_comments)?;
        debug!("Fetched {} comments for post {}", comments.len(), post_id);
        Ok(comments)
    }

    async fn fetch_author_history(
        &self,
        author: &str,
        limit: usize,
    ) -> Result<Vec<CommentRecord>, CoreError> {
        let endpoint = format!("/user/{}/comments", author);
        let params = [
            ("sort", "hot".to_string()),
            ("limit", limit.min(MAX_PAGE_SIZE as usize).to_string()),
            ("raw_json", "1".to_string()),
        ];
        let listing: RedditListing<RedditCommentData> = self.get_json(&endpoint, &params).await?;
        let history = history_comments(author, listing, self.history_keep);
        debug!("Fetched {} history comments for {}", history.len(), author);
        Ok(history)
    }
}

/// Strips a leading `r/` or `/r/` from a subreddit name.
pub fn normalize_category(category: &str) -> &str {
    let trimmed = category.trim();
    trimmed
        .strip_prefix("/r/")
        .or_else(|| trimmed.strip_prefix("r/"))
        .unwrap_or(trimmed)
}

/// Keeps posts whose NSFW flag equals `nsfw` and, when given, whose flair matches.
pub fn filter_posts(posts: Vec<RedditPostData>, flair: Option<&str>, nsfw: bool) -> Vec<CandidatePost> {
    posts
        .into_iter()
        .filter(|post| post.over_18 == nsfw)
        .filter(|post| match flair {
            Some(wanted) => post.link_flair_text.as_deref() == Some(wanted),
            None => true,
        })
        .map(CandidatePost::from)
        .collect()
}

/// Extracts up to `max_comments` top-level comments from a `/comments/{id}` response.
pub fn top_level_comments(
    thread: Vec<RedditListing<serde_json::Value>>,
    max_comments: usize,
) -> Result<Vec<CommentRecord>, CoreError> {
    let Some(comment_listing) = thread.into_iter().nth(1) else {
        return Err(CorpusError::InvalidResponse {
            details: "comment thread is missing its comment listing".to_string(),
        }
        .into());
    };

    Ok(comment_listing
        .data
        .children
        .into_iter()
        .filter(|child| child.kind == "t1")
        .filter_map(|child| serde_json::from_value::<RedditCommentData>(child.data).ok())
        .filter_map(|comment| {
            let author = comment.author?;
            let body = comment.body?;
            if author == DELETED_AUTHOR || body.trim().is_empty() {
                return None;
            }
            Some(CommentRecord {
                author,
                body,
                score: comment.score,
            })
        })
        .take(max_comments)
        .collect())
}

/// Up to `keep` comments from a `/user/{name}/comments` listing.
pub fn history_comments(
    author: &str,
    listing: RedditListing<RedditCommentData>,
    keep: usize,
) -> Vec<CommentRecord> {
    listing
        .data
        .children
        .into_iter()
        .filter(|child| child.kind == "t1")
        .filter_map(|child| {
            let body = child.data.body?;
            if body.trim().is_empty() {
                return None;
            }
            Some(CommentRecord {
                author: child.data.author.unwrap_or_else(|| author.to_string()),
                body,
                score: child.data.score,
            })
        })
        .take(keep)
        .collect()
}

pub fn classify_status(status: u16, endpoint: &str, retry_after: Option<u64>) -> CorpusError {
    match status {
        429 => CorpusError::RateLimitExceeded {
            retry_after: retry_after.unwrap_or(60),
        },
        401 => CorpusError::InvalidToken,
        403 => CorpusError::Forbidden {
            resource: endpoint.to_string(),
        },
        404 => CorpusError::InvalidResponse {
            details: format!("Resource not found: {}", endpoint),
        },
        s if s >= 500 => CorpusError::ServerError { status_code: s },
        s => CorpusError::InvalidResponse {
            details: format!("Unexpected status {} for {}", s, endpoint),
        },
    }
}

impl From<RedditPostData> for CandidatePost {
    fn from(post_data: RedditPostData) -> Self {
        let body = if post_data.selftext.trim().is_empty() {
            post_data.title.clone()
        } else {
            post_data.selftext
        };
        Self {
            id: post_data.id,
            title: post_data.title,
            body,
            score: post_data.score,
            flair: post_data.link_flair_text,
            nsfw: post_data.over_18,
            url: post_data.url,
            comments: Vec::new(),
            similarity_score: None,
        }
    }
}
