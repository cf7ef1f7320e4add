//! Reddit source: OAuth, listing union, full tree expansion, normalization.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use odyssey_core::{is_deleted_marker, CommentSnapshot, ThreadRef};
use odyssey_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{CommentSource, Heartbeat, SourceError};

pub const DEFAULT_API_BASE: &str = "https://oauth.reddit.com";
pub const DEFAULT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
pub const PERMALINK_HOST: &str = "https://www.reddit.com";

const LISTING_PAGE_SIZE: usize = 100;
const MAX_LISTING_PAGES: usize = 20;
const MORECHILDREN_CHUNK: usize = 100;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Listing orderings unioned to work around per-listing caps.
const LISTING_SORTS: [(&str, &str); 3] = [("new", ""), ("hot", ""), ("top", "t=all")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedditCredentials {
    ClientCredentials,
    Password { username: String, password: String },
    RefreshToken(String),
}

#[derive(Debug, Clone)]
pub struct RedditConfig {
    pub subreddit: String,
    pub client_id: String,
    pub client_secret: String,
    pub credentials: RedditCredentials,
    pub api_base: String,
    pub token_url: String,
    pub heartbeat_every: Duration,
}

impl RedditConfig {
    pub fn new(subreddit: impl Into<String>, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            subreddit: subreddit.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            credentials: RedditCredentials::ClientCredentials,
            api_base: DEFAULT_API_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            heartbeat_every: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct RedditSource {
    config: RedditConfig,
    source_id: String,
    http: HttpFetcher,
    token: Mutex<Option<AccessToken>>,
}

impl RedditSource {
    pub fn new(config: RedditConfig, http: HttpFetcher) -> Self {
        let source_id = format!("r/{}", config.subreddit);
        Self {
            config,
            source_id,
            http,
            token: Mutex::new(None),
        }
    }

    async fn bearer(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let grant: Vec<(&str, &str)> = match &self.config.credentials {
            RedditCredentials::ClientCredentials => vec![("grant_type", "client_credentials")],
            RedditCredentials::Password { username, password } => vec![
                ("grant_type", "password"),
                ("username", username.as_str()),
                ("password", password.as_str()),
            ],
            RedditCredentials::RefreshToken(token) => {
                vec![("grant_type", "refresh_token"), ("refresh_token", token.as_str())]
            }
        };
        let body = self
            .http
            .post_form_json(
                &self.config.token_url,
                (self.config.client_id.as_str(), self.config.client_secret.as_str()),
                &grant,
            )
            .await?;

        let Some(value) = body.get("access_token").and_then(JsonValue::as_str) else {
            let reason = body
                .get("error")
                .and_then(JsonValue::as_str)
                .unwrap_or("token response without access_token");
            return Err(SourceError::Auth(reason.to_string()));
        };
        let expires_in = body.get("expires_in").and_then(JsonValue::as_u64).unwrap_or(3600);
        let token = AccessToken {
            value: value.to_string(),
            expires_at: token_expiry(Instant::now(), expires_in),
        };
        debug!(expires_in, "obtained reddit access token");
        *cached = Some(token.clone());
        Ok(token.value)
    }

    async fn api_get(&self, path_and_query: &str) -> Result<JsonValue, SourceError> {
        let token = self.bearer().await?;
        let url = format!("{}{}", self.config.api_base.trim_end_matches('/'), path_and_query);
        match self.http.get_json(&url, Some(&token)).await {
            Ok(body) => Ok(body),
            Err(err) => {
                if matches!(err, FetchError::HttpStatus { status: 401, .. }) {
                    self.token.lock().await.take();
                }
                Err(err.into())
            }
        }
    }

    async fn fetch_listing(&self, sort: &str, extra: &str) -> Result<Vec<ThreadRef>, SourceError> {
        let mut threads = Vec::new();
        let mut after: Option<String> = None;
        for _ in 0..MAX_LISTING_PAGES {
            let mut query = format!("limit={LISTING_PAGE_SIZE}&raw_json=1");
            if !extra.is_empty() {
                query.push('&');
                query.push_str(extra);
            }
            if let Some(cursor) = &after {
                query.push_str("&after=");
                query.push_str(cursor);
            }
            let body = self
                .api_get(&format!("/r/{}/{sort}?{query}", self.config.subreddit))
                .await?;
            let page = parse_thread_listing(&body)?;
            threads.extend(page.threads);
            match page.after {
                Some(next) if !next.is_empty() => after = Some(next),
                _ => break,
            }
        }
        Ok(threads)
    }

    async fn expand_thread(&self, thread: &ThreadRef) -> Result<Vec<CommentSnapshot>, SourceError> {
        let now = Utc::now();
        let mut walk = TreeWalk::new(&thread.thread_id, now);

        let body = self
            .api_get(&format!("/comments/{}?limit=500&raw_json=1", thread.thread_id))
            .await?;
        walk.visit_thread_response(&body)?;

        let mut requested: HashSet<String> = HashSet::new();
        let mut focused: HashSet<String> = HashSet::new();
        while let Some(stub) = walk.stubs.pop_front() {
            if stub.children.is_empty() {
                // "continue this thread": re-fetch the subtree under the parent.
                let Some(parent) = stub.parent_id.strip_prefix("t1_") else {
                    warn!(
                        thread_id = %thread.thread_id,
                        parent_id = %stub.parent_id,
                        "continuation stub without a comment parent; subtree not expanded"
                    );
                    continue;
                };
                if !focused.insert(parent.to_string()) {
                    continue;
                }
                let body = self
                    .api_get(&format!(
                        "/comments/{}?comment={parent}&limit=500&raw_json=1",
                        thread.thread_id
                    ))
                    .await?;
                walk.visit_thread_response(&body)?;
                continue;
            }

            let pending: Vec<String> = stub
                .children
                .into_iter()
                .filter(|id| !walk.seen.contains(id) && requested.insert(id.clone()))
                .collect();
            for chunk in pending.chunks(MORECHILDREN_CHUNK) {
                let body = self
                    .api_get(&format!(
                        "/api/morechildren?api_type=json&link_id=t3_{}&children={}&raw_json=1",
                        thread.thread_id,
                        chunk.join(",")
                    ))
                    .await?;
                let things = body
                    .pointer("/json/data/things")
                    .and_then(JsonValue::as_array)
                    .ok_or_else(|| SourceError::Malformed("morechildren response without things".into()))?;
                walk.visit_things(things)?;
                let missing = chunk.iter().filter(|id| !walk.seen.contains(*id)).count();
                if missing > 0 {
                    warn!(
                        thread_id = %thread.thread_id,
                        requested = chunk.len(),
                        missing,
                        "morechildren omitted requested comments"
                    );
                }
            }
        }

        Ok(walk.comments)
    }
}

/// When a token granted for `expires_in` seconds stops being usable. Lifetimes
/// are capped at a day.
fn token_expiry(now: Instant, expires_in: u64) -> Instant {
    let lifetime = Duration::from_secs(expires_in).min(MAX_TOKEN_LIFETIME);
    now.checked_add(lifetime).unwrap_or(now)
}

#[async_trait]
impl CommentSource for RedditSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn list_threads(&self) -> Result<Vec<ThreadRef>, SourceError> {
        let mut seen = HashSet::new();
        let mut threads = Vec::new();
        for (sort, extra) in LISTING_SORTS {
            let listed = self.fetch_listing(sort, extra).await?;
            debug!(sort, listed = listed.len(), "listing fetched");
            threads.extend(listed.into_iter().filter(|t| seen.insert(t.thread_id.clone())));
        }
        info!(subreddit = %self.config.subreddit, threads = threads.len(), "threads listed");
        Ok(threads)
    }

    async fn fetch_comments(&self, thread: &ThreadRef) -> Result<Vec<CommentSnapshot>, SourceError> {
        let heartbeat = Heartbeat::start(
            format!("expanding t3_{}", thread.thread_id),
            self.config.heartbeat_every,
        );
        let result = self.expand_thread(thread).await;
        heartbeat.stop().await;
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ThreadListingPage {
    threads: Vec<ThreadRef>,
    after: Option<String>,
}

fn parse_thread_listing(body: &JsonValue) -> Result<ThreadListingPage, SourceError> {
    let children = body
        .pointer("/data/children")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SourceError::Malformed("listing without data.children".into()))?;
    let threads = children
        .iter()
        .filter(|child| child.get("kind").and_then(JsonValue::as_str) == Some("t3"))
        .filter_map(|child| {
            let data = child.get("data")?;
            Some(ThreadRef {
                thread_id: data.get("id")?.as_str()?.to_string(),
                title: data
                    .get("title")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect();
    let after = body
        .pointer("/data/after")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    Ok(ThreadListingPage { threads, after })
}

/// Unresolved `more` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MoreStub {
    parent_id: String,
    children: Vec<String>,
}

/// Accumulates a flattened comment tree across the initial fetch and every
/// continuation request.
struct TreeWalk {
    thread_id: String,
    observed_at: DateTime<Utc>,
    comments: Vec<CommentSnapshot>,
    seen: HashSet<String>,
    stubs: VecDeque<MoreStub>,
}

impl TreeWalk {
    fn new(thread_id: &str, observed_at: DateTime<Utc>) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            observed_at,
            comments: Vec::new(),
            seen: HashSet::new(),
            stubs: VecDeque::new(),
        }
    }

    /// `/comments/{id}` answers `[submission listing, comment listing]`.
    fn visit_thread_response(&mut self, body: &JsonValue) -> Result<(), SourceError> {
        let children = body
            .get(1)
            .and_then(|listing| listing.pointer("/data/children"))
            .and_then(JsonValue::as_array)
            .ok_or_else(|| SourceError::Malformed("thread response without comment listing".into()))?;
        self.visit_things(children)
    }

    fn visit_things(&mut self, things: &[JsonValue]) -> Result<(), SourceError> {
        for thing in things {
            let Some(data) = thing.get("data") else {
                continue;
            };
            match thing.get("kind").and_then(JsonValue::as_str) {
                Some("t1") => {
                    let snapshot = normalize_comment(data, &self.thread_id, self.observed_at)?;
                    if self.seen.insert(snapshot.comment_id.clone()) {
                        self.comments.push(snapshot);
                    }
                    if let Some(replies) = data.pointer("/replies/data/children").and_then(JsonValue::as_array) {
                        self.visit_things(replies)?;
                    }
                }
                Some("more") => {
                    let children = data
                        .get("children")
                        .and_then(JsonValue::as_array)
                        .map(|ids| {
                            ids.iter()
                                .filter_map(JsonValue::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    let parent_id = data
                        .get("parent_id")
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.stubs.push_back(MoreStub {
                        parent_id,
                        children,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Split a fullname such as `t1_abc` into `("t1", "abc")`.
pub fn split_fullname(fullname: &str) -> (&str, &str) {
    fullname.split_once('_').unwrap_or(("", fullname))
}

fn timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    let secs = value.as_f64()?;
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    DateTime::from_timestamp(whole, nanos)
}

/// Turn one `t1` data object into a snapshot. This is the serialization
/// boundary: the raw payload keeps everything except the nested reply tree.
pub fn normalize_comment(
    data: &JsonValue,
    fallback_thread_id: &str,
    observed_at: DateTime<Utc>,
) -> Result<CommentSnapshot, SourceError> {
    let comment_id = data
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| SourceError::Malformed("comment without id".into()))?
        .to_string();

    let thread_id = data
        .get("link_id")
        .and_then(JsonValue::as_str)
        .map(|link| split_fullname(link).1.to_string())
        .unwrap_or_else(|| fallback_thread_id.to_string());

    let parent_comment_id = data
        .get("parent_id")
        .and_then(JsonValue::as_str)
        .and_then(|parent| match split_fullname(parent) {
            ("t1", id) => Some(id.to_string()),
            _ => None,
        });

    let author_username = data
        .get("author")
        .and_then(JsonValue::as_str)
        .filter(|name| !name.is_empty() && *name != "[deleted]")
        .map(str::to_string);

    let body_text = data
        .get("body")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();

    let is_deleted = is_deleted_marker(&body_text) || author_username.is_none();

    let created_utc = data
        .get("created_utc")
        .and_then(timestamp)
        .unwrap_or(observed_at);

    // `edited` is `false` for unedited comments, a timestamp otherwise.
    let edited_utc = data.get("edited").and_then(timestamp);

    let score = data.get("score").and_then(|s| {
        s.as_i64()
            .or_else(|| s.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
    });

    let permalink = data
        .get("permalink")
        .and_then(JsonValue::as_str)
        .map(|link| {
            if link.starts_with('/') {
                format!("{PERMALINK_HOST}{link}")
            } else {
                link.to_string()
            }
        });

    let mut raw_payload = data.clone();
    if let Some(obj) = raw_payload.as_object_mut() {
        obj.remove("replies");
    }

    Ok(CommentSnapshot {
        comment_id,
        thread_id,
        parent_comment_id,
        author_username,
        created_utc,
        body_text,
        edited_utc,
        score,
        permalink,
        is_deleted,
        raw_payload,
    })
}
