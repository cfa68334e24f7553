use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ContentSection, FillerSection, PlatformSection};
use crate::platform::quotation::QuotationService;
use crate::platform::retry::{Relogin, RetryPolicy};
use crate::platform::{PlatformError, PlatformResult};

const SEARCH_PAGE_SIZE: u32 = 30;
const MAX_PAGE_OFFSET: u32 = 90;
const SELECTION_ATTEMPTS: usize = 5;

/// Picks up to `winners` distinct ids from a request list that may contain
/// duplicates; the first occurrence in shuffled order wins, so a video that
/// was requested many times still takes at most one of the winner slots.
pub fn choice_from_requests<R>(requests: &[String], winners: usize, rng: &mut R) -> Option<Vec<String>>
where
    R: Rng + ?Sized,
{
    let mut pool = requests.to_vec();
    pool.shuffle(rng);
    let mut picked: Vec<String> = Vec::new();
    for candidate in pool {
        if picked.contains(&candidate) {
            continue;
        }
        picked.push(candidate);
        if picked.len() >= winners {
            break;
        }
    }
    if picked.is_empty() {
        None
    } else {
        Some(picked)
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub tag: String,
    pub min_seconds: u32,
    pub max_seconds: u32,
    pub offset: u32,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Hits(Vec<String>),
    /// The search backend answered 503: known degraded service, not an error.
    Degraded,
}

#[async_trait]
pub trait SearchTransport: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> PlatformResult<SearchOutcome>;
}

/// Random tag-based discovery the lifecycle loop falls back to when both the
/// work queue and the viewer requests run dry.
#[async_trait]
pub trait VideoSelector: Send + Sync {
    async fn random(&self, tag_pool: &[String]) -> PlatformResult<String>;
}

#[derive(Debug, Clone)]
pub struct SelectionSettings {
    pub min_seconds: u32,
    pub max_seconds: u32,
    pub ng_videos: HashSet<String>,
    pub maintenance_video: String,
}

impl SelectionSettings {
    pub fn from_config(content: &ContentSection, fillers: &FillerSection) -> Self {
        Self {
            min_seconds: content.min_seconds,
            max_seconds: content.max_seconds,
            ng_videos: content.ng_videos.iter().cloned().collect(),
            maintenance_video: fillers.maintenance_video.clone(),
        }
    }
}

pub struct Selector {
    search: Arc<dyn SearchTransport>,
    quotes: Arc<dyn QuotationService>,
    auth: Arc<dyn Relogin>,
    settings: SelectionSettings,
}

impl Selector {
    pub fn new(
        search: Arc<dyn SearchTransport>,
        quotes: Arc<dyn QuotationService>,
        auth: Arc<dyn Relogin>,
        settings: SelectionSettings,
    ) -> Self {
        Self {
            search,
            quotes,
            auth,
            settings,
        }
    }

    async fn try_random(&self, tag_pool: &[String]) -> PlatformResult<String> {
        let (tag, offset) = {
            let mut rng = rand::thread_rng();
            let tag = tag_pool
                .choose(&mut rng)
                .cloned()
                .ok_or(PlatformError::SelectionExhausted)?;
            (tag, rng.gen_range(0..=MAX_PAGE_OFFSET))
        };
        debug!(tag = %tag, offset, "searching for a candidate video");
        let query = SearchQuery {
            tag,
            min_seconds: self.settings.min_seconds,
            max_seconds: self.settings.max_seconds,
            offset,
            limit: SEARCH_PAGE_SIZE,
        };
        let hits = match self.search.search(&query).await? {
            SearchOutcome::Degraded => {
                warn!("search backend degraded, falling back to the maintenance filler");
                return Ok(self.settings.maintenance_video.clone());
            }
            SearchOutcome::Hits(hits) => hits,
        };

        let mut candidates: Vec<String> = hits
            .into_iter()
            .filter(|id| !self.settings.ng_videos.contains(id))
            .collect();
        if candidates.is_empty() {
            return Err(PlatformError::SelectionExhausted);
        }
        {
            let mut rng = rand::thread_rng();
            candidates.shuffle(&mut rng);
        }
        for candidate in &candidates {
            if self.quotes.video_info(candidate).await?.quotable {
                return Ok(candidate.clone());
            }
        }
        Err(PlatformError::SelectionExhausted)
    }
}

#[async_trait]
impl VideoSelector for Selector {
    async fn random(&self, tag_pool: &[String]) -> PlatformResult<String> {
        // Each re-drive rolls a fresh tag and offset.
        RetryPolicy::new(SELECTION_ATTEMPTS)
            .run(self.auth.as_ref(), || self.try_random(tag_pool))
            .await
    }
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    data: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchHit {
    content_id: String,
}

pub struct HttpSearchTransport {
    http: reqwest::Client,
    url: Url,
}

impl HttpSearchTransport {
    pub fn new(platform: &PlatformSection) -> PlatformResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(&platform.user_agent)
            .build()?;
        Ok(Self {
            http,
            url: Url::parse(&platform.search_url)?,
        })
    }
}

#[async_trait]
impl SearchTransport for HttpSearchTransport {
    async fn search(&self, query: &SearchQuery) -> PlatformResult<SearchOutcome> {
        let resp = self
            .http
            .get(self.url.clone())
            .query(&[
                ("q", query.tag.as_str()),
                ("targets", "tagsExact"),
                ("fields", "contentId"),
                ("_sort", "-lastCommentTime"),
                ("_context", "quotecast"),
            ])
            .query(&[
                ("filters[lengthSeconds][gte]", query.min_seconds),
                ("filters[lengthSeconds][lte]", query.max_seconds),
                ("_offset", query.offset),
                ("_limit", query.limit),
            ])
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Ok(SearchOutcome::Degraded);
        }
        resp.error_for_status_ref()?;
        let hits: SearchHits = resp.json().await?;
        Ok(SearchOutcome::Hits(
            hits.data.into_iter().map(|hit| hit.content_id).collect(),
        ))
    }
}
