use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::config::PlatformSection;
use crate::session::Session;

use super::retry::{Relogin, RetryPolicy};
use super::{PlatformError, PlatformResult};

/// Quote audio at half volume, keep the broadcaster's own audio muted at half
/// volume underneath. Fixed policy, not user-configurable.
const QUOTE_VOLUME: f32 = 0.5;
const SELF_VOLUME: f32 = 0.5;
/// Starting a quotation straight after a stop races the platform; give it a
/// moment to settle.
const CREATE_SETTLE: StdDuration = StdDuration::from_millis(1500);
const LAYOUT_SETTLE: StdDuration = StdDuration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub quotable: bool,
    pub duration: Duration,
    pub display: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub title: String,
    pub length_seconds: i64,
    pub quotable: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum CreateOutcome {
    Created,
    Conflict,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotationPayload {
    pub layout: LayoutSpec,
    pub contents: Vec<ContentRef>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSpec {
    pub main: SourceSpec,
    pub sub: SourceSpec,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub source: String,
    pub volume: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_sound_only: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ContentRef {
    pub fn video(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: "video".to_string(),
        }
    }
}

fn once_layout() -> LayoutSpec {
    LayoutSpec {
        main: SourceSpec {
            source: "quote".to_string(),
            volume: QUOTE_VOLUME,
            is_sound_only: None,
        },
        sub: SourceSpec {
            source: "self".to_string(),
            volume: SELF_VOLUME,
            is_sound_only: Some(true),
        },
    }
}

fn repeat_layout() -> LayoutSpec {
    LayoutSpec {
        main: SourceSpec {
            source: "quote".to_string(),
            volume: QUOTE_VOLUME,
            is_sound_only: None,
        },
        sub: SourceSpec {
            source: "self".to_string(),
            volume: SELF_VOLUME,
            is_sound_only: Some(false),
        },
    }
}

#[async_trait]
pub trait QuotationTransport: Send + Sync {
    async fn fetch_current(&self, program_id: &str) -> PlatformResult<Option<String>>;
    /// Returns whether a quotation existed to delete; a missing quotation is
    /// not an error.
    async fn delete(&self, program_id: &str) -> PlatformResult<bool>;
    async fn create(
        &self,
        program_id: &str,
        payload: &QuotationPayload,
    ) -> PlatformResult<CreateOutcome>;
    async fn replace_contents(&self, program_id: &str, video_id: &str) -> PlatformResult<()>;
    async fn update_layout(
        &self,
        program_id: &str,
        layout: &LayoutSpec,
        repeat: bool,
    ) -> PlatformResult<()>;
    async fn fetch_video(&self, video_id: &str) -> PlatformResult<VideoRecord>;
    async fn fetch_tags(&self, video_id: &str) -> PlatformResult<Vec<String>>;
}

/// Quotation-facing operations the lifecycle loop and the selection engine
/// depend on.
#[async_trait]
pub trait QuotationService: Send + Sync {
    async fn current(&self, program_id: &str) -> PlatformResult<Option<String>>;
    async fn stop(&self, program_id: &str) -> PlatformResult<()>;
    async fn video_info(&self, video_id: &str) -> PlatformResult<VideoInfo>;
    /// Starts a one-shot quotation and returns the estimated play time.
    async fn quote_once(&self, program_id: &str, video_id: &str) -> PlatformResult<Duration>;
    async fn quote_loop(&self, program_id: &str, video_id: &str) -> PlatformResult<()>;
}

pub struct QuotationClient {
    transport: Arc<dyn QuotationTransport>,
    auth: Arc<dyn Relogin>,
    ng_tags: HashSet<String>,
}

impl QuotationClient {
    pub fn new(
        transport: Arc<dyn QuotationTransport>,
        auth: Arc<dyn Relogin>,
        ng_tags: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            transport,
            auth,
            ng_tags: ng_tags.into_iter().collect(),
        }
    }

    async fn try_video_info(&self, video_id: &str) -> PlatformResult<VideoInfo> {
        let record = self.transport.fetch_video(video_id).await?;
        let mut quotable = record.quotable;
        if quotable {
            // Tag lookup is the expensive path; skip it when the platform
            // already ruled the video out.
            let tags = self.transport.fetch_tags(video_id).await?;
            if tags.iter().any(|tag| self.ng_tags.contains(tag)) {
                quotable = false;
            }
        }
        Ok(VideoInfo {
            quotable,
            duration: Duration::seconds(record.length_seconds),
            display: format!("{} / {}", record.title, record.id),
        })
    }

    async fn try_quote_once(&self, program_id: &str, video_id: &str) -> PlatformResult<Duration> {
        self.stop(program_id).await?;
        tokio::time::sleep(CREATE_SETTLE).await;
        let payload = QuotationPayload {
            layout: once_layout(),
            contents: vec![ContentRef::video(video_id)],
        };
        match self.transport.create(program_id, &payload).await? {
            CreateOutcome::Created => {}
            CreateOutcome::Conflict => {
                self.transport
                    .replace_contents(program_id, video_id)
                    .await?;
            }
        }
        let record = self.transport.fetch_video(video_id).await?;
        Ok(Duration::seconds(record.length_seconds))
    }
}

#[async_trait]
impl QuotationService for QuotationClient {
    async fn current(&self, program_id: &str) -> PlatformResult<Option<String>> {
        RetryPolicy::new(10)
            .run(self.auth.as_ref(), || self.transport.fetch_current(program_id))
            .await
    }

    async fn stop(&self, program_id: &str) -> PlatformResult<()> {
        RetryPolicy::new(5)
            .run(self.auth.as_ref(), || async {
                if !self.transport.delete(program_id).await? {
                    info!("no quotation to stop");
                }
                Ok(())
            })
            .await
    }

    async fn video_info(&self, video_id: &str) -> PlatformResult<VideoInfo> {
        RetryPolicy::new(3)
            .run(self.auth.as_ref(), || self.try_video_info(video_id))
            .await
    }

    async fn quote_once(&self, program_id: &str, video_id: &str) -> PlatformResult<Duration> {
        RetryPolicy::new(10)
            .run(self.auth.as_ref(), || {
                self.try_quote_once(program_id, video_id)
            })
            .await
    }

    async fn quote_loop(&self, program_id: &str, video_id: &str) -> PlatformResult<()> {
        self.quote_once(program_id, video_id).await?;
        RetryPolicy::new(10)
            .run(self.auth.as_ref(), || async {
                tokio::time::sleep(LAYOUT_SETTLE).await;
                self.transport
                    .update_layout(program_id, &repeat_layout(), true)
                    .await
            })
            .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentQuotation {
    current_content: Option<CurrentContent>,
}

#[derive(Debug, Deserialize)]
struct CurrentContent {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoEnvelope {
    data: VideoRecord,
}

#[derive(Debug, Deserialize)]
struct TagsEnvelope {
    data: TagsData,
}

#[derive(Debug, Deserialize)]
struct TagsData {
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LayoutUpdate<'a> {
    layout: &'a LayoutSpec,
    repeat: bool,
}

pub struct HttpQuotationTransport {
    session: Arc<Session>,
    base: Url,
}

impl HttpQuotationTransport {
    pub fn new(session: Arc<Session>, platform: &PlatformSection) -> PlatformResult<Self> {
        let base = Url::parse(&platform.tool_base_url)?;
        Ok(Self { session, base })
    }

    fn quotation_url(&self, program_id: &str) -> PlatformResult<Url> {
        Ok(self
            .base
            .join(&format!("contents/{program_id}/quotation"))?)
    }

    fn auth_guard(&self, status: StatusCode) -> PlatformResult<()> {
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            Err(PlatformError::AuthExpired)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QuotationTransport for HttpQuotationTransport {
    async fn fetch_current(&self, program_id: &str) -> PlatformResult<Option<String>> {
        let resp = self
            .session
            .client()
            .get(self.quotation_url(program_id)?)
            .send()
            .await?;
        self.auth_guard(resp.status())?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        resp.error_for_status_ref()?;
        let quotation: CurrentQuotation = resp.json().await?;
        Ok(quotation.current_content.and_then(|content| content.id))
    }

    async fn delete(&self, program_id: &str) -> PlatformResult<bool> {
        let resp = self
            .session
            .client()
            .delete(self.quotation_url(program_id)?)
            .send()
            .await?;
        self.auth_guard(resp.status())?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status_ref()?;
        Ok(true)
    }

    async fn create(
        &self,
        program_id: &str,
        payload: &QuotationPayload,
    ) -> PlatformResult<CreateOutcome> {
        let resp = self
            .session
            .client()
            .post(self.quotation_url(program_id)?)
            .json(payload)
            .send()
            .await?;
        self.auth_guard(resp.status())?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(CreateOutcome::Conflict);
        }
        resp.error_for_status_ref()?;
        Ok(CreateOutcome::Created)
    }

    async fn replace_contents(&self, program_id: &str, video_id: &str) -> PlatformResult<()> {
        let url = self
            .base
            .join(&format!("contents/{program_id}/quotation/contents"))?;
        let payload = serde_json::json!({ "contents": [ContentRef::video(video_id)] });
        let resp = self
            .session
            .client()
            .patch(url)
            .json(&payload)
            .send()
            .await?;
        self.auth_guard(resp.status())?;
        resp.error_for_status_ref()?;
        Ok(())
    }

    async fn update_layout(
        &self,
        program_id: &str,
        layout: &LayoutSpec,
        repeat: bool,
    ) -> PlatformResult<()> {
        let url = self
            .base
            .join(&format!("contents/{program_id}/quotation/layout"))?;
        let resp = self
            .session
            .client()
            .patch(url)
            .json(&LayoutUpdate { layout, repeat })
            .send()
            .await?;
        self.auth_guard(resp.status())?;
        resp.error_for_status_ref()?;
        Ok(())
    }

    async fn fetch_video(&self, video_id: &str) -> PlatformResult<VideoRecord> {
        let url = self
            .base
            .join(&format!("quote/services/video/contents/{video_id}"))?;
        let resp = self.session.client().get(url).send().await?;
        self.auth_guard(resp.status())?;
        // The platform answers 500 for broken videos; report them as
        // unquotable instead of failing the caller.
        if resp.status() == StatusCode::INTERNAL_SERVER_ERROR {
            return Ok(VideoRecord {
                id: video_id.to_string(),
                title: "ERROR".to_string(),
                length_seconds: 0,
                quotable: false,
            });
        }
        resp.error_for_status_ref()?;
        let envelope: VideoEnvelope = resp.json().await?;
        Ok(envelope.data)
    }

    async fn fetch_tags(&self, video_id: &str) -> PlatformResult<Vec<String>> {
        let url = self.base.join(&format!("videos/{video_id}/tags"))?;
        let resp = self.session.client().get(url).send().await?;
        self.auth_guard(resp.status())?;
        resp.error_for_status_ref()?;
        let envelope: TagsEnvelope = resp.json().await?;
        Ok(envelope.data.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::retry::NoRefresh;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTransport {
        current: Option<String>,
        had_quotation: bool,
        conflict_on_create: bool,
        video: Option<VideoRecord>,
        tags: Vec<String>,
        deletes: Mutex<usize>,
        creates: Mutex<usize>,
        replaces: Mutex<usize>,
        layout_updates: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl QuotationTransport for ScriptedTransport {
        async fn fetch_current(&self, _program_id: &str) -> PlatformResult<Option<String>> {
            Ok(self.current.clone())
        }

        async fn delete(&self, _program_id: &str) -> PlatformResult<bool> {
            *self.deletes.lock().unwrap() += 1;
            Ok(self.had_quotation)
        }

        async fn create(
            &self,
            _program_id: &str,
            _payload: &QuotationPayload,
        ) -> PlatformResult<CreateOutcome> {
            *self.creates.lock().unwrap() += 1;
            if self.conflict_on_create {
                Ok(CreateOutcome::Conflict)
            } else {
                Ok(CreateOutcome::Created)
            }
        }

        async fn replace_contents(
            &self,
            _program_id: &str,
            _video_id: &str,
        ) -> PlatformResult<()> {
            *self.replaces.lock().unwrap() += 1;
            Ok(())
        }

        async fn update_layout(
            &self,
            _program_id: &str,
            _layout: &LayoutSpec,
            repeat: bool,
        ) -> PlatformResult<()> {
            self.layout_updates.lock().unwrap().push(repeat);
            Ok(())
        }

        async fn fetch_video(&self, video_id: &str) -> PlatformResult<VideoRecord> {
            Ok(self.video.clone().unwrap_or(VideoRecord {
                id: video_id.to_string(),
                title: "Untitled".to_string(),
                length_seconds: 120,
                quotable: true,
            }))
        }

        async fn fetch_tags(&self, _video_id: &str) -> PlatformResult<Vec<String>> {
            Ok(self.tags.clone())
        }
    }

    fn client(transport: ScriptedTransport, ng_tags: &[&str]) -> QuotationClient {
        QuotationClient::new(
            Arc::new(transport),
            Arc::new(NoRefresh),
            ng_tags.iter().map(|tag| tag.to_string()),
        )
    }

    #[tokio::test]
    async fn stop_without_an_active_quotation_succeeds() {
        let client = client(
            ScriptedTransport {
                had_quotation: false,
                ..Default::default()
            },
            &[],
        );
        client.stop("lv1").await.unwrap();
    }

    #[tokio::test]
    async fn current_without_a_quotation_is_none() {
        let client = client(ScriptedTransport::default(), &[]);
        assert!(client.current("lv1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ng_tag_intersection_forces_unquotable() {
        let client = client(
            ScriptedTransport {
                tags: vec!["music".into(), "blocked".into()],
                ..Default::default()
            },
            &["blocked"],
        );
        let info = client.video_info("xx42").await.unwrap();
        assert!(!info.quotable);
        assert_eq!(info.duration, Duration::seconds(120));
    }

    #[tokio::test]
    async fn disjoint_tags_stay_quotable_with_display_text() {
        let client = client(
            ScriptedTransport {
                tags: vec!["music".into()],
                video: Some(VideoRecord {
                    id: "xx42".into(),
                    title: "A Video".into(),
                    length_seconds: 300,
                    quotable: true,
                }),
                ..Default::default()
            },
            &["blocked"],
        );
        let info = client.video_info("xx42").await.unwrap();
        assert!(info.quotable);
        assert_eq!(info.display, "A Video / xx42");
    }

    #[tokio::test(start_paused = true)]
    async fn quote_once_stops_first_and_returns_the_fresh_duration() {
        let transport = ScriptedTransport {
            had_quotation: true,
            video: Some(VideoRecord {
                id: "xx42".into(),
                title: "A Video".into(),
                length_seconds: 240,
                quotable: true,
            }),
            ..Default::default()
        };
        let client = QuotationClient::new(
            Arc::new(transport),
            Arc::new(NoRefresh),
            std::iter::empty(),
        );
        let duration = client.quote_once("lv1", "xx42").await.unwrap();
        assert_eq!(duration, Duration::seconds(240));
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_on_create_falls_back_to_replace() {
        let transport = Arc::new(ScriptedTransport {
            conflict_on_create: true,
            ..Default::default()
        });
        let client = QuotationClient::new(
            Arc::clone(&transport) as Arc<dyn QuotationTransport>,
            Arc::new(NoRefresh),
            std::iter::empty(),
        );
        client.quote_once("lv1", "xx42").await.unwrap();
        assert_eq!(*transport.creates.lock().unwrap(), 1);
        assert_eq!(*transport.replaces.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quote_loop_flips_the_layout_to_repeat() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = QuotationClient::new(
            Arc::clone(&transport) as Arc<dyn QuotationTransport>,
            Arc::new(NoRefresh),
            std::iter::empty(),
        );
        client.quote_loop("lv1", "xx17572946").await.unwrap();
        assert_eq!(*transport.creates.lock().unwrap(), 1);
        assert_eq!(transport.layout_updates.lock().unwrap().as_slice(), &[true]);
    }

    #[test]
    fn once_layout_keeps_self_audio_only() {
        let layout = once_layout();
        assert_eq!(layout.main.source, "quote");
        assert_eq!(layout.sub.is_sound_only, Some(true));
        let json = serde_json::to_value(&layout).unwrap();
        assert!(json["main"].get("isSoundOnly").is_none());
    }
}
