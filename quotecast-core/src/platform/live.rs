use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use url::Url;

use crate::config::{ContentSection, PlatformSection};
use crate::schedule::BroadcastSchedule;
use crate::session::Session;

use super::retry::{Relogin, RetryPolicy};
use super::{PlatformError, PlatformResult};

const MAINTENANCE_PROBE_STEP_MINUTES: i64 = 30;
const POST_MAINTENANCE_ATTEMPTS: usize = 48;
const OVERLAP_ERROR_CODE: &str = "OVERLAP_MAINTENANCE";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveState {
    pub current: Option<String>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgramTimes {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequest {
    pub title: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<TagSpec>,
    pub community_id: String,
    pub is_tag_owner_lock: bool,
    pub is_member_only: bool,
    pub is_timeshift_enabled: bool,
    pub is_monetization_enabled: bool,
    pub is_auto_comment_filter_enabled: bool,
    pub is_quotable: bool,
    pub max_quality: String,
    pub reservation_begin_time: String,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSpec {
    pub label: String,
    pub is_locked: bool,
}

/// Classification of a slot-creation response. Anything that is neither a
/// success nor a maintenance overlap surfaces as a `PlatformError` from the
/// transport.
#[derive(Debug, Clone, Copy)]
pub enum ReservationOutcome {
    Created,
    MaintenanceOverlap { begins: DateTime<Utc> },
}

#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn fetch_onairs(&self) -> PlatformResult<OnairsData>;
    async fn fetch_program(&self, program_id: &str) -> PlatformResult<Option<ProgramTimes>>;
    async fn create_program(
        &self,
        request: &ReservationRequest,
    ) -> PlatformResult<ReservationOutcome>;
    async fn post_operator_comment(
        &self,
        program_id: &str,
        text: &str,
        permanent: bool,
    ) -> PlatformResult<()>;
}

/// Slot-facing operations the lifecycle loop depends on.
#[async_trait]
pub trait SlotService: Send + Sync {
    async fn live_state(&self) -> PlatformResult<LiveState>;
    async fn reserve(&self) -> PlatformResult<()>;
    async fn begin_time(&self, program_id: &str) -> PlatformResult<DateTime<Utc>>;
    async fn end_time(&self, program_id: &str) -> PlatformResult<DateTime<Utc>>;
    async fn post_message(
        &self,
        program_id: &str,
        text: &str,
        permanent: bool,
    ) -> PlatformResult<()>;
}

#[derive(Debug, Clone)]
pub struct ReservationSettings {
    pub category: String,
    pub community_id: String,
    pub tags: Vec<String>,
}

impl ReservationSettings {
    pub fn from_config(platform: &PlatformSection, content: &ContentSection) -> Self {
        Self {
            category: platform.category.clone(),
            community_id: platform.community_id.clone(),
            tags: content.tags.clone(),
        }
    }
}

pub struct LiveService {
    transport: Arc<dyn LiveTransport>,
    auth: Arc<dyn Relogin>,
    schedule: BroadcastSchedule,
    settings: ReservationSettings,
}

impl LiveService {
    pub fn new(
        transport: Arc<dyn LiveTransport>,
        auth: Arc<dyn Relogin>,
        schedule: BroadcastSchedule,
        settings: ReservationSettings,
    ) -> Self {
        Self {
            transport,
            auth,
            schedule,
            settings,
        }
    }

    fn reservation_request(&self, begin: DateTime<Utc>, duration_minutes: i64) -> ReservationRequest {
        let tags = self
            .settings
            .tags
            .iter()
            .map(|label| TagSpec {
                label: label.clone(),
                is_locked: true,
            })
            .collect();
        ReservationRequest {
            title: format!("[{}] 24-hour quotation broadcast", self.settings.category),
            description: "Welcome!\nThis live stream is operated automatically by a bot."
                .to_string(),
            category: self.settings.category.clone(),
            tags,
            community_id: self.settings.community_id.clone(),
            is_tag_owner_lock: true,
            is_member_only: false,
            is_timeshift_enabled: true,
            is_monetization_enabled: true,
            is_auto_comment_filter_enabled: false,
            is_quotable: false,
            max_quality: "1Mbps450p".to_string(),
            reservation_begin_time: begin.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            duration_minutes,
        }
    }

    async fn try_reserve(&self) -> PlatformResult<()> {
        let begin = self.schedule.next_slot_start(Utc::now());
        let duration = self.schedule.slot_minutes();
        let request = self.reservation_request(begin, duration);
        match self.transport.create_program(&request).await? {
            ReservationOutcome::Created => {
                info!(begin = %begin, duration, "slot reserved");
                Ok(())
            }
            ReservationOutcome::MaintenanceOverlap { begins } => {
                warn!(begin = %begin, maintenance = %begins, "reservation overlaps a maintenance window");
                self.reserve_around_maintenance(begin, duration, begins)
                    .await
            }
        }
    }

    /// Fills the remainder before the maintenance window with shrinking
    /// durations, then probes for a post-maintenance slot by advancing the
    /// start time. Exhaustion of either phase is degraded service, not a
    /// failure: the platform stays short one slot until the next cycle.
    async fn reserve_around_maintenance(
        &self,
        begin: DateTime<Utc>,
        requested_minutes: i64,
        maintenance_begin: DateTime<Utc>,
    ) -> PlatformResult<()> {
        let mut duration = (maintenance_begin - begin)
            .num_minutes()
            .min(requested_minutes);
        let mut reserved_pre = false;
        while duration > 0 {
            let request = self.reservation_request(begin, duration);
            match self.transport.create_program(&request).await? {
                ReservationOutcome::Created => {
                    info!(begin = %begin, duration, "pre-maintenance slot reserved");
                    reserved_pre = true;
                    break;
                }
                ReservationOutcome::MaintenanceOverlap { .. } => {
                    duration -= MAINTENANCE_PROBE_STEP_MINUTES;
                }
            }
        }
        if !reserved_pre {
            error!("could not fit a slot before the maintenance window");
        }

        let mut resume = self.schedule.following_slot_start(maintenance_begin);
        for _ in 0..POST_MAINTENANCE_ATTEMPTS {
            let end = self.schedule.following_slot_start(resume);
            let duration = (end - resume).num_minutes();
            let request = self.reservation_request(resume, duration);
            match self.transport.create_program(&request).await? {
                ReservationOutcome::Created => {
                    info!(begin = %resume, duration, "post-maintenance slot reserved");
                    return Ok(());
                }
                ReservationOutcome::MaintenanceOverlap { .. } => {
                    resume += Duration::minutes(MAINTENANCE_PROBE_STEP_MINUTES);
                }
            }
        }
        error!(
            attempts = POST_MAINTENANCE_ATTEMPTS,
            "gave up reserving a post-maintenance slot"
        );
        Ok(())
    }
}

#[async_trait]
impl SlotService for LiveService {
    async fn live_state(&self) -> PlatformResult<LiveState> {
        RetryPolicy::new(5)
            .run(self.auth.as_ref(), || async {
                let data = self.transport.fetch_onairs().await?;
                let mut state = LiveState {
                    current: data.program_id,
                    next: data.next_program_id,
                };
                if state.next == state.current {
                    state.next = None;
                }
                Ok(state)
            })
            .await
    }

    async fn reserve(&self) -> PlatformResult<()> {
        RetryPolicy::new(10)
            .run(self.auth.as_ref(), || self.try_reserve())
            .await
    }

    async fn begin_time(&self, program_id: &str) -> PlatformResult<DateTime<Utc>> {
        RetryPolicy::new(5)
            .run(self.auth.as_ref(), || async {
                match self.transport.fetch_program(program_id).await? {
                    Some(times) => Ok(times.begin),
                    None => Err(PlatformError::Status {
                        status: StatusCode::NOT_FOUND,
                        operation: "program info",
                    }),
                }
            })
            .await
    }

    async fn end_time(&self, program_id: &str) -> PlatformResult<DateTime<Utc>> {
        RetryPolicy::new(5)
            .run(self.auth.as_ref(), || async {
                match self.transport.fetch_program(program_id).await? {
                    Some(times) => Ok(times.end),
                    // The slot is already gone; treat it as ending now.
                    None => Ok(Utc::now()),
                }
            })
            .await
    }

    async fn post_message(
        &self,
        program_id: &str,
        text: &str,
        permanent: bool,
    ) -> PlatformResult<()> {
        RetryPolicy::new(10)
            .run(self.auth.as_ref(), || {
                self.transport
                    .post_operator_comment(program_id, text, permanent)
            })
            .await
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnairsData {
    pub program_id: Option<String>,
    pub next_program_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgramData {
    begin_at: i64,
    end_at: i64,
}

#[derive(Debug, Deserialize)]
struct ReservationEnvelope {
    meta: ReservationMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservationMeta {
    status: u16,
    error_code: Option<String>,
    maintenance_begin_time: Option<String>,
}

pub struct HttpLiveTransport {
    session: Arc<Session>,
    base: Url,
}

impl HttpLiveTransport {
    pub fn new(session: Arc<Session>, platform: &PlatformSection) -> PlatformResult<Self> {
        let base = Url::parse(&platform.live_base_url)?;
        Ok(Self { session, base })
    }

    fn token(&self) -> String {
        self.session.header_token().unwrap_or_default()
    }
}

const SESSION_HEADER: &str = "X-Session";

#[async_trait]
impl LiveTransport for HttpLiveTransport {
    async fn fetch_onairs(&self) -> PlatformResult<OnairsData> {
        let url = self.base.join("tool/onairs")?;
        let resp = self
            .session
            .client()
            .get(url)
            .header(SESSION_HEADER, self.token())
            .send()
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(PlatformError::AuthExpired);
        }
        resp.error_for_status_ref()?;
        let envelope: Envelope<OnairsData> = resp.json().await?;
        Ok(envelope.data)
    }

    async fn fetch_program(&self, program_id: &str) -> PlatformResult<Option<ProgramTimes>> {
        let url = self.base.join(&format!("watch/{program_id}/program"))?;
        let resp = self.session.client().get(url).send().await?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(PlatformError::AuthExpired)
            }
            StatusCode::NOT_FOUND => return Ok(None),
            _ => {}
        }
        resp.error_for_status_ref()?;
        let envelope: Envelope<ProgramData> = resp.json().await?;
        let begin = Utc
            .timestamp_opt(envelope.data.begin_at, 0)
            .single()
            .ok_or_else(|| PlatformError::Malformed {
                operation: "program info",
                detail: format!("begin timestamp {} out of range", envelope.data.begin_at),
            })?;
        let end = Utc
            .timestamp_opt(envelope.data.end_at, 0)
            .single()
            .ok_or_else(|| PlatformError::Malformed {
                operation: "program info",
                detail: format!("end timestamp {} out of range", envelope.data.end_at),
            })?;
        Ok(Some(ProgramTimes { begin, end }))
    }

    async fn create_program(
        &self,
        request: &ReservationRequest,
    ) -> PlatformResult<ReservationOutcome> {
        let url = self.base.join("programs")?;
        let resp = self
            .session
            .client()
            .post(url)
            .header(SESSION_HEADER, self.token())
            .json(request)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(PlatformError::AuthExpired);
        }
        // 400 carries the overlap classification in its body; everything else
        // above 399 is an ordinary failure.
        if !status.is_success() && status != StatusCode::BAD_REQUEST {
            return Err(PlatformError::Status {
                status,
                operation: "slot reservation",
            });
        }
        let envelope: ReservationEnvelope = resp.json().await?;
        let meta = envelope.meta;
        if meta.status == 201 {
            return Ok(ReservationOutcome::Created);
        }
        if meta.error_code.as_deref() == Some(OVERLAP_ERROR_CODE) {
            let raw = meta
                .maintenance_begin_time
                .ok_or_else(|| PlatformError::Malformed {
                    operation: "slot reservation",
                    detail: "overlap response without a maintenance begin time".to_string(),
                })?;
            let begins = DateTime::parse_from_rfc3339(&raw)
                .map_err(|err| PlatformError::Malformed {
                    operation: "slot reservation",
                    detail: format!("bad maintenance begin time {raw}: {err}"),
                })?
                .with_timezone(&Utc);
            return Ok(ReservationOutcome::MaintenanceOverlap { begins });
        }
        Err(PlatformError::Status {
            status: StatusCode::from_u16(meta.status).unwrap_or(status),
            operation: "slot reservation",
        })
    }

    async fn post_operator_comment(
        &self,
        program_id: &str,
        text: &str,
        permanent: bool,
    ) -> PlatformResult<()> {
        let url = self
            .base
            .join(&format!("watch/{program_id}/operator_comment"))?;
        let payload = serde_json::json!({ "text": text, "isPermanent": permanent });
        let resp = self
            .session
            .client()
            .put(url)
            .json(&payload)
            .send()
            .await?;
        if matches!(
            resp.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(PlatformError::AuthExpired);
        }
        resp.error_for_status_ref()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::retry::NoRefresh;
    use chrono::NaiveDateTime;
    use std::sync::Mutex;

    fn parse_begin(request: &ReservationRequest) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(&request.reservation_begin_time, "%Y-%m-%dT%H:%M:%SZ")
            .unwrap()
            .and_utc()
    }

    /// Simulated platform with one maintenance window starting a fixed number
    /// of minutes after the first requested begin time.
    struct MaintenanceMock {
        calls: Mutex<Vec<(DateTime<Utc>, i64)>>,
        maintenance_after_minutes: i64,
        accept_pre_max: i64,
        accept_post: bool,
    }

    impl MaintenanceMock {
        fn new(maintenance_after_minutes: i64, accept_pre_max: i64, accept_post: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                maintenance_after_minutes,
                accept_pre_max,
                accept_post,
            }
        }

        fn calls(&self) -> Vec<(DateTime<Utc>, i64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LiveTransport for MaintenanceMock {
        async fn fetch_onairs(&self) -> PlatformResult<OnairsData> {
            Ok(OnairsData::default())
        }

        async fn fetch_program(&self, _program_id: &str) -> PlatformResult<Option<ProgramTimes>> {
            Ok(None)
        }

        async fn create_program(
            &self,
            request: &ReservationRequest,
        ) -> PlatformResult<ReservationOutcome> {
            let begin = parse_begin(request);
            let mut calls = self.calls.lock().unwrap();
            calls.push((begin, request.duration_minutes));
            let boundary = calls[0].0 + Duration::minutes(self.maintenance_after_minutes);
            if begin < boundary {
                let fits = request.duration_minutes <= self.accept_pre_max
                    && begin + Duration::minutes(request.duration_minutes) <= boundary;
                if fits {
                    Ok(ReservationOutcome::Created)
                } else {
                    Ok(ReservationOutcome::MaintenanceOverlap { begins: boundary })
                }
            } else if self.accept_post {
                Ok(ReservationOutcome::Created)
            } else {
                Ok(ReservationOutcome::MaintenanceOverlap { begins: boundary })
            }
        }

        async fn post_operator_comment(
            &self,
            _program_id: &str,
            _text: &str,
            _permanent: bool,
        ) -> PlatformResult<()> {
            Ok(())
        }
    }

    fn service(transport: Arc<dyn LiveTransport>) -> LiveService {
        LiveService::new(
            transport,
            Arc::new(NoRefresh),
            BroadcastSchedule::new(9, vec![4, 10, 16, 22], 360),
            ReservationSettings {
                category: "General".into(),
                community_id: "co1".into(),
                tags: vec!["quotation".into()],
            },
        )
    }

    #[tokio::test]
    async fn maintenance_boundary_45_minutes_out_succeeds_at_45() {
        let mock = Arc::new(MaintenanceMock::new(45, 45, true));
        service(Arc::clone(&mock) as Arc<dyn LiveTransport>)
            .reserve()
            .await
            .unwrap();

        let calls = mock.calls();
        // Full-duration attempt, then the pre-maintenance remainder at 45.
        assert_eq!(calls[0].1, 360);
        assert_eq!(calls[1].1, 45);
        // Pre-portion reserved on the first probe; then the post-portion.
        assert_eq!(calls.len(), 3);
        assert!(calls[2].0 >= calls[0].0 + Duration::minutes(45));
    }

    #[tokio::test]
    async fn pre_maintenance_probe_steps_down_by_30_and_gives_up_degraded() {
        let mock = Arc::new(MaintenanceMock::new(45, 0, true));
        service(Arc::clone(&mock) as Arc<dyn LiveTransport>)
            .reserve()
            .await
            .unwrap();

        let durations: Vec<i64> = mock.calls().iter().map(|call| call.1).collect();
        // 360 overlap, probe 45, probe 15, then the post-portion attempt.
        assert_eq!(durations[0], 360);
        assert_eq!(&durations[1..3], &[45, 15]);
        assert_eq!(durations.len(), 4);
    }

    #[tokio::test]
    async fn post_maintenance_probe_advances_in_30_minute_steps_and_is_bounded() {
        let mock = Arc::new(MaintenanceMock::new(45, 45, false));
        // Degraded give-up still returns Ok.
        service(Arc::clone(&mock) as Arc<dyn LiveTransport>)
            .reserve()
            .await
            .unwrap();

        let calls = mock.calls();
        // 1 full attempt + 1 successful pre-probe + 48 bounded post attempts.
        assert_eq!(calls.len(), 2 + POST_MAINTENANCE_ATTEMPTS);
        let post = &calls[2..];
        for pair in post.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, Duration::minutes(30));
        }
    }

    struct StaticOnairs(OnairsData);

    #[async_trait]
    impl LiveTransport for StaticOnairs {
        async fn fetch_onairs(&self) -> PlatformResult<OnairsData> {
            Ok(self.0.clone())
        }
        async fn fetch_program(&self, _program_id: &str) -> PlatformResult<Option<ProgramTimes>> {
            Ok(None)
        }
        async fn create_program(
            &self,
            _request: &ReservationRequest,
        ) -> PlatformResult<ReservationOutcome> {
            Ok(ReservationOutcome::Created)
        }
        async fn post_operator_comment(
            &self,
            _program_id: &str,
            _text: &str,
            _permanent: bool,
        ) -> PlatformResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn next_equal_to_current_is_reported_as_none() {
        let transport = Arc::new(StaticOnairs(OnairsData {
            program_id: Some("lv100".into()),
            next_program_id: Some("lv100".into()),
        }));
        let state = service(transport).live_state().await.unwrap();
        assert_eq!(state.current.as_deref(), Some("lv100"));
        assert!(state.next.is_none());
    }

    #[tokio::test]
    async fn missing_program_means_the_slot_ends_now() {
        let transport = Arc::new(StaticOnairs(OnairsData::default()));
        let before = Utc::now();
        let end = service(transport).end_time("lv404").await.unwrap();
        assert!(end >= before && end <= Utc::now());
    }
}
