use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{ContentSection, FillerSection};
use crate::platform::live::SlotService;
use crate::platform::quotation::QuotationService;
use crate::platform::PlatformError;
use crate::queue::ContentQueue;
use crate::selection::{choice_from_requests, VideoSelector};

pub const RECOVERY_NOTICE: &str = "The system stopped unexpectedly and was restored by automatic recovery.\nWe apologize for the interruption; the broadcast will resume shortly.";
pub const CLOSING_NOTICE: &str = "This slot's broadcast has ended.\nThank you for watching.";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("the reservation just made is not visible on the platform")]
    ReservationNotVisible,
    #[error("live slot state unresolved: current={current:?} next={next:?}")]
    SlotStateUnresolved {
        current: Option<String>,
        next: Option<String>,
    },
    #[error("the work queue yielded an unquotable video {video_id} for slot {program_id}")]
    UnquotableQueued {
        video_id: String,
        program_id: String,
    },
}

/// One state of the broadcast lifecycle. `Lifecycle::step` is the transition
/// table; every arm can be driven in isolation against mock collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    ReconcileSlots,
    ReconcileQuotation { current: String, next: String },
    ContentLoop { current: String },
    SlotEnding { current: String, end: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    pub maintenance_video: String,
    pub closing_video: String,
    pub tags: Vec<String>,
    pub request_tags: Vec<String>,
    pub fairness_winners: usize,
}

impl LifecyclePolicy {
    pub fn from_config(content: &ContentSection, fillers: &FillerSection) -> Self {
        Self {
            maintenance_video: fillers.maintenance_video.clone(),
            closing_video: fillers.closing_video.clone(),
            tags: content.tags.clone(),
            request_tags: content.request_tags.clone(),
            fairness_winners: content.fairness_winners,
        }
    }
}

pub struct Lifecycle {
    slots: Arc<dyn SlotService>,
    quotes: Arc<dyn QuotationService>,
    queue: Arc<dyn ContentQueue>,
    selector: Arc<dyn VideoSelector>,
    clock: Arc<dyn Clock>,
    policy: LifecyclePolicy,
}

impl Lifecycle {
    pub fn new(
        slots: Arc<dyn SlotService>,
        quotes: Arc<dyn QuotationService>,
        queue: Arc<dyn ContentQueue>,
        selector: Arc<dyn VideoSelector>,
        clock: Arc<dyn Clock>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            slots,
            quotes,
            queue,
            selector,
            clock,
            policy,
        }
    }

    /// Runs the loop until a fatal condition or an exhausted retry escapes.
    /// The caller logs and exits; external supervision restarts the process.
    pub async fn run(&self) -> Result<(), LifecycleError> {
        let mut phase = Phase::ReconcileSlots;
        loop {
            debug!(?phase, "entering phase");
            phase = self.step(phase).await?;
        }
    }

    pub async fn step(&self, phase: Phase) -> Result<Phase, LifecycleError> {
        match phase {
            Phase::ReconcileSlots => self.reconcile_slots().await,
            Phase::ReconcileQuotation { current, next } => {
                self.reconcile_quotation(current, next).await
            }
            Phase::ContentLoop { current } => self.content_step(current).await,
            Phase::SlotEnding { current, end } => self.finish_slot(current, end).await,
        }
    }

    async fn reconcile_slots(&self) -> Result<Phase, LifecycleError> {
        let state = self.slots.live_state().await?;
        match (state.current, state.next) {
            (None, None) => {
                warn!("no on-air slot and no upcoming slot");
                self.slots.reserve().await?;
                let state = self.slots.live_state().await?;
                let Some(upcoming) = state.current.or(state.next) else {
                    error!("reserved a slot but the platform does not report it");
                    return Err(LifecycleError::ReservationNotVisible);
                };
                let begin = self.slots.begin_time(&upcoming).await?;
                self.clock.wait_until(begin).await;
                Ok(Phase::ReconcileSlots)
            }
            (None, Some(next)) => {
                let begin = self.slots.begin_time(&next).await?;
                self.clock.wait_until(begin).await;
                Ok(Phase::ReconcileSlots)
            }
            (Some(_), next) => {
                if next.is_none() {
                    self.slots.reserve().await?;
                }
                self.resolved_slots().await.map(|(current, next)| {
                    info!(current = %current, next = %next, "slots reconciled");
                    Phase::ReconcileQuotation { current, next }
                })
            }
        }
    }

    /// Re-queries the live state and insists on both slots being visible.
    async fn resolved_slots(&self) -> Result<(String, String), LifecycleError> {
        let state = self.slots.live_state().await?;
        match (state.current, state.next) {
            (Some(current), Some(next)) => Ok((current, next)),
            (current, next) => Err(LifecycleError::SlotStateUnresolved { current, next }),
        }
    }

    async fn reconcile_quotation(
        &self,
        current: String,
        next: String,
    ) -> Result<Phase, LifecycleError> {
        let current_end = self.slots.end_time(&current).await?;
        match self.quotes.current(&current).await? {
            None => Ok(Phase::ContentLoop { current }),
            Some(video) if video == self.policy.maintenance_video => {
                // Stuck idle filler from an earlier run; restart it.
                info!("maintenance filler still quoted, restarting it");
                self.quotes.stop(&current).await?;
                self.quotes
                    .quote_once(&current, &self.policy.maintenance_video)
                    .await?;
                Ok(Phase::ContentLoop { current })
            }
            Some(video) if video == self.policy.closing_video => {
                // The previous run left the slot-end filler looping on
                // purpose; sit out the remainder and pick up the next slot.
                info!("closing filler quoted, skipping ahead to the next slot");
                let next_begin = self.slots.begin_time(&next).await?;
                self.clock.wait_until(current_end).await;
                self.slots.reserve().await?;
                self.clock.wait_until(next_begin).await;
                let (current, _) = self.resolved_slots().await?;
                Ok(Phase::ContentLoop { current })
            }
            Some(video) => {
                // Any other quotation means the process died mid-quotation on
                // a prior run.
                info!(video = %video, "unexpected quotation found, assuming a crashed run");
                self.quotes.stop(&current).await?;
                let span = self
                    .quotes
                    .quote_once(&current, &self.policy.maintenance_video)
                    .await?;
                let maintenance_end = self.clock.now() + span;
                warn!(video = %video, "stopped the orphaned quotation for reset");
                self.slots
                    .post_message(&current, RECOVERY_NOTICE, false)
                    .await?;
                self.clock.wait_until(maintenance_end).await;
                Ok(Phase::ContentLoop { current })
            }
        }
    }

    async fn content_step(&self, current: String) -> Result<Phase, LifecycleError> {
        let video = match self.queue.dequeue().await? {
            Some(video) => video,
            None => self.refill_pick().await?,
        };
        info!(video = %video, "starting quotation");

        let slot_end = self.slots.end_time(&current).await?;
        let info = self.quotes.video_info(&video).await?;
        if !info.quotable {
            error!(video = %video, "the work queue yielded an unquotable video");
            return Err(LifecycleError::UnquotableQueued {
                video_id: video,
                program_id: current,
            });
        }
        if self.clock.now() + info.duration > slot_end - Duration::minutes(1) {
            info!("quotation aborted: it would not finish inside the slot");
            self.queue.enqueue_priority(&video).await?;
            return Ok(Phase::SlotEnding {
                current,
                end: slot_end,
            });
        }

        self.quotes.quote_once(&current, &video).await?;
        self.slots.post_message(&current, &info.display, false).await?;
        self.clock.wait_until(self.clock.now() + info.duration).await;
        debug!(video = %video, "estimated end of the quotation reached");
        Ok(Phase::ContentLoop { current })
    }

    async fn refill_pick(&self) -> Result<String, LifecycleError> {
        debug!("work queue is empty, refilling");
        match self.queue.take_requests().await? {
            Some(requests) => {
                let winners = {
                    let mut rng = rand::thread_rng();
                    choice_from_requests(&requests, self.policy.fairness_winners, &mut rng)
                };
                if let Some(mut winners) = winners {
                    if let Some(pick) = winners.pop() {
                        self.queue.enqueue_normal(&winners).await?;
                        return Ok(pick);
                    }
                }
                error!(
                    requests = requests.len(),
                    "requests were present but produced no winners; check the request filters"
                );
                Ok(self.selector.random(&self.policy.tags).await?)
            }
            None => Ok(self.selector.random(&self.policy.request_tags).await?),
        }
    }

    async fn finish_slot(
        &self,
        current: String,
        end: DateTime<Utc>,
    ) -> Result<Phase, LifecycleError> {
        self.quotes
            .quote_loop(&current, &self.policy.closing_video)
            .await?;
        self.slots.post_message(&current, CLOSING_NOTICE, true).await?;
        self.clock.wait_until(end).await;
        info!(program = %current, "slot finished");
        Ok(Phase::ReconcileSlots)
    }
}
