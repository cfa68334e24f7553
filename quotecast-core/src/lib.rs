pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod platform;
pub mod queue;
pub mod schedule;
pub mod selection;
pub mod session;

pub use clock::{Clock, SystemClock};
pub use config::{load_config, QuotecastConfig};
pub use error::{ConfigError, Result};
pub use lifecycle::{Lifecycle, LifecycleError, LifecyclePolicy, Phase};
pub use platform::live::{
    HttpLiveTransport, LiveService, LiveState, LiveTransport, ReservationSettings, SlotService,
};
pub use platform::quotation::{
    HttpQuotationTransport, QuotationClient, QuotationService, QuotationTransport, VideoInfo,
};
pub use platform::retry::{NoRefresh, Relogin, RetryPolicy};
pub use platform::{PlatformError, PlatformResult};
pub use queue::{ContentQueue, HttpQueueTransport, QueueTransport, RestQueueStore};
pub use schedule::BroadcastSchedule;
pub use selection::{
    choice_from_requests, HttpSearchTransport, SearchTransport, SelectionSettings, Selector,
    VideoSelector,
};
pub use session::{Credentials, Session};
