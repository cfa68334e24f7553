pub mod alert;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use quotecast_core::{
    load_config, BroadcastSchedule, ContentQueue, Credentials, HttpLiveTransport,
    HttpQueueTransport, HttpQuotationTransport, HttpSearchTransport, Lifecycle, LifecyclePolicy,
    LiveService, QuotationClient, QuotationService, Relogin, ReservationSettings, RestQueueStore,
    SelectionSettings, Selector, Session, SlotService, SystemClock, VideoSelector,
};

use alert::WebhookLayer;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] quotecast_core::ConfigError),
    #[error("platform error: {0}")]
    Platform(#[from] quotecast_core::PlatformError),
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] quotecast_core::LifecycleError),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Unattended quotation broadcast daemon", long_about = None)]
pub struct Cli {
    /// Path to the quotecast.toml configuration
    #[arg(long, default_value = "quotecast.toml")]
    pub config: PathBuf,
    /// Tracing filter override (EnvFilter syntax)
    #[arg(long)]
    pub log_filter: Option<String>,
}

fn init_tracing(filter_override: Option<&str>, webhook_url: Option<String>) {
    let filter = match filter_override {
        Some(spec) => EnvFilter::new(spec),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    match webhook_url {
        Some(url) => registry.with(WebhookLayer::new(url)).init(),
        None => registry.init(),
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    init_tracing(cli.log_filter.as_deref(), config.alert.webhook_url.clone());
    info!(config = %cli.config.display(), "quotecastd starting");

    let credentials = Credentials::from_section(&config.session)?;
    let session = Arc::new(Session::new(&config.platform, credentials)?);

    let live_transport = Arc::new(HttpLiveTransport::new(
        Arc::clone(&session),
        &config.platform,
    )?);
    let slots: Arc<dyn SlotService> = Arc::new(LiveService::new(
        live_transport,
        Arc::clone(&session) as Arc<dyn Relogin>,
        BroadcastSchedule::from_config(&config.schedule),
        ReservationSettings::from_config(&config.platform, &config.content),
    ));

    let quotation_transport = Arc::new(HttpQuotationTransport::new(
        Arc::clone(&session),
        &config.platform,
    )?);
    let quotes: Arc<dyn QuotationService> = Arc::new(QuotationClient::new(
        quotation_transport,
        Arc::clone(&session) as Arc<dyn Relogin>,
        config.content.ng_tags.iter().cloned(),
    ));

    let queue: Arc<dyn ContentQueue> = Arc::new(RestQueueStore::new(Arc::new(
        HttpQueueTransport::new(&config.store)?,
    )));

    let selector: Arc<dyn VideoSelector> = Arc::new(Selector::new(
        Arc::new(HttpSearchTransport::new(&config.platform)?),
        Arc::clone(&quotes),
        Arc::clone(&session) as Arc<dyn Relogin>,
        SelectionSettings::from_config(&config.content, &config.fillers),
    ));

    let lifecycle = Lifecycle::new(
        slots,
        quotes,
        queue,
        selector,
        Arc::new(SystemClock),
        LifecyclePolicy::from_config(&config.content, &config.fillers),
    );

    session.login().await?;
    lifecycle.run().await?;
    Ok(())
}
