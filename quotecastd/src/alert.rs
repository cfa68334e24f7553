use std::fmt::Write as _;

use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Mirrors WARN-and-above events to an operator-facing webhook. Delivery is
/// best-effort through a background forwarder; the alert channel must never
/// take the broadcast down.
pub struct WebhookLayer {
    tx: UnboundedSender<String>,
}

impl WebhookLayer {
    /// Spawns the forwarder task on the current runtime.
    pub fn new(webhook_url: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let client = reqwest::Client::new();
        tokio::spawn(async move {
            while let Some(content) = rx.recv().await {
                let payload = serde_json::json!({ "content": content });
                let _ = client.post(&webhook_url).json(&payload).send().await;
            }
        });
        Self { tx }
    }
}

impl<S: Subscriber> Layer<S> for WebhookLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > Level::WARN {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let mut content = format!(
            "**{}** @ `{}`",
            event.metadata().level(),
            event.metadata().target()
        );
        if !visitor.rendered.is_empty() {
            let _ = write!(content, "\n{}", visitor.rendered);
        }
        let _ = self.tx.send(content);
    }
}

#[derive(Default)]
struct MessageVisitor {
    rendered: String,
}

impl MessageVisitor {
    fn separate(&mut self) {
        if !self.rendered.is_empty() {
            self.rendered.push(' ');
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.separate();
        if field.name() == "message" {
            self.rendered.push_str(value);
        } else {
            let _ = write!(self.rendered, "{}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.separate();
        if field.name() == "message" {
            let _ = write!(self.rendered, "{value:?}");
        } else {
            let _ = write!(self.rendered, "{}={:?}", field.name(), value);
        }
    }
}
