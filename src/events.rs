use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

/// key: event-bus -> in-process topic fan-out for automation
///
/// Delivery is asynchronous and at-most-once: `publish` hands the event to a
/// per-topic dispatch task and returns; subscriber failures are logged and
/// never propagate to the publisher. Order is preserved per topic.
#[derive(Debug, Clone)]
pub enum Event {
    OrderPaymentSucceeded {
        business_id: Uuid,
        order_id: Uuid,
        order_total: Decimal,
        currency: String,
        occurred_on: NaiveDate,
    },
    OnboardingPaymentSucceeded {
        session_token: String,
        provider_subscription_id: String,
    },
    SubscriptionStatusChanged {
        workspace_id: Uuid,
        status: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    OrderPaymentSucceeded,
    OnboardingPaymentSucceeded,
    SubscriptionStatusChanged,
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::OrderPaymentSucceeded { .. } => Topic::OrderPaymentSucceeded,
            Event::OnboardingPaymentSucceeded { .. } => Topic::OnboardingPaymentSucceeded,
            Event::SubscriptionStatusChanged { .. } => Topic::SubscriptionStatusChanged,
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

#[derive(Default)]
pub struct EventBusBuilder {
    subscribers: HashMap<Topic, Vec<Handler>>,
}

impl EventBusBuilder {
    pub fn subscribe<F>(&mut self, topic: Topic, handler: F)
    where
        F: Fn(Event) -> HandlerFuture + Send + Sync + 'static,
    {
        self.subscribers
            .entry(topic)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Spawn one dispatch task per topic. Within a topic, subscribers run
    /// sequentially per event so publish order equals delivery order.
    pub fn start(self) -> EventBus {
        let mut senders = HashMap::new();
        for (topic, handlers) in self.subscribers {
            let (tx, mut rx) = mpsc::channel::<Event>(64);
            senders.insert(topic, tx);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    for handler in &handlers {
                        if let Err(err) = handler(event.clone()).await {
                            tracing::error!(?err, topic = ?event.topic(), "event subscriber failed");
                        }
                    }
                }
            });
        }
        EventBus {
            senders: Arc::new(senders),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    senders: Arc<HashMap<Topic, mpsc::Sender<Event>>>,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// Enqueue for delivery. A topic nobody subscribed to is a silent no-op;
    /// a full queue drops the event after logging (at-most-once).
    pub async fn publish(&self, event: Event) {
        let topic = event.topic();
        let Some(sender) = self.senders.get(&topic) else {
            tracing::debug!(?topic, "event published with no subscribers");
            return;
        };
        if let Err(err) = sender.try_send(event) {
            tracing::warn!(?topic, ?err, "event dropped");
        }
    }
}
