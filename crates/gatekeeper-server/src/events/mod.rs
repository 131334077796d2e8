//! Change-notification bus carrying administrative events.
//!
//! Two backends:
//! - `Redis`: `PUBLISH` through the pool, and one dedicated pub/sub connection
//!   per subscribed topic that reconnects with exponential backoff
//! - `Local`: a tokio broadcast channel per topic, for single-instance runs

pub mod listener;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use deadpool_redis::Pool;
use gatekeeper_core::{ChangeEvent, CoreError, Topic};
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub use listener::{InvalidationListener, apply_event};

const LOCAL_CAPACITY: usize = 256;
const SUBSCRIPTION_BUFFER: usize = 256;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Reconnect delay: doubles per failure up to [`MAX_BACKOFF`], back to
/// [`INITIAL_BACKOFF`] once a subscription is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Backoff(Duration);

impl Backoff {
    fn new() -> Self {
        Self(INITIAL_BACKOFF)
    }

    fn current(&self) -> Duration {
        self.0
    }

    fn fail(&mut self) {
        self.0 = (self.0 * 2).min(MAX_BACKOFF);
    }

    fn reset(&mut self) {
        self.0 = INITIAL_BACKOFF;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("event codec error: {0}")]
    Codec(#[from] CoreError),

    #[error("pub/sub connection closed")]
    Closed,
}

pub struct RedisBus {
    pool: Pool,
    url: String,
    namespace: Option<String>,
}

#[derive(Default)]
pub struct LocalBus {
    channels: DashMap<Topic, broadcast::Sender<String>>,
}

impl LocalBus {
    fn sender(&self, topic: Topic) -> broadcast::Sender<String> {
        self.channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(LOCAL_CAPACITY).0)
            .clone()
    }
}

#[derive(Clone)]
pub enum ChangeBus {
    Redis(Arc<RedisBus>),
    Local(Arc<LocalBus>),
}

impl ChangeBus {
    pub fn local() -> Self {
        ChangeBus::Local(Arc::new(LocalBus::default()))
    }

    pub fn redis(pool: Pool, url: impl Into<String>, namespace: Option<String>) -> Self {
        ChangeBus::Redis(Arc::new(RedisBus {
            pool,
            url: url.into(),
            namespace,
        }))
    }

    pub fn mode(&self) -> &'static str {
        match self {
            ChangeBus::Redis(_) => "redis",
            ChangeBus::Local(_) => "local",
        }
    }

    /// Publishes `event` on its topic. Returns the number of receivers reached.
    pub async fn publish(&self, event: &ChangeEvent) -> Result<usize, BusError> {
        let topic = event.topic();
        let payload = event.encode()?;
        match self {
            ChangeBus::Local(bus) => Ok(bus.sender(topic).send(payload).unwrap_or(0)),
            ChangeBus::Redis(bus) => {
                let channel = topic.channel(bus.namespace.as_deref());
                let mut conn = bus.pool.get().await?;
                let receivers: usize = conn.publish(&channel, payload).await?;
                tracing::debug!(channel = %channel, receivers, "event published");
                Ok(receivers)
            }
        }
    }

    /// Raw payloads published on `topic` until `token` is cancelled.
    ///
    /// The subscription is registered before this returns for the local
    /// backend; the Redis backend subscribes asynchronously.
    pub fn subscribe(&self, topic: Topic, token: CancellationToken) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        match self {
            ChangeBus::Local(bus) => {
                let mut source = bus.sender(topic).subscribe();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            received = source.recv() => match received {
                                Ok(payload) => {
                                    if tx.send(payload).await.is_err() {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    tracing::warn!(topic = %topic, skipped, "subscriber lagged, events dropped");
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    }
                });
            }
            ChangeBus::Redis(bus) => {
                let bus = Arc::clone(bus);
                tokio::spawn(async move {
                    bus.run_with_reconnect(topic, tx, token).await;
                });
            }
        }
        rx
    }
}

impl RedisBus {
    async fn run_with_reconnect(
        &self,
        topic: Topic,
        tx: mpsc::Sender<String>,
        token: CancellationToken,
    ) {
        let channel = topic.channel(self.namespace.as_deref());
        let mut backoff = Backoff::new();

        loop {
            match self.run(&channel, &tx, &token, &mut backoff).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!(
                        channel = %channel,
                        error = %e,
                        backoff_secs = backoff.current().as_secs(),
                        "pub/sub subscription error, reconnecting"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(backoff.current()) => {}
                    }
                    backoff.fail();
                }
            }
        }
        tracing::debug!(channel = %channel, "pub/sub subscription ended");
    }

    /// Returns `Ok` when cancelled or when the receiver is gone.
    async fn run(
        &self,
        channel: &str,
        tx: &mpsc::Sender<String>,
        token: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<(), BusError> {
        use futures_util::StreamExt;

        let client = redis::Client::open(self.url.clone())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        backoff.reset();
        tracing::info!(channel, "subscribed");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                message = stream.next() => match message {
                    Some(msg) => match msg.get_payload::<String>() {
                        Ok(payload) => {
                            if tx.send(payload).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            tracing::warn!(channel, error = %e, "unreadable pub/sub payload");
                        }
                    },
                    None => return Err(BusError::Closed),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_core::EndpointDeletedEvent;

    #[tokio::test]
    async fn test_local_publish_reaches_subscriber() {
        let bus = ChangeBus::local();
        let token = CancellationToken::new();
        let mut rx = bus.subscribe(Topic::EndpointDeleted, token.clone());

        let event = ChangeEvent::EndpointDeleted(EndpointDeletedEvent { code: "E1".into() });
        assert_eq!(bus.publish(&event).await.unwrap(), 1);

        let payload = rx.recv().await.unwrap();
        assert_eq!(
            ChangeEvent::decode(Topic::EndpointDeleted, &payload).unwrap(),
            event
        );
        token.cancel();
    }

    #[test]
    fn test_backoff_caps_and_resets() {
        let mut backoff = Backoff::new();
        for _ in 0..20 {
            backoff.fail();
        }
        assert_eq!(backoff.current(), MAX_BACKOFF);

        backoff.reset();
        assert_eq!(backoff.current(), INITIAL_BACKOFF);
        backoff.fail();
        assert_eq!(backoff.current(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = ChangeBus::local();
        let event = ChangeEvent::EndpointDeleted(EndpointDeletedEvent { code: "E1".into() });
        assert_eq!(bus.publish(&event).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = ChangeBus::local();
        let token = CancellationToken::new();
        let mut rx = bus.subscribe(Topic::EndpointCreated, token.clone());

        let event = ChangeEvent::EndpointDeleted(EndpointDeletedEvent { code: "E1".into() });
        bus.publish(&event).await.unwrap();

        let next = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(next.is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn test_cancel_closes_receiver() {
        let bus = ChangeBus::local();
        let token = CancellationToken::new();
        let mut rx = bus.subscribe(Topic::PricingModified, token.clone());
        token.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }
}
