use rumqttc::QoS;
use std::future::{self, Future};
use std::pin::Pin;

use super::error::TransportError;
use super::message::Payload;

/// Locally assigned, process-unique id for an accepted publish.
pub type PublishId = u64;

pub type PublishFuture<'a> =
    Pin<Box<dyn Future<Output = Result<PublishId, TransportError>> + Send + 'a>>;

/// Anything that can put a message on the broker.
///
/// The session client is the production implementation. Gateways and the
/// replay engine only see this trait.
pub trait Publisher: Send + Sync {
    fn publish_message(
        &self,
        topic: &str,
        payload: Payload,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishId, TransportError>;

    /// Like [`Publisher::publish_message`], but waits for room in the
    /// outgoing queue instead of failing when it is full. Long bursts
    /// (replays) go through here.
    fn publish_awaiting<'a>(
        &'a self,
        topic: &'a str,
        payload: Payload,
        qos: QoS,
        retain: bool,
    ) -> PublishFuture<'a> {
        Box::pin(future::ready(
            self.publish_message(topic, payload, qos, retain),
        ))
    }
}

impl<P: Publisher + ?Sized> Publisher for std::sync::Arc<P> {
    fn publish_message(
        &self,
        topic: &str,
        payload: Payload,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishId, TransportError> {
        (**self).publish_message(topic, payload, qos, retain)
    }

    fn publish_awaiting<'a>(
        &'a self,
        topic: &'a str,
        payload: Payload,
        qos: QoS,
        retain: bool,
    ) -> PublishFuture<'a> {
        (**self).publish_awaiting(topic, payload, qos, retain)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct Published {
        pub topic: String,
        pub payload: Payload,
        pub qos: QoS,
        pub retain: bool,
        pub at: tokio::time::Instant,
    }

    /// In-memory publisher that records everything and can be told to fail.
    /// With `queue_full` set the non-blocking path is refused while the
    /// awaiting path still goes through, like a saturated client queue.
    #[derive(Default)]
    pub struct MemoryPublisher {
        pub sent: Mutex<Vec<Published>>,
        fail: AtomicBool,
        queue_full: AtomicBool,
        seq: AtomicU64,
    }

    impl MemoryPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn set_queue_full(&self, full: bool) {
            self.queue_full.store(full, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<Published> {
            self.sent.lock().unwrap().clone()
        }

        fn accept(
            &self,
            topic: &str,
            payload: Payload,
            qos: QoS,
            retain: bool,
        ) -> Result<PublishId, TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().unwrap().push(Published {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
                at: tokio::time::Instant::now(),
            });
            Ok(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    impl Publisher for MemoryPublisher {
        fn publish_message(
            &self,
            topic: &str,
            payload: Payload,
            qos: QoS,
            retain: bool,
        ) -> Result<PublishId, TransportError> {
            if self.queue_full.load(Ordering::SeqCst) {
                return Err(TransportError::Publish {
                    topic: topic.to_string(),
                    reason: "request channel full".into(),
                });
            }
            self.accept(topic, payload, qos, retain)
        }

        fn publish_awaiting<'a>(
            &'a self,
            topic: &'a str,
            payload: Payload,
            qos: QoS,
            retain: bool,
        ) -> PublishFuture<'a> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.accept(topic, payload, qos, retain)
            })
        }
    }
}
