//! Inbound dispatch.
//!
//! The dispatcher is the transport's `SessionListener`. It resynchronizes
//! subscriptions whenever a session opens and routes inbound frames:
//!
//! - `distribute` frames go to the matching subscription, then are
//!   acknowledged or rejected
//! - `request` frames go to the checkback handler when transactional, to the
//!   listen handler otherwise
//!
//! Every inbound frame gets exactly one reply when it asks for one. Handler
//! errors and panics never reach the transport.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use folkmq_proto::{batch_subscribe_entity, MqEvent};

use crate::error::{HandlerError, MqError, TransportError};
use crate::publish::ensure_confirmed;
use crate::received::ReceivedMessage;
use crate::subscription::SubscriptionRegistry;
use crate::transport::{Frame, Session, SessionListener};

/// Callback for direct requests and transaction checkbacks.
pub type RequestHandler = Arc<dyn Fn(&ReceivedMessage) -> Result<(), HandlerError> + Send + Sync>;

const NO_CHECKBACK_HANDLER: &str = "Client no checkback handler!";
const NO_REQUEST_HANDLER: &str = "Client no request handler!";

/// A replaceable handler.
#[derive(Default)]
struct HandlerSlot {
    handler: RwLock<Option<RequestHandler>>,
}

impl HandlerSlot {
    fn set(&self, handler: RequestHandler) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn get(&self) -> Option<RequestHandler> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Run a handler, turning a panic into an error.
fn invoke(handler: impl FnOnce() -> Result<(), HandlerError>) -> Result<(), HandlerError> {
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(result) => result,
        Err(payload) => Err(panic_message(payload.as_ref()).into()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {text}")
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("handler panicked: {text}")
    } else {
        "handler panicked".to_string()
    }
}

/// Routes inbound frames and resubscribes on session open.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    listen: HandlerSlot,
    checkback: HandlerSlot,
    resync_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`. `resync_timeout` bounds the batched
    /// subscribe sent when a session opens.
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, resync_timeout: Duration) -> Self {
        Self {
            registry,
            listen: HandlerSlot::default(),
            checkback: HandlerSlot::default(),
            resync_timeout,
        }
    }

    /// Install the handler for direct requests.
    pub fn set_listen_handler(&self, handler: RequestHandler) {
        self.listen.set(handler);
    }

    /// Install the handler for transaction checkbacks.
    pub fn set_checkback_handler(&self, handler: RequestHandler) {
        self.checkback.set(handler);
    }

    /// Route one inbound frame.
    pub fn dispatch(&self, session: Arc<dyn Session>, frame: Frame) {
        match MqEvent::parse(&frame.event) {
            Some(MqEvent::Distribute) => self.on_distribute(&ReceivedMessage::new(session, frame)),
            Some(MqEvent::Request) => self.on_request(&ReceivedMessage::new(session, frame)),
            _ => tracing::debug!(
                event = %frame.event,
                session_id = %session.session_id(),
                "Ignoring inbound frame"
            ),
        }
    }

    fn on_distribute(&self, message: &ReceivedMessage) {
        let Some(subscription) = self
            .registry
            .lookup(message.full_topic(), message.consumer_group())
        else {
            tracing::warn!(
                topic = message.full_topic(),
                consumer_group = message.consumer_group(),
                key = message.key(),
                "No subscription for delivery, rejecting"
            );
            reply(message, false);
            return;
        };

        match invoke(|| subscription.consume(message)) {
            Ok(()) => {
                if subscription.is_auto_ack() {
                    reply(message, true);
                }
            }
            Err(e) => {
                tracing::warn!(
                    queue = subscription.queue_name(),
                    key = message.key(),
                    times = message.times(),
                    error = %e,
                    "Consume handler failed"
                );
                if subscription.is_auto_ack() {
                    reply(message, false);
                }
            }
        }
    }

    fn on_request(&self, message: &ReceivedMessage) {
        let (slot, missing) = if message.is_transaction() {
            (&self.checkback, NO_CHECKBACK_HANDLER)
        } else {
            (&self.listen, NO_REQUEST_HANDLER)
        };

        let Some(handler) = slot.get() else {
            tracing::warn!(key = message.key(), sender = ?message.sender(), "{missing}");
            alarm(message, missing);
            return;
        };

        if let Err(e) = invoke(|| handler(message)) {
            tracing::warn!(
                key = message.key(),
                tmid = ?message.tmid(),
                error = %e,
                "Request handler failed"
            );
            if message.session().is_valid() {
                alarm(message, &format!("Client request handle error: {e}"));
            }
        }
    }

    /// Send the batched subscribe for every registered subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or is not confirmed.
    pub async fn resubscribe(&self, session: &dyn Session) -> Result<(), MqError> {
        if self.registry.is_empty() {
            return Ok(());
        }

        let queues = self.registry.queues_by_topic();
        let entity = batch_subscribe_entity(&queues)?;
        let response = session
            .send_and_request(MqEvent::Subscribe, entity, self.resync_timeout)
            .await?;
        ensure_confirmed("subscribe", &response)?;

        tracing::info!(
            session_id = %session.session_id(),
            topics = queues.len(),
            "Subscriptions restored"
        );
        Ok(())
    }
}

fn reply(message: &ReceivedMessage, is_ok: bool) {
    if let Err(e) = message.acknowledge(is_ok) {
        tracing::warn!(key = message.key(), is_ok, error = %e, "Failed to acknowledge delivery");
    }
}

fn alarm(message: &ReceivedMessage, text: &str) {
    if let Err(e) = message.session().reply_alarm(message.frame(), text) {
        tracing::warn!(key = message.key(), error = %e, "Failed to send alarm");
    }
}

#[async_trait]
impl SessionListener for Dispatcher {
    async fn on_open(&self, session: Arc<dyn Session>) {
        tracing::info!(session_id = %session.session_id(), "Session opened");

        if let Err(e) = self.resubscribe(session.as_ref()).await {
            tracing::error!(
                session_id = %session.session_id(),
                error = %e,
                "Failed to restore subscriptions"
            );
        }
    }

    fn on_message(&self, session: Arc<dyn Session>, frame: Frame) {
        self.dispatch(session, frame);
    }

    fn on_close(&self, session: &dyn Session) {
        tracing::info!(session_id = %session.session_id(), "Session closed");
    }

    fn on_error(&self, session: &dyn Session, error: &TransportError) {
        tracing::warn!(session_id = %session.session_id(), error = %error, "Session error");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use folkmq_proto::{metas, parse_batch_subscribe, Entity, Qos};
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::memory::{MemorySession, Outbound};

    fn dispatcher() -> (Dispatcher, Arc<SubscriptionRegistry>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        (
            Dispatcher::new(registry.clone(), Duration::from_millis(50)),
            registry,
        )
    }

    fn distribute(topic: &str, group: &str) -> Frame {
        Frame::new(
            "sid-1",
            MqEvent::Distribute,
            Entity::from_string("payload")
                .meta_put(metas::TOPIC, topic)
                .meta_put(metas::CONSUMER_GROUP, group)
                .meta_put(metas::KEY, "k1"),
        )
    }

    fn request(tmid: Option<&str>) -> Frame {
        let mut entity = Entity::from_string("ping").meta_put(metas::KEY, "k1");
        if let Some(tmid) = tmid {
            entity.put_meta(metas::TRANSACTION, tmid);
        }
        Frame::new("sid-2", MqEvent::Request, entity)
    }

    fn acks(session: &MemorySession) -> Vec<Option<String>> {
        session
            .outbound()
            .into_iter()
            .filter_map(|out| match out {
                Outbound::Ack { entity, .. } => Some(entity.meta(metas::ACK).map(str::to_string)),
                _ => None,
            })
            .collect()
    }

    fn alarms(session: &MemorySession) -> Vec<String> {
        session
            .outbound()
            .into_iter()
            .filter_map(|out| match out {
                Outbound::Alarm { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn delivery_is_consumed_and_acked() {
        let (dispatcher, registry) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.add(
            "ns:demo",
            "g1",
            true,
            Arc::new(move |message| {
                assert_eq!(message.topic(), "demo");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let session = MemorySession::new("s0");

        dispatcher.dispatch(session.clone(), distribute("ns:demo", "g1"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(acks(&session), vec![Some("1".to_string())]);
    }

    #[test]
    fn unknown_subscription_is_rejected_once() {
        let (dispatcher, _registry) = dispatcher();
        let session = MemorySession::new("s0");

        dispatcher.dispatch(session.clone(), distribute("ns:demo", "g1"));

        assert_eq!(acks(&session), vec![Some("0".to_string())]);
        assert_eq!(session.outbound().len(), 1);
    }

    #[test]
    fn failing_handler_is_rejected() {
        let (dispatcher, registry) = dispatcher();
        registry.add("ns:demo", "g1", true, Arc::new(|_| Err("boom".into())));
        let session = MemorySession::new("s0");

        dispatcher.dispatch(session.clone(), distribute("ns:demo", "g1"));

        assert_eq!(acks(&session), vec![Some("0".to_string())]);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let (dispatcher, registry) = dispatcher();
        registry.add("ns:demo", "g1", true, Arc::new(|_| panic!("handler bug")));
        let session = MemorySession::new("s0");

        dispatcher.dispatch(session.clone(), distribute("ns:demo", "g1"));

        assert_eq!(acks(&session), vec![Some("0".to_string())]);
    }

    #[test]
    fn manual_ack_leaves_reply_to_handler() {
        let (dispatcher, registry) = dispatcher();
        registry.add("ns:demo", "g1", false, Arc::new(|_| Ok(())));
        let session = MemorySession::new("s0");

        dispatcher.dispatch(session.clone(), distribute("ns:demo", "g1"));
        assert!(session.outbound().is_empty());

        registry.add(
            "ns:demo",
            "g1",
            false,
            Arc::new(|message| Ok(message.acknowledge(true)?)),
        );
        dispatcher.dispatch(session.clone(), distribute("ns:demo", "g1"));
        assert_eq!(acks(&session), vec![Some("1".to_string())]);
    }

    #[test]
    fn qos0_delivery_gets_no_reply() {
        let (dispatcher, registry) = dispatcher();
        registry.add("ns:demo", "g1", true, Arc::new(|_| Ok(())));
        let session = MemorySession::new("s0");

        let mut frame = distribute("ns:demo", "g1");
        frame.entity.put_meta(metas::QOS, Qos::AtMostOnce.as_meta());
        dispatcher.dispatch(session.clone(), frame);

        assert!(session.outbound().is_empty());
    }

    #[test]
    fn failed_ack_is_swallowed() {
        let (dispatcher, registry) = dispatcher();
        registry.add("ns:demo", "g1", true, Arc::new(|_| Ok(())));
        let session = MemorySession::new("s0");
        session.fail_replies(true);

        dispatcher.dispatch(session.clone(), distribute("ns:demo", "g1"));

        assert!(session.outbound().is_empty());
    }

    #[test]
    fn failed_alarm_is_swallowed() {
        let (dispatcher, _registry) = dispatcher();
        let session = MemorySession::new("s0");
        session.fail_replies(true);

        dispatcher.dispatch(session.clone(), request(None));
        assert!(session.outbound().is_empty());

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        dispatcher.set_listen_handler(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Err("bad input".into())
        }));
        dispatcher.dispatch(session.clone(), request(None));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(session.outbound().is_empty());

        session.fail_replies(false);
        dispatcher.dispatch(session.clone(), request(None));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            alarms(&session),
            vec!["Client request handle error: bad input".to_string()]
        );
    }

    #[test]
    fn missing_handlers_raise_alarms() {
        let (dispatcher, _registry) = dispatcher();
        let session = MemorySession::new("s0");

        dispatcher.dispatch(session.clone(), request(Some("tm-1")));
        dispatcher.dispatch(session.clone(), request(None));

        assert_eq!(
            alarms(&session),
            vec![NO_CHECKBACK_HANDLER.to_string(), NO_REQUEST_HANDLER.to_string()]
        );
    }

    #[test]
    fn requests_route_by_transaction() {
        let (dispatcher, _registry) = dispatcher();
        let checkbacks = Arc::new(AtomicUsize::new(0));
        let listens = Arc::new(AtomicUsize::new(0));
        let (c, l) = (checkbacks.clone(), listens.clone());
        dispatcher.set_checkback_handler(Arc::new(move |message| {
            assert_eq!(message.tmid(), Some("tm-1"));
            c.fetch_add(1, Ordering::SeqCst);
            Ok(message.acknowledge(true)?)
        }));
        dispatcher.set_listen_handler(Arc::new(move |_| {
            l.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let session = MemorySession::new("s0");

        dispatcher.dispatch(session.clone(), request(Some("tm-1")));
        dispatcher.dispatch(session.clone(), request(None));

        assert_eq!(checkbacks.load(Ordering::SeqCst), 1);
        assert_eq!(listens.load(Ordering::SeqCst), 1);
        assert!(alarms(&session).is_empty());
    }

    #[test]
    fn request_handler_error_raises_alarm() {
        let (dispatcher, _registry) = dispatcher();
        dispatcher.set_listen_handler(Arc::new(|_| Err("bad input".into())));
        let session = MemorySession::new("s0");

        dispatcher.dispatch(session.clone(), request(None));

        assert_eq!(
            alarms(&session),
            vec!["Client request handle error: bad input".to_string()]
        );
    }

    #[test]
    fn unknown_events_are_ignored() {
        let (dispatcher, _registry) = dispatcher();
        let session = MemorySession::new("s0");

        let frame = Frame {
            sid: "sid-3".to_string(),
            event: "heartbeat".to_string(),
            entity: Entity::new(),
        };
        dispatcher.dispatch(session.clone(), frame);

        assert!(session.outbound().is_empty());
    }

    #[tokio::test]
    async fn resubscribe_batches_every_queue() {
        let (dispatcher, registry) = dispatcher();
        registry.add("ns:a", "g1", true, Arc::new(|_| Ok(())));
        registry.add("ns:a", "g2", true, Arc::new(|_| Ok(())));
        registry.add("ns:b", "g1", true, Arc::new(|_| Ok(())));
        let session = MemorySession::new("s0");

        assert_ok!(dispatcher.resubscribe(session.as_ref()).await);

        let outbound = session.outbound();
        assert_eq!(outbound.len(), 1);
        let Outbound::Request { event, entity } = &outbound[0] else {
            panic!("expected a request, got {outbound:?}");
        };
        assert_eq!(*event, MqEvent::Subscribe);
        assert_eq!(entity.meta(metas::BATCH), Some("1"));
        let queues = assert_ok!(parse_batch_subscribe(entity));
        assert_eq!(queues, registry.queues_by_topic());
    }

    #[tokio::test]
    async fn resubscribe_without_subscriptions_is_silent() {
        let (dispatcher, _registry) = dispatcher();
        let session = MemorySession::new("s0");

        dispatcher.on_open(session.clone()).await;

        assert!(session.outbound().is_empty());
    }

    #[tokio::test]
    async fn unconfirmed_resubscribe_fails() {
        let (dispatcher, registry) = dispatcher();
        registry.add("ns:a", "g1", true, Arc::new(|_| Ok(())));
        let session = MemorySession::with_responder(
            "s0",
            Arc::new(|_, _| Some(Entity::new().meta_put(metas::CONFIRM, "0"))),
        );

        let err = assert_err!(dispatcher.resubscribe(session.as_ref()).await);
        assert!(matches!(err, MqError::ConfirmFailed { operation: "subscribe", .. }));
    }
}
