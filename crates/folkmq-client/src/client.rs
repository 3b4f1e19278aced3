//! Client facade.
//!
//! `MqClient` owns the client identity and composes the subscription
//! registry, publish engine, transaction coordinator and dispatcher over a
//! transport `Connector`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use folkmq_proto::{check_meta, full_topic, metas, Entity, MqEvent, MqMessage, Qos, VERSION_CODE};
use tokio::sync::Mutex;
use url::Url;

use crate::config::ClientSettings;
use crate::connection::Connection;
use crate::dispatcher::{Dispatcher, RequestHandler};
use crate::error::{HandlerError, MqError};
use crate::publish::{ensure_confirmed, PublishEngine};
use crate::received::ReceivedMessage;
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::transaction::{MqTransaction, TransactionCoordinator};
use crate::transport::{Connector, Session, SessionConfig};

/// Hook invoked on every connect to customize transport settings.
pub type ConfigHook = Arc<dyn Fn(&mut SessionConfig) + Send + Sync>;

/// Client name and topic namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Client name
    pub name: Option<String>,
    /// Topic namespace
    pub namespace: Option<String>,
}

/// Rewrite a `folkmq` url into the transport url form.
///
/// `folkmq://host:port` becomes `sd:tcp://host:port`; `folkmq:ws://..` and
/// `folkmq:wss://..` become `sd:ws://..` and `sd:wss://..`.
///
/// # Errors
///
/// Returns `MqError::Invalid` for other schemes or urls without a host.
pub fn rewrite_url(input: &str) -> Result<String, MqError> {
    let transport_url = if let Some(rest) = input.strip_prefix("folkmq://") {
        format!("tcp://{rest}")
    } else if let Some(rest) = input.strip_prefix("folkmq:") {
        rest.to_string()
    } else {
        return Err(MqError::Invalid(format!("{input}: unsupported scheme")));
    };

    let url = Url::parse(&transport_url).map_err(|e| MqError::Invalid(format!("{input}: {e}")))?;

    match url.scheme() {
        "tcp" | "ws" | "wss" => {}
        scheme => {
            return Err(MqError::Invalid(format!(
                "{input}: unsupported scheme '{scheme}'"
            )));
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(MqError::Invalid(format!("{input}: missing host")));
    }

    Ok(format!("sd:{transport_url}"))
}

fn validate(value: &str, name: &str) -> Result<(), MqError> {
    check_meta(value, name).map_err(MqError::Invalid)
}

/// A FolkMQ client.
pub struct MqClient {
    server_urls: Vec<String>,
    connector: Arc<dyn Connector>,
    identity: RwLock<ClientIdentity>,
    auto_ack: AtomicBool,
    config_hook: RwLock<Option<ConfigHook>>,
    request_timeout: Duration,
    subscribe_timeout: Duration,
    heartbeat_interval: Duration,
    connection: Arc<Connection>,
    connect_lock: Mutex<()>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    publisher: PublishEngine,
    transactions: Arc<TransactionCoordinator>,
}

impl MqClient {
    /// Create a client for `server_urls` with default settings.
    #[must_use]
    pub fn new<I, S>(connector: Arc<dyn Connector>, server_urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let settings = ClientSettings {
            server_urls: server_urls.into_iter().map(Into::into).collect(),
            ..ClientSettings::default()
        };
        Self::from_settings(connector, &settings)
    }

    /// Create a client from loaded settings.
    #[must_use]
    pub fn from_settings(connector: Arc<dyn Connector>, settings: &ClientSettings) -> Self {
        let connection = Arc::new(Connection::new());
        let registry = Arc::new(SubscriptionRegistry::new());

        Self {
            server_urls: settings.server_urls.clone(),
            connector,
            identity: RwLock::new(ClientIdentity {
                name: settings.name.clone(),
                namespace: settings.namespace.clone(),
            }),
            auto_ack: AtomicBool::new(settings.auto_ack),
            config_hook: RwLock::new(None),
            request_timeout: settings.request_timeout,
            subscribe_timeout: settings.subscribe_timeout,
            heartbeat_interval: settings.heartbeat_interval,
            dispatcher: Arc::new(Dispatcher::new(registry.clone(), settings.subscribe_timeout)),
            publisher: PublishEngine::new(connection.clone()),
            transactions: Arc::new(TransactionCoordinator::new(connection.clone())),
            connection,
            connect_lock: Mutex::new(()),
            registry,
        }
    }

    /// Set the client name.
    #[must_use]
    pub fn name_as(self, name: impl Into<String>) -> Self {
        self.set_name(name);
        self
    }

    /// Set the topic namespace.
    #[must_use]
    pub fn namespace_as(self, namespace: impl Into<String>) -> Self {
        self.set_namespace(namespace);
        self
    }

    /// Set the default acknowledgment mode of new subscriptions.
    #[must_use]
    pub fn auto_acknowledge(self, auto_ack: bool) -> Self {
        self.auto_ack.store(auto_ack, Ordering::SeqCst);
        self
    }

    /// Install a hook run on every connect, after the protocol defaults are
    /// applied.
    #[must_use]
    pub fn config<F>(self, hook: F) -> Self
    where
        F: Fn(&mut SessionConfig) + Send + Sync + 'static,
    {
        *self
            .config_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
        self
    }

    /// Assign the client name. Takes effect for the next connect.
    pub fn set_name(&self, name: impl Into<String>) {
        self.identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .name = Some(name.into()).filter(|name: &String| !name.is_empty());
    }

    /// Assign the topic namespace. Takes effect for topics qualified from now
    /// on. A namespace holding reserved characters is stored as given and
    /// rejected by `connect` and every topic operation.
    pub fn set_namespace(&self, namespace: impl Into<String>) {
        self.identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .namespace = Some(namespace.into()).filter(|ns: &String| !ns.is_empty());
    }

    /// Current identity.
    #[must_use]
    pub fn identity(&self) -> ClientIdentity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Client name.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.identity().name
    }

    /// Topic namespace.
    #[must_use]
    pub fn namespace(&self) -> Option<String> {
        self.identity().namespace
    }

    /// Whether `connect` completed and `disconnect` has not been called.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Active subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.registry.snapshot()
    }

    fn checked_namespace(&self) -> Result<Option<String>, MqError> {
        let namespace = self.namespace();
        if let Some(namespace) = &namespace {
            validate(namespace, "namespace")?;
        }
        Ok(namespace)
    }

    fn full_topic(&self, topic: &str) -> Result<String, MqError> {
        let namespace = self.checked_namespace()?;
        Ok(full_topic(namespace.as_deref().unwrap_or(""), topic))
    }

    fn require_name(&self) -> Result<String, MqError> {
        self.name()
            .ok_or_else(|| MqError::Invalid("client name is required".to_string()))
    }

    fn session_config(&self) -> SessionConfig {
        let identity = self.identity();
        let mut config = SessionConfig {
            heartbeat_interval: self.heartbeat_interval,
            request_timeout: self.request_timeout,
            ..SessionConfig::default()
        };

        config.meta_put(metas::VERSION, VERSION_CODE.to_string());
        if let Some(name) = identity.name {
            config.meta_put(metas::AT, name);
        }
        if let Some(namespace) = identity.namespace {
            config.meta_put(metas::NAMESPACE, namespace);
        }

        let hook = self
            .config_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(&mut config);
        }

        config
    }

    /// Open the session group. Existing subscriptions are restored on every
    /// session as it opens.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Invalid` for malformed urls or namespace, or the
    /// transport error if no connection can be established.
    pub async fn connect(&self) -> Result<(), MqError> {
        let _connecting = self.connect_lock.lock().await;
        if self.connection.is_connected() {
            tracing::warn!("Client already connected");
            return Ok(());
        }

        if self.server_urls.is_empty() {
            return Err(MqError::Invalid("server urls can't be empty".to_string()));
        }
        self.checked_namespace()?;
        let urls = self
            .server_urls
            .iter()
            .map(|url| rewrite_url(url))
            .collect::<Result<Vec<_>, _>>()?;

        let config = self.session_config();
        let request_timeout = config.request_timeout;
        let group = self
            .connector
            .open(&urls, config, self.dispatcher.clone())
            .await?;
        self.connection.attach(group, request_timeout);

        tracing::info!(urls = ?urls, name = ?self.name(), "Client connected");
        Ok(())
    }

    /// Close the session group. Subscriptions stay registered and are restored
    /// by the next `connect`.
    pub async fn disconnect(&self) {
        let _connecting = self.connect_lock.lock().await;
        if let Some(group) = self.connection.detach() {
            group.close().await;
            tracing::info!(name = ?self.name(), "Client disconnected");
        }
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// `consumer_group` defaults to the client name and `auto_ack` to the
    /// client-wide mode. The subscription is registered before any network
    /// call, so it is restored on reconnect even if the broker cannot be
    /// reached now. While a `connect` is in progress the call waits for it, so
    /// the subscription is either restored by the opening sessions or sent to
    /// them once attached.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Invalid` for malformed parameters, or the first
    /// failure among the sessions of the group.
    pub async fn subscribe<F>(
        &self,
        topic: &str,
        consumer_group: Option<&str>,
        auto_ack: Option<bool>,
        handler: F,
    ) -> Result<(), MqError>
    where
        F: Fn(&ReceivedMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let consumer_group = self.consumer_group(consumer_group)?;
        validate(topic, "topic")?;
        validate(&consumer_group, "consumerGroup")?;

        let full_topic = self.full_topic(topic)?;

        let auto_ack = auto_ack.unwrap_or_else(|| self.auto_ack.load(Ordering::SeqCst));
        let sessions = {
            let _connecting = self.connect_lock.lock().await;
            self.registry
                .add(&full_topic, &consumer_group, auto_ack, Arc::new(handler));
            self.connection.all_sessions()
        };

        self.broadcast_subscription(sessions, MqEvent::Subscribe, &full_topic, &consumer_group)
            .await
    }

    /// Remove the subscription of `consumer_group` on `topic`.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Invalid` for malformed parameters, or the first
    /// failure among the sessions of the group.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        consumer_group: Option<&str>,
    ) -> Result<(), MqError> {
        let consumer_group = self.consumer_group(consumer_group)?;
        validate(topic, "topic")?;
        validate(&consumer_group, "consumerGroup")?;

        let full_topic = self.full_topic(topic)?;
        let sessions = {
            let _connecting = self.connect_lock.lock().await;
            self.registry.remove(&full_topic, &consumer_group);
            self.connection.all_sessions()
        };

        self.broadcast_subscription(sessions, MqEvent::Unsubscribe, &full_topic, &consumer_group)
            .await
    }

    fn consumer_group(&self, consumer_group: Option<&str>) -> Result<String, MqError> {
        match consumer_group {
            Some(group) => Ok(group.to_string()),
            None => self
                .name()
                .ok_or_else(|| MqError::Invalid("consumerGroup or client name is required".to_string())),
        }
    }

    async fn broadcast_subscription(
        &self,
        sessions: Vec<Arc<dyn Session>>,
        event: MqEvent,
        full_topic: &str,
        consumer_group: &str,
    ) -> Result<(), MqError> {
        let operation = event.as_str();

        for session in sessions {
            let entity = Entity::new()
                .meta_put(metas::TOPIC, full_topic)
                .meta_put(metas::CONSUMER_GROUP, consumer_group)
                .at(metas::BROKER_AT_SERVER_ALL);

            let response = session
                .send_and_request(event, entity, self.subscribe_timeout)
                .await?;
            ensure_confirmed(operation, &response)?;

            tracing::info!(
                topic = full_topic,
                consumer_group,
                session_id = %session.session_id(),
                "Client {operation} successfully"
            );
        }

        Ok(())
    }

    /// Publish `message` on `topic`.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Invalid` for malformed parameters, a connectivity
    /// error if no session is reachable, or `MqError::ConfirmFailed` if the
    /// broker rejects a QoS 1 message.
    pub async fn publish(&self, topic: &str, message: MqMessage) -> Result<(), MqError> {
        validate(topic, "topic")?;
        validate(message.get_key(), "key")?;

        self.publisher
            .publish(&self.full_topic(topic)?, &message)
            .await
    }

    /// Withdraw the undelivered message `key` from `topic`.
    ///
    /// # Errors
    ///
    /// Same as `publish`.
    pub async fn unpublish(&self, topic: &str, key: &str) -> Result<(), MqError> {
        validate(topic, "topic")?;
        validate(key, "key")?;

        self.publisher.unpublish(&self.full_topic(topic)?, key).await
    }

    /// Send `message` directly to the client named `to_name`.
    ///
    /// QoS 1 waits for the peer's reply, bounded by `timeout` or the request
    /// timeout, and returns it. QoS 0 returns `None` immediately.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Invalid` without a client name, a connectivity error
    /// if no session is reachable, `TransportError::Alarm` if the peer answers
    /// with an alarm, or `MqError::ConfirmFailed` if the peer rejects it.
    pub async fn send(
        &self,
        message: MqMessage,
        to_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Entity>, MqError> {
        let name = self.require_name()?;
        validate(to_name, "toName")?;

        let session = self.connection.session(None)?;
        let message = message.sender(name);
        let mut entity = message.to_publish_entity("");
        entity.put_meta(metas::CONSUMER_GROUP, to_name);
        let entity = entity.at(to_name);

        match message.get_qos() {
            Qos::AtLeastOnce => {
                let timeout = match timeout {
                    Some(timeout) => timeout,
                    None => self.connection.request_timeout()?,
                };
                let response = session
                    .send_and_request(MqEvent::Request, entity, timeout)
                    .await?;

                if response.meta(metas::ACK) == Some("0") {
                    return Err(MqError::ConfirmFailed {
                        operation: "send",
                        message: response.data_as_string(),
                    });
                }

                tracing::debug!(to = to_name, key = message.get_key(), "Request answered");
                Ok(Some(response))
            }
            Qos::AtMostOnce => {
                session.send(MqEvent::Request, entity)?;
                Ok(None)
            }
        }
    }

    /// Register the handler for direct requests from other clients.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Invalid` without a client name.
    pub fn listen<F>(&self, handler: F) -> Result<(), MqError>
    where
        F: Fn(&ReceivedMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.require_name()?;
        let handler: RequestHandler = Arc::new(handler);
        self.dispatcher.set_listen_handler(handler);
        Ok(())
    }

    /// Register the handler answering the broker's transaction checkbacks.
    pub fn transaction_checkback<F>(&self, handler: F)
    where
        F: Fn(&ReceivedMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let handler: RequestHandler = Arc::new(handler);
        self.dispatcher.set_checkback_handler(handler);
    }

    /// Start a transaction.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Invalid` without a client name.
    pub fn new_transaction(&self) -> Result<MqTransaction, MqError> {
        self.require_name()?;
        Ok(MqTransaction::new(self.transactions.clone()))
    }
}
