use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl MqttSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            client_id: config.mqtt_client_id.clone(),
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            keep_alive: Duration::from_secs(10),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MqttMessage {
    pub fn json(&self) -> Result<JsonValue> {
        serde_json::from_slice(&self.payload)
            .with_context(|| format!("payload on {} is not json", self.topic))
    }
}

struct Route {
    filter: String,
    tx: mpsc::Sender<MqttMessage>,
}

type Routes = Arc<Mutex<HashMap<u64, Route>>>;

fn lock_routes(routes: &Routes) -> std::sync::MutexGuard<'_, HashMap<u64, Route>> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// MQTT topic filter match with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Filters to re-send after a ConnAck. Requests queued before the first
/// connection go out on their own, and a resumed session keeps its filters.
fn filters_to_restore(routes: &Routes, first_connect: bool, session_present: bool) -> Vec<String> {
    if first_connect || session_present {
        return Vec::new();
    }
    let mut filters: Vec<String> = lock_routes(routes)
        .values()
        .map(|route| route.filter.clone())
        .collect();
    filters.sort();
    filters.dedup();
    filters
}

fn dispatch(routes: &Routes, topic: &str, payload: &[u8]) {
    let mut guard = lock_routes(routes);
    let mut closed = Vec::new();
    for (id, route) in guard.iter() {
        if !topic_matches(&route.filter, topic) {
            continue;
        }
        let message = MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        match route.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(topic, filter = %route.filter, "subscriber lagging; dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
        }
    }
    for id in closed {
        guard.remove(&id);
    }
}

/// Publishes JSON and fans incoming messages out to channel subscriptions.
#[derive(Clone)]
pub struct MqttBridge {
    client: AsyncClient,
    routes: Routes,
    next_id: Arc<AtomicU64>,
}

impl MqttBridge {
    pub fn connect(settings: &MqttSettings) -> Result<(Self, JoinHandle<()>)> {
        if settings.host.trim().is_empty() {
            anyhow::bail!("mqtt host must not be empty");
        }
        let (client, mut eventloop) = AsyncClient::new(settings.options(), 10);
        let bridge = Self::from_client(client);
        let routes = bridge.routes.clone();
        let resubscribe = bridge.client.clone();
        let handle = tokio::spawn(async move {
            let mut first_connect = true;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        dispatch(&routes, &publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        let filters =
                            filters_to_restore(&routes, first_connect, ack.session_present);
                        first_connect = false;
                        tracing::info!(resubscribing = filters.len(), "mqtt connected");
                        for filter in filters {
                            if let Err(err) = resubscribe.try_subscribe(&filter, QoS::AtLeastOnce) {
                                tracing::warn!(filter = %filter, error = %err, "mqtt resubscribe failed");
                            }
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        tracing::info!("mqtt disconnected");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "mqtt event loop error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
        Ok((bridge, handle))
    }

    fn from_client(client: AsyncClient) -> Self {
        Self {
            client,
            routes: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Single attempt at QoS 1; no retry.
    pub async fn publish_json(&self, topic: &str, payload: &JsonValue) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await
            .with_context(|| format!("failed to publish to {topic}"))?;
        Ok(())
    }

    /// Sends DISCONNECT after queued requests; the event loop task then exits.
    pub async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .context("failed to disconnect from mqtt broker")
    }

    pub async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        let filter = filter.trim();
        if filter.is_empty() {
            anyhow::bail!("topic filter must not be empty");
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_routes(&self.routes).insert(
            id,
            Route {
                filter: filter.to_string(),
                tx,
            },
        );
        if let Err(err) = self.client.subscribe(filter, QoS::AtLeastOnce).await {
            self.deregister(id);
            return Err(err).with_context(|| format!("failed to subscribe to {filter}"));
        }
        tracing::info!(filter, "subscribed");
        Ok(Subscription {
            id,
            filter: filter.to_string(),
            rx,
            bridge: self.clone(),
        })
    }

    fn deregister(&self, id: u64) -> bool {
        let mut guard = lock_routes(&self.routes);
        let removed = guard.remove(&id);
        match removed {
            Some(route) => !guard.values().any(|other| other.filter == route.filter),
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        lock_routes(&self.routes).len()
    }
}

/// Receiving end of one topic filter. Dropping it deregisters locally;
/// `unsubscribe` also tells the broker when no other subscription shares the filter.
pub struct Subscription {
    id: u64,
    filter: String,
    rx: mpsc::Receiver<MqttMessage>,
    bridge: MqttBridge,
}

impl Subscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub async fn next(&mut self) -> Option<MqttMessage> {
        self.rx.recv().await
    }

    pub async fn unsubscribe(self) -> Result<()> {
        if self.bridge.deregister(self.id) {
            self.bridge
                .client
                .unsubscribe(&self.filter)
                .await
                .with_context(|| format!("failed to unsubscribe from {}", self.filter))?;
        }
        tracing::info!(filter = %self.filter, "unsubscribed");
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bridge.deregister(self.id);
    }
}
