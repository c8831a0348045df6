use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // lowercase a-z, 0-9 and dots only
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        matches!(
            name.split('.').next(),
            Some("system" | "xmpp" | "plugin")
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The event envelope published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "xmpp.session.online")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    pub id: Uuid,

    /// Links related events, e.g. every event of one login attempt
    pub correlation_id: Option<Uuid>,

    pub source: EventSource,

    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(channel, source, payload)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    System(String),
    Xmpp,
    /// Plugin with its name
    Plugin(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Session lifecycle ─────────────────────────────────────────
    ConnectionStateChanged {
        state: String,
    },
    ConnectionEstablished {
        jid: String,
    },
    ConnectionLost {
        reason: String,
    },
    BeforeOnline {
        jid: String,
    },
    Online {
        jid: String,
    },
    Offline,
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Stanza traffic ────────────────────────────────────────────
    StanzaUnmatched {
        stanza: String,
    },

    // ── Roster and subscriptions ──────────────────────────────────
    RosterReceived {
        contacts: Vec<ContactSnapshot>,
    },
    ContactUpdated {
        contact: ContactSnapshot,
    },
    ContactRemoved {
        jid: String,
    },
    SubscriptionRequest {
        from: String,
    },
    RosterPushRejected {
        from: String,
    },

    // ── Plugins ───────────────────────────────────────────────────
    PluginError {
        plugin_id: String,
        error: String,
    },
}

/// Presence subscription state of a roster entry (RFC 6121 section 2.1.2.5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }

    /// Whether the user receives the contact's presence.
    pub fn is_subscribed(&self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Subscription {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            _ => Subscription::None,
        })
    }
}

/// Coarse availability derived from a contact's resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Availability {
    Present,
    Away,
    #[default]
    Unavailable,
}

/// A point-in-time copy of a roster contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSnapshot {
    /// Bare JID
    pub jid: String,
    pub name: Option<String>,
    pub subscription: Subscription,
    pub pending_in: bool,
    pub pending_out: bool,
    pub availability: Availability,
    pub status: Option<String>,
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    xmpp_sender: broadcast::Sender<Event>,
    plugin_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (xmpp_sender, _) = broadcast::channel(capacity);
        let (plugin_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            xmpp_sender,
            plugin_sender,
        }
    }

    pub fn from_config(config: &crate::config::EventBusConfig) -> Self {
        Self::new(config.channel_capacity)
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "xmpp" => Some(&self.xmpp_sender),
            "plugin" => Some(&self.plugin_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(&self, pattern: &str) -> Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                xmpp: Some(self.xmpp_sender.subscribe()),
                plugin: Some(self.plugin_sender.subscribe()),
            });
        }

        let sender = self
            .sender_for_domain(first_segment)
            .ok_or_else(|| EventBusError::InvalidPattern(pattern.to_string()))?;
        let mut receivers = DomainReceivers::default();
        match first_segment {
            "system" => receivers.system = Some(sender.subscribe()),
            "xmpp" => receivers.xmpp = Some(sender.subscribe()),
            _ => receivers.plugin = Some(sender.subscribe()),
        }
        Ok(receivers)
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        // no subscribers is not an error
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Default)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    xmpp: Option<broadcast::Receiver<Event>>,
    plugin: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let xmpp_receiver = self.receivers.xmpp.as_mut();
            let plugin_receiver = self.receivers.plugin.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(xmpp_receiver) => result,
                result = recv_from_domain(plugin_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']', '{', '}', '!'])
}


#[cfg(test)]
mod event_bus_tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn make_event(channel: &str, payload: EventPayload) -> Event {
        Event::new(
            Channel::new(channel).unwrap(),
            EventSource::System("test".into()),
            payload,
        )
    }

    #[tokio::test]
    async fn publish_routes_to_matching_domain_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("xmpp.**").unwrap();

        bus.publish(make_event("xmpp.session.offline", EventPayload::Offline))
            .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "xmpp.session.offline");
    }

    #[tokio::test]
    async fn xmpp_event_not_received_by_system_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.**").unwrap();

        bus.publish(make_event("xmpp.session.offline", EventPayload::Offline))
            .unwrap();

        let result = timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "system subscriber should not see xmpp events");
    }

    #[tokio::test]
    async fn exact_pattern_filters_within_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("xmpp.session.online").unwrap();

        bus.publish(make_event("xmpp.session.offline", EventPayload::Offline))
            .unwrap();
        bus.publish(make_event(
            "xmpp.session.online",
            EventPayload::Online {
                jid: "bob@example.com/tern".into(),
            },
        ))
        .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "xmpp.session.online");
    }

    #[tokio::test]
    async fn wildcard_domain_receives_every_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("*.**").unwrap();

        bus.publish(make_event(
            "system.connection.state",
            EventPayload::ConnectionStateChanged {
                state: "connecting".into(),
            },
        ))
        .unwrap();
        bus.publish(make_event(
            "plugin.roster.error",
            EventPayload::PluginError {
                plugin_id: "roster".into(),
                error: "boom".into(),
            },
        ))
        .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let event = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timed out")
                .unwrap();
            seen.push(event.channel.to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["plugin.roster.error", "system.connection.state"]);
    }

    #[tokio::test]
    async fn publish_succeeds_with_no_subscribers() {
        let bus = BroadcastEventBus::default();
        let result = bus.publish(make_event("xmpp.session.offline", EventPayload::Offline));
        assert!(result.is_ok());
    }

    #[test]
    fn subscribe_rejects_unknown_domain() {
        let bus = BroadcastEventBus::default();
        assert!(matches!(
            bus.subscribe("ui.**"),
            Err(EventBusError::InvalidPattern(_))
        ));
        assert!(matches!(
            bus.subscribe(""),
            Err(EventBusError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_reports_lag() {
        let bus = BroadcastEventBus::new(1);
        let mut sub = bus.subscribe("xmpp.**").unwrap();

        for _ in 0..3 {
            bus.publish(make_event("xmpp.session.offline", EventPayload::Offline))
                .unwrap();
        }

        let result = sub.recv().await;
        assert!(matches!(result, Err(EventBusError::Lagged(2))));
    }
}
