//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Conditions`] | Verdict transitions from the condition evaluator |
//! | [`Topic::Vetoes`] | Raises, escalations, holdoffs and clears |
//! | [`Topic::Emergencies`] | Emergency transitions, preemptions, E-STOP |
//! | [`Topic::Confirmations`] | Gate outcomes and threshold updates |
//! | [`Topic::Announcements`] | Text to read out to the operator |
//! | [`Topic::Alerts`] | Manual recovery and hardware fault alerts |

use nightwatch_types::{Event, SafetyError, SafetyEvent};
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Conditions,
    Vetoes,
    Emergencies,
    Confirmations,
    Announcements,
    Alerts,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Conditions,
        Topic::Vetoes,
        Topic::Emergencies,
        Topic::Confirmations,
        Topic::Announcements,
        Topic::Alerts,
    ];

    /// The lane `payload` is published on.
    pub fn of(payload: &SafetyEvent) -> Topic {
        match payload {
            SafetyEvent::VerdictChanged(_) => Topic::Conditions,
            SafetyEvent::VetoRaised { .. }
            | SafetyEvent::VetoEscalated { .. }
            | SafetyEvent::VetoRetriggered { .. }
            | SafetyEvent::HoldoffStarted { .. }
            | SafetyEvent::ReadyToClear { .. }
            | SafetyEvent::VetoCleared { .. } => Topic::Vetoes,
            SafetyEvent::EmergencyTransition { .. }
            | SafetyEvent::EmergencyPreempted { .. }
            | SafetyEvent::EStopTriggered { .. } => Topic::Emergencies,
            SafetyEvent::ConfirmationResolved { .. } | SafetyEvent::ThresholdsUpdated { .. } => {
                Topic::Confirmations
            }
            SafetyEvent::Announcement { .. } => Topic::Announcements,
            SafetyEvent::Alert { .. } => Topic::Alerts,
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    conditions: broadcast::Sender<Event>,
    vetoes: broadcast::Sender<Event>,
    emergencies: broadcast::Sender<Event>,
    confirmations: broadcast::Sender<Event>,
    announcements: broadcast::Sender<Event>,
    alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (conditions, _) = broadcast::channel(capacity);
        let (vetoes, _) = broadcast::channel(capacity);
        let (emergencies, _) = broadcast::channel(capacity);
        let (confirmations, _) = broadcast::channel(capacity);
        let (announcements, _) = broadcast::channel(capacity);
        let (alerts, _) = broadcast::channel(capacity);
        Self {
            conditions,
            vetoes,
            emergencies,
            confirmations,
            announcements,
            alerts,
        }
    }

    /// Publish `event` on its payload's home topic.
    ///
    /// Returns the number of receivers handed the event.
    ///
    /// # Errors
    ///
    /// [`SafetyError::Channel`] when nobody is subscribed to the topic.
    pub fn publish(&self, event: Event) -> Result<usize, SafetyError> {
        let topic = Topic::of(&event.payload);
        self.sender(topic)
            .send(event)
            .map_err(|_| SafetyError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Wrap `payload` in an [`Event`] from `source` and publish it.
    pub fn emit(&self, source: &str, payload: SafetyEvent) -> Result<usize, SafetyError> {
        self.publish(Event::new(source, payload))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.sender(topic).subscribe(),
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Conditions => &self.conditions,
            Topic::Vetoes => &self.vetoes,
            Topic::Emergencies => &self.emergencies,
            Topic::Confirmations => &self.confirmations,
            Topic::Announcements => &self.announcements,
            Topic::Alerts => &self.alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightwatch_types::{AlertLevel, ClearedBy, VetoTier};

    fn veto_raised() -> SafetyEvent {
        SafetyEvent::VetoRaised {
            reason: "wind".into(),
            tier: VetoTier::Critical,
            detail: "wind_speed 32 exceeds limit 25".into(),
        }
    }

    #[tokio::test]
    async fn events_route_to_their_topic() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut vetoes = bus.subscribe_to(Topic::Vetoes);

        let sent = bus.emit("nightwatch-runtime::supervisor", veto_raised())?;
        assert_eq!(sent, 1);

        let received = vetoes.recv().await?;
        assert_eq!(received.payload, veto_raised());
        assert_eq!(vetoes.topic(), Topic::Vetoes);
        Ok(())
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut first = bus.subscribe_to(Topic::Alerts);
        let mut second = bus.subscribe_to(Topic::Alerts);

        let event = Event::new(
            "test",
            SafetyEvent::Alert {
                level: AlertLevel::Emergency,
                message: "manual recovery required".into(),
            },
        );
        bus.publish(event.clone())?;

        assert_eq!(first.recv().await?.id, event.id);
        assert_eq!(second.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topics() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::Alerts);
        let _vetoes = bus.subscribe_to(Topic::Vetoes);

        bus.emit(
            "test",
            SafetyEvent::VetoCleared {
                reason: "wind".into(),
                by: ClearedBy::Recovery,
            },
        )?;

        let wait = std::time::Duration::from_millis(50);
        let result = tokio::time::timeout(wait, alerts.recv()).await;
        assert!(result.is_err(), "Alerts subscriber must not receive a veto event");
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_an_error() {
        let bus = EventBus::default();
        assert!(matches!(
            bus.emit("test", veto_raised()),
            Err(SafetyError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::Vetoes);
        for _ in 0..1_000 {
            let _ = bus.emit("flood", veto_raised());
        }
        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }

    #[test]
    fn every_payload_has_a_topic() {
        let announcement = SafetyEvent::Announcement {
            text: "Unparking the telescope.".into(),
        };
        assert_eq!(Topic::of(&announcement), Topic::Announcements);
        assert_eq!(
            Topic::of(&SafetyEvent::EStopTriggered {
                source: "console".into()
            }),
            Topic::Emergencies
        );
        assert_eq!(Topic::ALL.len(), 6);
    }
}
