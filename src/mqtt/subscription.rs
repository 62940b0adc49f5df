//! Session-scoped subscription of the fixed topic set.

use std::collections::BTreeSet;
use tracing::{debug, info};

use super::config::TopicSet;
use super::mqtt_handler::ConnectionManager;
use crate::alert::{Alert, AlertKind, AlertSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    /// Requests for every topic were handed to the broker client
    Requested,
    /// No connected broker; nothing happened
    Skipped,
    /// A request was rejected; a fatal alert has been raised
    Failed { topic: String },
}

pub struct SubscriptionController {
    topics: TopicSet,
    subscribed: BTreeSet<String>,
    alerts: AlertSender,
}

impl SubscriptionController {
    pub fn new(topics: TopicSet, alerts: AlertSender) -> Self {
        Self {
            topics,
            subscribed: BTreeSet::new(),
            alerts,
        }
    }

    pub fn subscribed(&self) -> &BTreeSet<String> {
        &self.subscribed
    }

    pub fn subscribe_all(&mut self, connection: &ConnectionManager) -> SubscriptionOutcome {
        if !connection.is_connected() {
            debug!("Not connected, skipping subscribe");
            return SubscriptionOutcome::Skipped;
        }

        for topic in self.topics.all() {
            if let Err(e) = connection.subscribe(topic) {
                return self.fail(format!("Error on subscribing '{}' topic: {}", topic, e), topic);
            }
            self.subscribed.insert(topic.to_string());
        }
        info!("Subscription requested for {} topics", self.subscribed.len());
        SubscriptionOutcome::Requested
    }

    pub fn unsubscribe_all(&mut self, connection: &ConnectionManager) -> SubscriptionOutcome {
        if !connection.is_connected() {
            debug!("Not connected, skipping unsubscribe");
            return SubscriptionOutcome::Skipped;
        }

        for topic in self.topics.all() {
            if let Err(e) = connection.unsubscribe(topic) {
                return self.fail(
                    format!("Error on unsubscribing '{}' topic: {}", topic, e),
                    topic,
                );
            }
            self.subscribed.remove(topic);
        }
        info!("Unsubscribed from all topics");
        SubscriptionOutcome::Requested
    }

    /// Forgets local subscription state, used when the session is reset.
    pub fn reset(&mut self) {
        self.subscribed.clear();
    }

    fn fail(&self, message: String, topic: &str) -> SubscriptionOutcome {
        self.alerts
            .raise(Alert::fatal(AlertKind::Subscription, message));
        SubscriptionOutcome::Failed {
            topic: topic.to_string(),
        }
    }
}
