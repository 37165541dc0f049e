//! Maps event types onto bus topics.

use serde::{Deserialize, Serialize};

use crate::config::TopicConfig;

/// A single prefix rule: event types starting with `prefix` go to `topic`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicRoute {
    pub prefix: String,
    pub topic: String,
}

impl TopicRoute {
    pub fn new(prefix: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            topic: topic.into(),
        }
    }
}

/// Resolves the topic for an event type by first matching prefix.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    routes: Vec<TopicRoute>,
    default_topic: String,
}

impl TopicRouter {
    pub fn new(routes: Vec<TopicRoute>, default_topic: impl Into<String>) -> Self {
        Self {
            routes,
            default_topic: default_topic.into(),
        }
    }

    pub fn from_config(config: &TopicConfig) -> Self {
        Self::new(config.routes.clone(), config.default_topic.clone())
    }

    pub fn topic_for(&self, event_type: &str) -> &str {
        self.routes
            .iter()
            .find(|route| event_type.starts_with(route.prefix.as_str()))
            .map(|route| route.topic.as_str())
            .unwrap_or(&self.default_topic)
    }

    /// Every topic this router can produce, without duplicates.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::with_capacity(self.routes.len() + 1);
        for topic in self
            .routes
            .iter()
            .map(|r| &r.topic)
            .chain(std::iter::once(&self.default_topic))
        {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }
        topics
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::from_config(&TopicConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_prefix() {
        let router = TopicRouter::default();
        assert_eq!(router.topic_for("UserRegistered"), "user-events");
        assert_eq!(router.topic_for("ConversationStarted"), "conversation-events");
        assert_eq!(router.topic_for("MessageSent"), "message-events");
        assert_eq!(router.topic_for("AIResponseGenerated"), "ai-events");
    }

    #[test]
    fn unmatched_types_use_default() {
        let router = TopicRouter::default();
        assert_eq!(router.topic_for("ItemAdded"), "system-events");
        assert_eq!(router.topic_for("user_lowercase"), "system-events");
    }

    #[test]
    fn first_matching_route_wins() {
        let router = TopicRouter::new(
            vec![
                TopicRoute::new("UserAdmin", "admin-events"),
                TopicRoute::new("User", "user-events"),
            ],
            "misc",
        );
        assert_eq!(router.topic_for("UserAdminGranted"), "admin-events");
        assert_eq!(router.topic_for("UserLoggedIn"), "user-events");
    }

    #[test]
    fn topics_are_deduplicated() {
        let router = TopicRouter::new(
            vec![
                TopicRoute::new("A", "shared"),
                TopicRoute::new("B", "shared"),
            ],
            "shared",
        );
        assert_eq!(router.topics(), vec!["shared".to_string()]);
        assert_eq!(TopicRouter::default().topics().len(), 5);
    }
}
