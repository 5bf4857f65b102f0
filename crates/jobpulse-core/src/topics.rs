use std::collections::BTreeSet;

/// Which topics the client wants (`active`) versus which ones the live
/// connection instance has actually joined (`joined`).
///
/// Subscriptions are connection-scoped: `connection_lost` forgets `joined`
/// while `active` survives, so the next connection re-joins exactly the
/// active set.
#[derive(Debug, Default, Clone)]
pub struct TopicRegistry {
    active: BTreeSet<String>,
    joined: BTreeSet<String>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the topic was not active before.
    pub fn join(&mut self, topic: &str) -> bool {
        self.active.insert(topic.to_string())
    }

    /// Returns `true` when the topic was active before.
    pub fn leave(&mut self, topic: &str) -> bool {
        self.active.remove(topic)
    }

    pub fn is_active(&self, topic: &str) -> bool {
        self.active.contains(topic)
    }

    pub fn is_joined(&self, topic: &str) -> bool {
        self.joined.contains(topic)
    }

    pub fn active(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }

    pub fn joined(&self) -> impl Iterator<Item = &str> {
        self.joined.iter().map(String::as_str)
    }

    /// Records that a join frame went out on the current connection. Returns
    /// `false` when the topic is no longer wanted or was already joined, in
    /// which case no frame should be sent.
    pub fn mark_joined(&mut self, topic: &str) -> bool {
        if !self.active.contains(topic) {
            return false;
        }
        self.joined.insert(topic.to_string())
    }

    /// Records that a leave frame went out. Returns `false` when the topic was
    /// not joined on this connection or has been re-activated since.
    pub fn mark_left(&mut self, topic: &str) -> bool {
        if self.active.contains(topic) {
            return false;
        }
        self.joined.remove(topic)
    }

    pub fn connection_lost(&mut self) {
        self.joined.clear();
    }

    pub fn pending_rejoin(&self) -> Vec<String> {
        self.active.difference(&self.joined).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.joined.clear();
    }
}
