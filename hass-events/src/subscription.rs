//! Subscription identities and filters

use std::fmt;
use std::sync::Weak;

use hass_protocol::SubjectId;

use crate::router::RouterInner;

/// Unique handle for one subscription
///
/// Two subscriptions with the same filter and handler still get distinct
/// ids, so either can be removed without touching the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Create a new SubscriptionId with the given value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Which subjects a subscription wants
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectFilter {
    /// Events for exactly this entity
    Entity(SubjectId),
    /// Every event of the subscribed kind, with or without a subject
    Any,
}

impl fmt::Display for SubjectFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectFilter::Entity(id) => write!(f, "{}", id),
            SubjectFilter::Any => f.write_str("*"),
        }
    }
}

impl From<SubjectId> for SubjectFilter {
    fn from(id: SubjectId) -> Self {
        SubjectFilter::Entity(id)
    }
}

impl From<&SubjectId> for SubjectFilter {
    fn from(id: &SubjectId) -> Self {
        SubjectFilter::Entity(id.clone())
    }
}

impl From<&str> for SubjectFilter {
    fn from(id: &str) -> Self {
        SubjectFilter::Entity(SubjectId::new(id))
    }
}

impl From<String> for SubjectFilter {
    fn from(id: String) -> Self {
        SubjectFilter::Entity(SubjectId::new(id))
    }
}

impl From<Option<SubjectId>> for SubjectFilter {
    fn from(id: Option<SubjectId>) -> Self {
        id.map_or(SubjectFilter::Any, SubjectFilter::Entity)
    }
}

/// Scoped subscription that unsubscribes when dropped
///
/// Holds only a weak reference to the router; dropping the guard after the
/// router is gone does nothing.
#[must_use = "dropping the guard immediately unsubscribes"]
pub struct SubscriptionGuard {
    id: SubscriptionId,
    router: Option<Weak<RouterInner>>,
}

impl SubscriptionGuard {
    pub(crate) fn new(id: SubscriptionId, router: Weak<RouterInner>) -> Self {
        Self {
            id,
            router: Some(router),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Keep the subscription alive past the guard; it must then be removed
    /// with `EventRouter::unsubscribe`
    pub fn detach(mut self) -> SubscriptionId {
        self.router = None;
        self.id
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("id", &self.id)
            .field("attached", &self.router.is_some())
            .finish()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(router) = self.router.take().and_then(|weak| weak.upgrade()) {
            router.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId::new(7).to_string(), "sub-7");
        assert_eq!(SubscriptionId::new(7).as_u64(), 7);
    }

    #[test]
    fn test_filter_from_option() {
        assert_eq!(SubjectFilter::from(None::<SubjectId>), SubjectFilter::Any);
        assert_eq!(
            SubjectFilter::from(Some(SubjectId::new("switch.fan"))),
            SubjectFilter::Entity(SubjectId::new("switch.fan"))
        );
        assert_eq!(SubjectFilter::Any.to_string(), "*");
    }
}
