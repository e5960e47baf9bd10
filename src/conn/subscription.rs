//! Subscription registry (component H).
//!
//! Grounded on `io_mqtt_subscription_t` and its `__subscription_*` state
//! macros in the original implementation: subscription state is derived
//! from two fields (`pending_packet_id`, `is_subscribed`) rather than
//! stored directly, and a `disabled` flag provides orthogonal flow
//! control independent of subscribe/unsubscribe progress.

use unique_token::Unique;

use crate::proxy::PropertyBag;

/// Derived from `(pending_packet_id, is_subscribed)`, mirroring
/// `__subscription_{subscribing,subscribed,unsubscribing,unsubscribed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

pub fn derive_state(pending_packet_id: Option<u16>, is_subscribed: bool) -> SubscriptionState {
    match (pending_packet_id, is_subscribed) {
        (Some(_), false) => SubscriptionState::Subscribing,
        (None, true) => SubscriptionState::Subscribed,
        (Some(_), true) => SubscriptionState::Unsubscribing,
        (None, false) => SubscriptionState::Unsubscribed,
    }
}

pub type SubscriptionToken = Unique;

/// A single topic subscription on a connection. `uri` excludes any
/// property-bag suffix (the filter a publisher's topic is matched
/// against); incoming messages are delivered with their own
/// [`PropertyBag`] parsed from whatever trailed the match point.
pub struct Subscription {
    pub token: SubscriptionToken,
    pub uri: String,
    pub pending_packet_id: Option<u16>,
    pub is_subscribed: bool,
    pub disabled: bool,
    pub receiver: Box<dyn FnMut(PropertyBag, &[u8]) + Send>,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        derive_state(self.pending_packet_id, self.is_subscribed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_derivation_matches_all_four_cases() {
        assert_eq!(derive_state(None, false), SubscriptionState::Unsubscribed);
        assert_eq!(derive_state(Some(7), false), SubscriptionState::Subscribing);
        assert_eq!(derive_state(None, true), SubscriptionState::Subscribed);
        assert_eq!(derive_state(Some(7), true), SubscriptionState::Unsubscribing);
    }
}
