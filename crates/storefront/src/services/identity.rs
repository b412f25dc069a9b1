//! Push-based feed of the current authenticated identity.
//!
//! The identity provider publishes here on every sign-in and sign-out;
//! [`CartState::follow`](super::cart::CartState::follow) keeps a cart bound to
//! whoever is current.

use tokio::sync::watch;

use coursecart_core::Identity;

/// Latest identity, `None` while signed out.
#[derive(Debug)]
pub struct IdentityFeed {
    tx: watch::Sender<Option<Identity>>,
}

impl Default for IdentityFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityFeed {
    /// Create a feed starting signed out.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Publish a sign-in.
    pub fn sign_in(&self, identity: Identity) {
        self.publish(Some(identity));
    }

    /// Publish a sign-out.
    pub fn sign_out(&self) {
        self.publish(None);
    }

    /// Publish `identity`; subscribers are woken only if it differs from the
    /// current one.
    pub fn publish(&self, identity: Option<Identity>) {
        self.tx.send_if_modified(|current| {
            if *current == identity {
                return false;
            }
            tracing::info!(
                user_id = identity.as_ref().map(|i| i.uid.as_str()),
                "Identity changed"
            );
            *current = identity;
            true
        });
    }

    /// The identity right now.
    #[must_use]
    pub fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    /// Receiver seeing the current identity and every later change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use coursecart_core::{Email, UserId};

    use super::*;

    fn identity(uid: &str) -> Identity {
        Identity::new(
            UserId::new(uid),
            Email::parse(&format!("{uid}@example.com")).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_feed_notifies_on_change_only() {
        let feed = IdentityFeed::new();
        let mut rx = feed.subscribe();
        assert!(rx.borrow_and_update().is_none());

        feed.sign_in(identity("a"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().clone(), Some(identity("a")));

        feed.sign_in(identity("a"));
        assert!(!rx.has_changed().unwrap());

        feed.sign_out();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_none());
        assert!(feed.current().is_none());
    }
}
