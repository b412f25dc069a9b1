//! The authenticated identity the cart and checkout act on behalf of.

use serde::{Deserialize, Serialize};

use super::{Email, UserId};

/// The current authenticated user, as pushed by the identity provider.
///
/// Unauthenticated sessions are represented by `Option<Identity>::None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Provider-issued user id; also the key of the user's remote cart.
    pub uid: UserId,
    /// Address copied onto every order record.
    pub email: Email,
}

impl Identity {
    /// Create an identity.
    #[must_use]
    pub const fn new(uid: UserId, email: Email) -> Self {
        Self { uid, email }
    }
}
