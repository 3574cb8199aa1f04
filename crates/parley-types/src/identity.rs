//! Canonical ordering of a user pair.
//!
//! A conversation's natural key is the unordered pair `{a, b}`. It is stored as
//! `(low, high)` using `Uuid`'s total order, which matches the lexicographic
//! order of the lowercase hyphenated string form.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("cannot open a conversation with yourself ({0})")]
    SelfConversation(Uuid),

    #[error("malformed user id: {0}")]
    Malformed(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantPair {
    low: Uuid,
    high: Uuid,
}

impl ParticipantPair {
    pub fn low(&self) -> Uuid {
        self.low
    }

    pub fn high(&self) -> Uuid {
        self.high
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.low == user_id || self.high == user_id
    }
}

/// Map two distinct users to their canonical pair. Order of arguments does not matter.
pub fn normalize(a: Uuid, b: Uuid) -> Result<ParticipantPair, IdentityError> {
    check_user_id(a)?;
    check_user_id(b)?;

    if a == b {
        return Err(IdentityError::SelfConversation(a));
    }

    let (low, high) = if a < b { (a, b) } else { (b, a) };
    Ok(ParticipantPair { low, high })
}

/// The nil UUID is never a valid user.
pub fn check_user_id(id: Uuid) -> Result<(), IdentityError> {
    if id.is_nil() {
        return Err(IdentityError::Malformed(id));
    }
    Ok(())
}
