//! Local mailbox users.

use serde::{Deserialize, Serialize};

/// A user account on the client.
///
/// `synced` flips to `true` only after an upload that carried this user
/// succeeded, so the set of pending users is exactly those with `synced == false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Email address; the user's identity.
    pub email: String,
    #[serde(default)]
    pub synced: bool,
}

impl User {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            synced: false,
        }
    }
}
