//! Authentication credentials.

use crate::error::SyncResult;
use parking_lot::RwLock;
use std::fmt;

/// An opaque bearer credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a token. Surrounding whitespace is dropped.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into().trim().to_string())
    }

    /// Returns the raw token for the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&"[REDACTED]").finish()
    }
}

/// Source of the current credential. `Ok(None)` means the user is anonymous.
pub trait CredentialProvider: Send + Sync {
    /// Returns the credential to send, if any.
    fn credential(&self) -> SyncResult<Option<Credential>>;
}

/// A provider that never has a credential.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn credential(&self) -> SyncResult<Option<Credential>> {
        Ok(None)
    }
}

impl CredentialProvider for Credential {
    fn credential(&self) -> SyncResult<Option<Credential>> {
        Ok((!self.0.is_empty()).then(|| self.clone()))
    }
}

/// A credential slot updated by sign-in and sign-out.
#[derive(Debug, Default)]
pub struct CredentialCell {
    current: RwLock<Option<Credential>>,
}

impl CredentialCell {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a credential.
    pub fn set(&self, credential: Credential) {
        *self.current.write() = Some(credential);
    }

    /// Forgets the credential.
    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

impl CredentialProvider for CredentialCell {
    fn credential(&self) -> SyncResult<Option<Credential>> {
        Ok(self.current.read().clone().filter(|c| !c.as_str().is_empty()))
    }
}
