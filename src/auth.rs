//! Read-only boundary to the authentication layer.
//!
//! Token storage, refresh, and login flows live outside this crate; the
//! signaling engine only ever reads the current identity and token. A `None`
//! token means the user is logged out, which forces call teardown and keeps
//! the signaling channel closed.

use std::sync::{Arc, RwLock};

pub trait CredentialSource: Send + Sync {
    /// The authenticated user's own address (their email), if logged in.
    fn identity(&self) -> Option<String>;

    /// The current bearer token, if logged in.
    fn token(&self) -> Option<String>;
}

/// In-memory credentials, settable by the embedding application.
#[derive(Default)]
pub struct StaticCredentials {
    inner: RwLock<Option<(String, String)>>,
}

impl StaticCredentials {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn logged_in(identity: impl Into<String>, token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Some((identity.into(), token.into()))),
        })
    }

    pub fn set(&self, identity: impl Into<String>, token: impl Into<String>) {
        *self.inner.write().unwrap() = Some((identity.into(), token.into()));
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap() = None;
    }
}

impl CredentialSource for StaticCredentials {
    fn identity(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .map(|(id, _)| id.clone())
    }

    fn token(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .map(|(_, token)| token.clone())
    }
}
