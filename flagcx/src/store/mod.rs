//! Out-of-band rendezvous used to exchange connection metadata.
//!
//! Groups never talk to a store directly; they go through a [`PrefixStore`]
//! scoped to the group label, so two groups over the same ranks cannot read
//! each other's keys.

mod memory;
mod tcp;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;

pub use memory::InMemoryStore;
pub use tcp::{StoreServer, TcpStore};

/// Key/value rendezvous shared by every rank of a world.
pub trait Store: Send + Sync {
    /// Set `key` to `value`, overwriting any previous value.
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Wait until `key` exists and return its value.
    ///
    /// Fails with `StoreTimeout` if the key does not appear within `timeout`.
    fn get<'a>(&'a self, key: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Set `key` only if it is unset, returning whichever value is stored
    /// afterwards. The first writer wins.
    fn put_if_absent<'a>(&'a self, key: &'a str, value: &'a [u8])
    -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// A view of another store with every key placed under `prefix/`.
#[derive(Clone)]
pub struct PrefixStore {
    prefix: String,
    inner: Arc<dyn Store>,
}

impl PrefixStore {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Store>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Nest a further scope under this one.
    pub fn scoped(&self, sub: &str) -> Self {
        Self {
            prefix: format!("{}/{sub}", self.prefix),
            inner: Arc::clone(&self.inner),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}/{key}", self.prefix)
    }
}

impl Store for PrefixStore {
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.inner.put(&self.full_key(key), value).await })
    }

    fn get<'a>(&'a self, key: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { self.inner.get(&self.full_key(key), timeout).await })
    }

    fn put_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { self.inner.put_if_absent(&self.full_key(key), value).await })
    }
}
