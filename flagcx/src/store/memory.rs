use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use super::Store;
use crate::error::{FlagcxError, Result};

/// Store for worlds whose ranks all live in one process.
///
/// Also backs [`StoreServer`](super::StoreServer), which serves the same
/// semantics over TCP.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    changed: Notify,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| FlagcxError::Store {
            key: key.to_string(),
            reason: "store lock poisoned".into(),
        })?;
        Ok(entries.get(key).cloned())
    }

    fn insert(&self, key: &str, value: &[u8], overwrite: bool) -> Result<Vec<u8>> {
        let mut entries = self.entries.lock().map_err(|_| FlagcxError::Store {
            key: key.to_string(),
            reason: "store lock poisoned".into(),
        })?;
        let stored = match entries.get(key) {
            Some(existing) if !overwrite => existing.clone(),
            _ => {
                entries.insert(key.to_string(), value.to_vec());
                value.to_vec()
            }
        };
        drop(entries);
        self.changed.notify_waiters();
        Ok(stored)
    }
}

impl Store for InMemoryStore {
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.insert(key, value, true)?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str, timeout: Duration) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                // Register interest before checking so a put between the
                // check and the await is not missed.
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(value) = self.lookup(key)? {
                    return Ok(value);
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Err(FlagcxError::StoreTimeout {
                        key: key.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        })
    }

    fn put_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { self.insert(key, value, false) })
    }
}
