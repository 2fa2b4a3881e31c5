//! Key/value storage behind the session store.

use anyhow::Result;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Opaque session storage. Keys are already hashed; values are serialized
/// session records.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// `Ok(None)` means "no session"; `Err` means the backend is unavailable.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn store(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySessionBackend {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemorySessionBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map_or(0, |entries| entries.values().filter(|(_, exp)| *exp > Instant::now()).count())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("session map poisoned"))?;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn store(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("session map poisoned"))?;
        entries.insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("session map poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire() -> Result<()> {
        let backend = MemorySessionBackend::new();
        backend.store("a", b"1", Duration::from_secs(60)).await?;
        backend.store("b", b"2", Duration::from_millis(1)).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(backend.load("a").await?, Some(b"1".to_vec()));
        assert_eq!(backend.load("b").await?, None);
        backend.delete("a").await?;
        assert!(backend.is_empty());
        Ok(())
    }
}
