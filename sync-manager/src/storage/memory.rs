//! In-memory object store with failure injection, used by tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ObjectStore, StoreFailure};

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    pub puts: AtomicUsize,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing_puts: Mutex<Vec<String>>,
    failing_deletes: Mutex<Vec<String>>,
    fail_list: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` whose key ends with `suffix` fail.
    pub async fn fail_puts_matching(&self, suffix: &str) {
        self.failing_puts.lock().await.push(suffix.to_string());
    }

    /// Make every `delete` whose key ends with `suffix` fail.
    pub async fn fail_deletes_matching(&self, suffix: &str) {
        self.failing_deletes.lock().await.push(suffix.to_string());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::Relaxed);
    }

    pub async fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().await.insert(key.to_string(), bytes);
    }

    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.remove(key)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn describe(&self) -> String {
        "mem://".to_string()
    }

    async fn put(&self, key: &str, local: &Path) -> Result<(), StoreFailure> {
        if self.failing_puts.lock().await.iter().any(|s| key.ends_with(s.as_str())) {
            return Err(StoreFailure::Backend(format!("injected put failure for {}", key)));
        }
        let bytes = tokio::fs::read(local).await?;
        self.objects.lock().await.insert(key.to_string(), bytes);
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str, local: &Path) -> Result<(), StoreFailure> {
        let bytes = self
            .objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or(StoreFailure::NotFound)?;
        tokio::fs::write(local, bytes).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreFailure> {
        if self.fail_list.load(Ordering::Relaxed) {
            return Err(StoreFailure::Backend("injected listing failure".to_string()));
        }
        Ok(self.keys_with_prefix(prefix).await)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreFailure> {
        if self.failing_deletes.lock().await.iter().any(|s| key.ends_with(s.as_str())) {
            return Err(StoreFailure::Backend(format!("injected delete failure for {}", key)));
        }
        self.objects.lock().await.remove(key);
        Ok(())
    }
}
