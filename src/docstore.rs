//! Document storage: the abstract read-all/read-slice contract the
//! interpreter consumes, kept separate from the bulk text itself so a host
//! can swap in a remote document service without touching the core.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Abstract document storage. The interpreter is the sole caller and
/// always accounts chars read against the budget, regardless of backend.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the entire document identified by `doc_id`.
    async fn read_all(&self, doc_id: &str) -> Result<String>;

    /// Read `[start, end)` of the document identified by `doc_id`, in
    /// chars. Implementations should clamp to the document's length.
    async fn read_slice(&self, doc_id: &str, start: usize, end: usize) -> Result<String>;
}

/// In-memory document store backed by a plain map. The default
/// implementation used by a single-document `RootLoop` invocation.
#[derive(Default, Clone)]
pub struct InMemoryDocumentStore {
    docs: HashMap<String, Arc<str>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the common single-document case.
    pub fn single(doc_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut store = Self::default();
        store.insert(doc_id, content);
        store
    }

    pub fn insert(&mut self, doc_id: impl Into<String>, content: impl Into<String>) {
        self.docs.insert(doc_id.into(), Arc::from(content.into()));
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read_all(&self, doc_id: &str) -> Result<String> {
        self.docs
            .get(doc_id)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::execution(format!("unknown document id: {doc_id}")))
    }

    async fn read_slice(&self, doc_id: &str, start: usize, end: usize) -> Result<String> {
        let content = self.docs.get(doc_id).ok_or_else(|| {
            Error::execution(format!("unknown document id: {doc_id}"))
        })?;
        let chars: Vec<char> = content.chars().collect();
        let start = start.min(chars.len());
        let end = end.min(chars.len()).max(start);
        Ok(chars[start..end].iter().collect())
    }
}

/// Signature of an external `readDocument` call used by
/// [`RemoteDocumentStore`]. Mirrors §4.2's `readDocument({docId, start?,
/// end?})` contract.
pub type RemoteReadFn =
    Arc<dyn Fn(&str, Option<usize>, Option<usize>) -> Result<String> + Send + Sync>;

/// A document store backed by an external function, for hosts that keep
/// documents in a remote service rather than in-process memory.
#[derive(Clone)]
pub struct RemoteDocumentStore {
    read: RemoteReadFn,
}

impl RemoteDocumentStore {
    pub fn new(read: RemoteReadFn) -> Self {
        Self { read }
    }
}

#[async_trait]
impl DocumentStore for RemoteDocumentStore {
    async fn read_all(&self, doc_id: &str) -> Result<String> {
        (self.read)(doc_id, None, None)
    }

    async fn read_slice(&self, doc_id: &str, start: usize, end: usize) -> Result<String> {
        (self.read)(doc_id, Some(start), Some(end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_read_all_and_slice() {
        let store = InMemoryDocumentStore::single("d1", "hello world");
        assert_eq!(store.read_all("d1").await.unwrap(), "hello world");
        assert_eq!(store.read_slice("d1", 0, 5).await.unwrap(), "hello");
        assert_eq!(store.read_slice("d1", 6, 999).await.unwrap(), "world");
    }

    #[tokio::test]
    async fn in_memory_unknown_doc_errors() {
        let store = InMemoryDocumentStore::new();
        assert!(store.read_all("missing").await.is_err());
    }

    #[tokio::test]
    async fn remote_store_delegates() {
        let store = RemoteDocumentStore::new(Arc::new(|id, start, end| {
            Ok(format!("{id}:{start:?}:{end:?}"))
        }));
        assert_eq!(store.read_all("abc").await.unwrap(), "abc:None:None");
        assert_eq!(
            store.read_slice("abc", 1, 2).await.unwrap(),
            "abc:Some(1):Some(2)"
        );
    }
}
