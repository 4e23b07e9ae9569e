//! In-memory article store speaking the session interface
//!
//! Useful for exercising the pipeline without a news server: articles are
//! registered per provider name and served from memory.

use super::session::{ArticleSession, SessionConnector};
use crate::config::ProviderConfig;
use crate::error::{FetchError, YencError};
use crate::yenc::{self, PartInfo};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct Store {
    articles: HashMap<String, HashMap<String, Vec<u8>>>,
    rejected: HashSet<String>,
    flaky: HashMap<String, usize>,
    broken_articles: HashSet<(String, String)>,
    latency: Duration,
    fetches: HashMap<String, usize>,
}

/// A [`SessionConnector`] backed by a shared in-memory store
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    store: Arc<Mutex<Store>>,
}

/// One posted segment: its message-id and decoded size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedSegment {
    /// Message-id without angle brackets
    pub message_id: String,
    /// Number of payload bytes in the part
    pub bytes: u64,
}

impl InMemoryConnector {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `body` retrievable as `message_id` from `provider`
    pub fn insert(&self, provider: &str, message_id: &str, body: Vec<u8>) {
        self.lock()
            .articles
            .entry(provider.to_string())
            .or_default()
            .insert(message_id.to_string(), body);
    }

    /// Remove an article from a provider
    pub fn remove(&self, provider: &str, message_id: &str) {
        if let Some(articles) = self.lock().articles.get_mut(provider) {
            articles.remove(message_id);
        }
    }

    /// yEnc-encode `data` in parts of `part_size` bytes and post them to every
    /// listed provider
    ///
    /// Message-ids are `{name}.{part}@test`.
    pub fn post_file(
        &self,
        providers: &[&str],
        name: &str,
        data: &[u8],
        part_size: usize,
    ) -> Result<Vec<PostedSegment>, YencError> {
        let chunks: Vec<&[u8]> = data.chunks(part_size.max(1)).collect();
        let total = chunks.len() as u32;
        let mut posted = Vec::with_capacity(chunks.len());
        let mut begin = 1u64;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let number = i as u32 + 1;
            let body = yenc::encode(
                name,
                chunk,
                Some(PartInfo {
                    number,
                    total,
                    begin,
                    file_size: data.len() as u64,
                }),
            )?;
            begin += chunk.len() as u64;

            let message_id = format!("{name}.{number}@test");
            for provider in providers {
                self.insert(provider, &message_id, body.clone());
            }
            posted.push(PostedSegment {
                message_id,
                bytes: chunk.len() as u64,
            });
        }
        Ok(posted)
    }

    /// Reject every connection attempt to `provider` as an authentication failure
    pub fn reject_auth(&self, provider: &str) {
        self.lock().rejected.insert(provider.to_string());
    }

    /// Fail the next `count` fetches from `provider` with a transient error
    pub fn fail_next(&self, provider: &str, count: usize) {
        self.lock().flaky.insert(provider.to_string(), count);
    }

    /// Answer every fetch of `message_id` from `provider` with a transient error
    pub fn fail_article(&self, provider: &str, message_id: &str) {
        self.lock()
            .broken_articles
            .insert((provider.to_string(), message_id.to_string()));
    }

    /// Delay every fetch by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Number of fetch attempts made against `provider`
    pub fn fetch_count(&self, provider: &str) -> usize {
        self.lock().fetches.get(provider).copied().unwrap_or(0)
    }
}

/// NZB document listing `files`, each with the segments [`InMemoryConnector::post_file`] returned
pub fn nzb_document(files: &[(&str, &[PostedSegment])]) -> Vec<u8> {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">\n",
    );
    for (name, segments) in files {
        let name = quick_xml::escape::escape(*name);
        xml.push_str(&format!(
            "  <file poster=\"tester\" date=\"1700000000\" subject=\"&quot;{name}&quot; yEnc (1/{})\">\n",
            segments.len()
        ));
        xml.push_str("    <groups><group>alt.binaries.test</group></groups>\n    <segments>\n");
        for (i, segment) in segments.iter().enumerate() {
            xml.push_str(&format!(
                "      <segment bytes=\"{}\" number=\"{}\">{}</segment>\n",
                segment.bytes,
                i + 1,
                quick_xml::escape::escape(segment.message_id.as_str())
            ));
        }
        xml.push_str("    </segments>\n  </file>\n");
    }
    xml.push_str("</nzb>\n");
    xml.into_bytes()
}

#[async_trait]
impl SessionConnector for InMemoryConnector {
    async fn connect(
        &self,
        provider: &ProviderConfig,
    ) -> Result<Box<dyn ArticleSession>, FetchError> {
        if self.lock().rejected.contains(&provider.name) {
            return Err(FetchError::Fatal(format!(
                "authentication rejected by {}",
                provider.name
            )));
        }
        Ok(Box::new(InMemorySession {
            provider: provider.name.clone(),
            connector: self.clone(),
        }))
    }
}

struct InMemorySession {
    provider: String,
    connector: InMemoryConnector,
}

#[async_trait]
impl ArticleSession for InMemorySession {
    async fn fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, FetchError> {
        let latency = {
            let mut store = self.connector.lock();
            *store.fetches.entry(self.provider.clone()).or_default() += 1;
            store.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut store = self.connector.lock();
        if let Some(remaining) = store.flaky.get_mut(&self.provider)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(FetchError::Transient("connection reset".to_string()));
        }
        if store
            .broken_articles
            .contains(&(self.provider.clone(), message_id.to_string()))
        {
            return Err(FetchError::Transient("timed out reading body".to_string()));
        }
        store
            .articles
            .get(&self.provider)
            .and_then(|articles| articles.get(message_id))
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                message_id: message_id.to_string(),
            })
    }
}
