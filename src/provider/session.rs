//! The capability set the fetcher relies on

use crate::config::ProviderConfig;
use crate::error::FetchError;
use async_trait::async_trait;

/// An authenticated connection to one provider
#[async_trait]
pub trait ArticleSession: Send {
    /// Retrieve the raw (still transport-encoded) body of one article
    async fn fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, FetchError>;
}

/// Opens sessions for a provider
///
/// Errors are classified like fetch errors: `Fatal` for rejected credentials,
/// `Transient` for refused or reset connections.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connect and authenticate
    async fn connect(&self, provider: &ProviderConfig)
    -> Result<Box<dyn ArticleSession>, FetchError>;
}
