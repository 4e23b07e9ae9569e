//! Usenet provider connection pool
//!
//! A [`SessionConnector`] opens authenticated [`ArticleSession`]s; the
//! [`ProviderPool`] bounds how many are open per provider, reuses healthy ones and
//! discards broken ones. Fetch workers only see sessions, never the pool's
//! bookkeeping.

mod memory;
mod nntp;
mod pool;
mod session;

pub use memory::{InMemoryConnector, PostedSegment, nzb_document};
pub use nntp::NntpConnector;
pub use pool::{PooledSession, ProviderPool};
pub use session::{ArticleSession, SessionConnector};

use serde::{Deserialize, Serialize};

/// Index of a provider within its pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub usize);

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
