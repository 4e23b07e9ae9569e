//! NNTP sessions backed by nntp-rs

use super::session::{ArticleSession, SessionConnector};
use crate::config::ProviderConfig;
use crate::error::FetchError;
use async_trait::async_trait;
use std::sync::Arc;

/// Production connector speaking NNTP
#[derive(Debug, Default, Clone, Copy)]
pub struct NntpConnector;

struct NntpSession {
    client: nntp_rs::NntpClient,
}

#[async_trait]
impl SessionConnector for NntpConnector {
    async fn connect(
        &self,
        provider: &ProviderConfig,
    ) -> Result<Box<dyn ArticleSession>, FetchError> {
        let server: nntp_rs::ServerConfig = provider.into();
        let mut client = nntp_rs::NntpClient::connect(Arc::new(server))
            .await
            .map_err(|e| classify_error(None, e))?;

        if provider.username.is_some() {
            client
                .authenticate()
                .await
                .map_err(|e| classify_error(None, e))?;
        }

        tracing::debug!(provider = %provider.name, host = %provider.host, "NNTP session established");
        Ok(Box::new(NntpSession { client }))
    }
}

#[async_trait]
impl ArticleSession for NntpSession {
    async fn fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, FetchError> {
        let mut responses = self
            .client
            .fetch_articles_pipelined(&[message_id], 1)
            .await
            .map_err(|e| classify_error(Some(message_id), e))?;

        match responses.pop() {
            Some(response) => Ok(response.data),
            None => Err(FetchError::Transient(format!(
                "empty response for {message_id}"
            ))),
        }
    }
}

/// Map an nntp-rs error onto the fetch outcome classes
pub(crate) fn classify_error(message_id: Option<&str>, err: nntp_rs::NntpError) -> FetchError {
    match err {
        nntp_rs::NntpError::NoSuchArticle(_) => FetchError::NotFound {
            message_id: message_id.unwrap_or_default().to_string(),
        },
        nntp_rs::NntpError::Protocol { code, .. } if code == 430 || code == 423 => {
            FetchError::NotFound {
                message_id: message_id.unwrap_or_default().to_string(),
            }
        }
        nntp_rs::NntpError::Protocol { code, .. } if matches!(code, 452 | 480 | 481 | 482 | 502) => {
            FetchError::Fatal(format!("server rejected session ({code})"))
        }
        other => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            if lower.contains("no such article") {
                FetchError::NotFound {
                    message_id: message_id.unwrap_or_default().to_string(),
                }
            } else if lower.contains("auth") && (lower.contains("fail") || lower.contains("reject"))
            {
                FetchError::Fatal(message)
            } else {
                FetchError::Transient(message)
            }
        }
    }
}
