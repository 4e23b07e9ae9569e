//! Provider configuration mirror.

use crate::config::ProviderConfig;
use crate::Result;

use super::{Database, ProviderRow, query_failed};

impl Database {
    /// Insert or replace a provider by name
    pub async fn upsert_provider(&self, provider: &ProviderConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO providers (
                name, host, port, tls, username, password, connections,
                priority, enabled, retention_days, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                tls = excluded.tls,
                username = excluded.username,
                password = excluded.password,
                connections = excluded.connections,
                priority = excluded.priority,
                enabled = excluded.enabled,
                retention_days = excluded.retention_days,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&provider.name)
        .bind(&provider.host)
        .bind(i64::from(provider.port))
        .bind(i32::from(provider.tls))
        .bind(&provider.username)
        .bind(&provider.password)
        .bind(provider.connections as i64)
        .bind(i64::from(provider.priority))
        .bind(i32::from(provider.enabled))
        .bind(provider.retention_days.map(i64::from))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to save provider"))?;
        Ok(())
    }

    /// Stored providers by name
    pub async fn list_providers(&self) -> Result<Vec<ProviderConfig>> {
        let rows = sqlx::query_as::<_, ProviderRow>(
            r#"
            SELECT name, host, port, tls, username, password, connections,
                   priority, enabled, retention_days
            FROM providers
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to list providers"))?;
        Ok(rows.into_iter().map(ProviderConfig::from).collect())
    }
}
