//! Read path for per-service log level overrides.

use async_trait::async_trait;

use super::PgJobOrm;
use crate::DbResult;

#[async_trait]
pub trait LogLevelRepo: Send + Sync {
    /// The stored level for a service, if one was set.
    async fn service_log_level(&self, service: &str) -> DbResult<Option<String>>;
}

#[async_trait]
impl LogLevelRepo for PgJobOrm {
    async fn service_log_level(&self, service: &str) -> DbResult<Option<String>> {
        let level: Option<(String,)> =
            sqlx::query_as("SELECT log_level FROM log_config WHERE service_name = $1")
                .bind(service)
                .fetch_optional(&self.pool)
                .await?;
        Ok(level.map(|(level,)| level))
    }
}
