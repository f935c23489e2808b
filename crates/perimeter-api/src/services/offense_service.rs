use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use perimeter_shared::{PerimeterError, Result};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

const CACHE_TTL: Duration = Duration::from_secs(1);
const CACHE_CAP: usize = 10_000;

/// Offense counts are windowed queries over the alert table, never a
/// separately maintained counter. The TTL cache only fronts read-heavy
/// surfaces (admin listings); penalty decisions always hit the table.
pub struct OffenseService {
    pool: PgPool,
    cache: Mutex<HashMap<String, (Instant, i64)>>,
}

impl OffenseService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Lifetime alert count for a principal. Authoritative.
    pub async fn count_all(&self, principal_id: Uuid) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM alerts WHERE principal_id = $1")
            .bind(principal_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    /// Alerts from an address within the window. Authoritative.
    pub async fn count_recent(&self, remote_address: &str, window: Duration) -> Result<i64> {
        let since = Utc::now() - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::minutes(5));
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM alerts WHERE remote_address = $1 AND created_at > $2",
        )
        .bind(remote_address)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    /// Cached variant for listings; at most one second stale.
    pub async fn count_all_cached(&self, principal_id: Uuid) -> Result<i64> {
        let key = format!("p:{principal_id}");
        let now = Instant::now();
        {
            let cache = self.cache.lock().await;
            if let Some((at, count)) = cache.get(&key) {
                if now.duration_since(*at) < CACHE_TTL {
                    return Ok(*count);
                }
            }
        }

        let count = self.count_all(principal_id).await?;

        let mut cache = self.cache.lock().await;
        if cache.len() >= CACHE_CAP {
            cache.retain(|_, (at, _)| now.duration_since(*at) < CACHE_TTL);
        }
        cache.insert(key, (now, count));
        Ok(count)
    }
}
