use chrono::{DateTime, Utc};
use perimeter_shared::{PerimeterError, Result, WebRequest};
use serde::Deserialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

const REQUEST_COLUMNS: &str =
    "request_id, created_at, method, path, status, latency_ms, remote_address, principal_id";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebRequestFilter {
    pub method: Option<String>,
    pub status: Option<i32>,
    pub principal_id: Option<Uuid>,
    pub remote_address: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

/// Operator introspection: one row per request, written off the hot path.
pub struct WebRequestService {
    pool: PgPool,
}

impl WebRequestService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        method: &str,
        path: &str,
        status: i32,
        latency_ms: i64,
        remote_address: &str,
        principal_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO web_requests (method, path, status, latency_ms, remote_address, principal_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(method)
        .bind(path)
        .bind(status)
        .bind(latency_ms)
        .bind(remote_address)
        .bind(principal_id)
        .execute(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    pub async fn query_requests(
        &self,
        filter: &WebRequestFilter,
        skip: i64,
        limit: i64,
    ) -> Result<(Vec<WebRequest>, i64)> {
        let limit = limit.clamp(1, 200);
        let skip = skip.max(0);

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {REQUEST_COLUMNS} FROM web_requests WHERE 1=1"
        ));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, request_id DESC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(skip);

        let rows: Vec<WebRequest> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM web_requests WHERE 1=1");
        push_filter(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        Ok((rows, total))
    }

    pub async fn delete_by_filter(&self, filter: &WebRequestFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM web_requests WHERE 1=1");
        push_filter(&mut qb, filter);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &WebRequestFilter) {
    if let Some(method) = &filter.method {
        qb.push(" AND method = ");
        qb.push_bind(method.clone());
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ");
        qb.push_bind(status);
    }
    if let Some(principal_id) = filter.principal_id {
        qb.push(" AND principal_id = ");
        qb.push_bind(principal_id);
    }
    if let Some(remote_address) = &filter.remote_address {
        qb.push(" AND remote_address = ");
        qb.push_bind(remote_address.clone());
    }
    if let Some(after) = filter.after {
        qb.push(" AND created_at > ");
        qb.push_bind(after);
    }
    if let Some(before) = filter.before {
        qb.push(" AND created_at < ");
        qb.push_bind(before);
    }
}
