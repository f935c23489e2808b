use chrono::{DateTime, Duration, Utc};
use data_encoding::BASE64URL_NOPAD;
use perimeter_shared::{
    Alert, AlertContext, AlertFilter, AlertStatus, Finding, PerimeterError, Result,
};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::services::alert_stream::AlertStreamHub;
use crate::services::classifier;

const ALERT_COLUMNS: &str = "alert_id, created_at, principal_id, remote_address, route, method, \
                             kind, severity, risk_score, signature, payload, user_agent, status, metadata";

/// Persisted payload excerpts are capped at 4 KiB.
const MAX_PAYLOAD_BYTES: usize = 4096;
/// Hard ceiling on rows per export response; continuation is via cursor.
pub const EXPORT_ROW_CAP: usize = 100_000;
const EXPORT_PAGE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug)]
pub struct ExportChunk {
    pub content: String,
    pub row_count: usize,
    /// Present when the row cap was hit; pass back to continue.
    pub next_cursor: Option<String>,
}

pub struct AlertService {
    pool: PgPool,
    stream: Option<AlertStreamHub>,
    dedupe_window_secs: i64,
}

impl AlertService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stream: None,
            dedupe_window_secs: 5,
        }
    }

    pub fn with_stream(pool: PgPool, stream: AlertStreamHub, dedupe_window_secs: i64) -> Self {
        Self {
            pool,
            stream: Some(stream),
            dedupe_window_secs,
        }
    }

    /// Persist a finding. Within the dedupe window an identical offense
    /// (same subject, kind, and signature) collapses onto the existing row;
    /// the returned flag is `true` only for a newly inserted alert.
    pub async fn create_alert(
        &self,
        finding: &Finding,
        ctx: &AlertContext,
    ) -> Result<(Alert, bool)> {
        if ctx.principal_id.is_none() && ctx.remote_address.is_none() {
            return Err(PerimeterError::InvalidInput(
                "alert requires a principal or a remote address".to_string(),
            ));
        }

        let window_start = Utc::now() - Duration::seconds(self.dedupe_window_secs);
        let existing = sqlx::query_as::<_, Alert>(&format!(
            r#"
            SELECT {ALERT_COLUMNS}
            FROM alerts
            WHERE kind = $1 AND signature = $2
              AND (($3::uuid IS NOT NULL AND principal_id = $3)
                   OR ($4::text IS NOT NULL AND remote_address = $4))
              AND created_at > $5
            ORDER BY created_at DESC, alert_id DESC
            LIMIT 1
            "#
        ))
        .bind(finding.kind)
        .bind(&finding.signature)
        .bind(ctx.principal_id)
        .bind(ctx.remote_address.as_deref())
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        if let Some(alert) = existing {
            tracing::debug!(
                alert_id = %alert.alert_id,
                kind = finding.kind.as_slug(),
                signature = %finding.signature,
                "suppressed duplicate alert within dedupe window"
            );
            return Ok((alert, false));
        }

        let alert = sqlx::query_as::<_, Alert>(&format!(
            r#"
            INSERT INTO alerts
            (principal_id, remote_address, route, method, kind, severity, risk_score,
             signature, payload, user_agent, status, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'new', $11)
            RETURNING {ALERT_COLUMNS}
            "#
        ))
        .bind(ctx.principal_id)
        .bind(ctx.remote_address.as_deref())
        .bind(&ctx.route)
        .bind(&ctx.method)
        .bind(finding.kind)
        .bind(finding.severity)
        .bind(classifier::risk_score(finding))
        .bind(&finding.signature)
        .bind(sanitize_payload(&ctx.payload))
        .bind(ctx.user_agent.as_deref())
        .bind(&ctx.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        if let Some(stream) = &self.stream {
            stream.publish(&alert);
        }

        Ok((alert, true))
    }

    pub async fn get_alert(&self, alert_id: Uuid) -> Result<Option<Alert>> {
        sqlx::query_as::<_, Alert>(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE alert_id = $1"
        ))
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    /// Status transitions are monotonic: an alert that has left `new` can
    /// move between the reviewed states but never back to `new`.
    pub async fn update_status(&self, alert_id: Uuid, status: AlertStatus) -> Result<Alert> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        let current = sqlx::query_as::<_, Alert>(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE alert_id = $1 FOR UPDATE"
        ))
        .bind(alert_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?
        .ok_or_else(|| PerimeterError::NotFound(format!("alert {alert_id}")))?;

        if current.status.is_terminal() && status == AlertStatus::New {
            return Err(PerimeterError::Conflict(
                "alert status cannot revert to new".to_string(),
            ));
        }

        let updated = sqlx::query_as::<_, Alert>(&format!(
            "UPDATE alerts SET status = $2 WHERE alert_id = $1 RETURNING {ALERT_COLUMNS}"
        ))
        .bind(alert_id)
        .bind(status)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        Ok(updated)
    }

    /// Filtered listing with an exact total under the same filter.
    pub async fn query_alerts(
        &self,
        filter: &AlertFilter,
        skip: i64,
        limit: i64,
    ) -> Result<(Vec<Alert>, i64)> {
        let limit = limit.clamp(1, 200);
        let skip = skip.max(0);

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE 1=1"
        ));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, alert_id DESC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(skip);

        let alerts: Vec<Alert> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM alerts WHERE 1=1");
        push_filter(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        Ok((alerts, total))
    }

    /// Bulk clear under a filter. Callers audit this.
    pub async fn delete_by_filter(&self, filter: &AlertFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM alerts WHERE 1=1");
        push_filter(&mut qb, filter);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Replay for stream reconnection: everything newer than the given id,
    /// oldest first.
    pub async fn alerts_after(&self, after: Uuid) -> Result<Vec<Alert>> {
        sqlx::query_as::<_, Alert>(&format!(
            r#"
            SELECT {ALERT_COLUMNS} FROM alerts
            WHERE (created_at, alert_id) > (SELECT created_at, alert_id FROM alerts WHERE alert_id = $1)
            ORDER BY created_at ASC, alert_id ASC
            LIMIT 500
            "#
        ))
        .bind(after)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    /// Export the filtered set as NDJSON or CSV. At most `EXPORT_ROW_CAP`
    /// rows per call; the returned cursor continues past the cap.
    pub async fn export(
        &self,
        filter: &AlertFilter,
        format: ExportFormat,
        cursor: Option<&str>,
    ) -> Result<ExportChunk> {
        let mut position = match cursor {
            Some(raw) => Some(decode_cursor(raw)?),
            None => None,
        };

        let mut content = String::new();
        if format == ExportFormat::Csv && position.is_none() {
            content.push_str(
                "id,created_at,principal_id,remote_address,route,method,kind,severity,risk_score,status,signature,payload_excerpt\n",
            );
        }

        let mut row_count = 0_usize;
        loop {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT {ALERT_COLUMNS} FROM alerts WHERE 1=1"
            ));
            push_filter(&mut qb, filter);
            if let Some((ts, id)) = position {
                qb.push(" AND (created_at, alert_id) < (");
                qb.push_bind(ts);
                qb.push(", ");
                qb.push_bind(id);
                qb.push(")");
            }
            qb.push(" ORDER BY created_at DESC, alert_id DESC LIMIT ");
            qb.push_bind(EXPORT_PAGE as i64);

            let page: Vec<Alert> = qb
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

            if page.is_empty() {
                return Ok(ExportChunk {
                    content,
                    row_count,
                    next_cursor: None,
                });
            }

            for alert in &page {
                match format {
                    ExportFormat::Json => {
                        content.push_str(&export_json_line(alert)?);
                        content.push('\n');
                    }
                    ExportFormat::Csv => {
                        content.push_str(&export_csv_line(alert));
                        content.push('\n');
                    }
                }
                row_count += 1;
                position = Some((alert.created_at, alert.alert_id));
                if row_count >= EXPORT_ROW_CAP {
                    let (ts, id) = position.expect("position set");
                    return Ok(ExportChunk {
                        content,
                        row_count,
                        next_cursor: Some(encode_cursor(ts, id)),
                    });
                }
            }
        }
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &AlertFilter) {
    if let Some(severity) = filter.severity {
        qb.push(" AND severity = ");
        qb.push_bind(severity);
    }
    if let Some(kind) = filter.kind {
        qb.push(" AND kind = ");
        qb.push_bind(kind);
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

/// Strip control characters and bound the excerpt before it is persisted.
pub fn sanitize_payload(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    if out.len() > MAX_PAYLOAD_BYTES {
        let mut cut = MAX_PAYLOAD_BYTES;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

fn payload_excerpt(alert: &Alert) -> String {
    let mut excerpt = alert.payload.clone();
    if excerpt.len() > 256 {
        let mut cut = 256;
        while !excerpt.is_char_boundary(cut) {
            cut -= 1;
        }
        excerpt.truncate(cut);
    }
    excerpt
}

fn export_json_line(alert: &Alert) -> Result<String> {
    let value = serde_json::json!({
        "id": alert.alert_id,
        "created_at": alert.created_at,
        "principal_id": alert.principal_id,
        "remote_address": alert.remote_address,
        "route": alert.route,
        "method": alert.method,
        "kind": alert.kind,
        "severity": alert.severity,
        "risk_score": alert.risk_score,
        "status": alert.status,
        "signature": alert.signature,
        "payload_excerpt": payload_excerpt(alert),
    });
    serde_json::to_string(&value).map_err(|e| PerimeterError::InternalError(e.to_string()))
}

fn export_csv_line(alert: &Alert) -> String {
    let fields = [
        alert.alert_id.to_string(),
        alert.created_at.to_rfc3339(),
        alert
            .principal_id
            .map(|id| id.to_string())
            .unwrap_or_default(),
        alert.remote_address.clone().unwrap_or_default(),
        alert.route.clone(),
        alert.method.clone(),
        alert.kind.as_slug().to_string(),
        wire_slug(&alert.severity),
        alert.risk_score.to_string(),
        wire_slug(&alert.status),
        alert.signature.clone(),
        payload_excerpt(alert),
    ];
    fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Serialized wire name of an enum value ("false_positive", not the Rust
/// variant name).
fn wire_slug<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn encode_cursor(ts: DateTime<Utc>, id: Uuid) -> String {
    BASE64URL_NOPAD.encode(format!("{}|{}", ts.timestamp_micros(), id).as_bytes())
}

fn decode_cursor(raw: &str) -> Result<(DateTime<Utc>, Uuid)> {
    let invalid = || PerimeterError::InvalidInput("invalid export cursor".to_string());
    let bytes = BASE64URL_NOPAD.decode(raw.as_bytes()).map_err(|_| invalid())?;
    let text = String::from_utf8(bytes).map_err(|_| invalid())?;
    let (micros, id) = text.split_once('|').ok_or_else(invalid)?;
    let micros: i64 = micros.parse().map_err(|_| invalid())?;
    let ts = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(invalid)?;
    let id: Uuid = id.parse().map_err(|_| invalid())?;
    Ok((ts, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use perimeter_shared::{AlertKind, Severity};

    fn alert_fixture() -> Alert {
        Alert {
            alert_id: Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap(),
            created_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap(),
            principal_id: None,
            remote_address: Some("203.0.113.9".to_string()),
            route: "/auth/login".to_string(),
            method: "POST".to_string(),
            kind: AlertKind::SqlInjection,
            severity: Severity::High,
            risk_score: 82,
            signature: "SIGSIGSIGSIGSIGSIGSIGSIGSI".to_string(),
            payload: "password=' OR 1=1 --".to_string(),
            user_agent: None,
            status: AlertStatus::New,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn csv_line_has_stable_column_order() {
        let line = export_csv_line(&alert_fixture());
        let cols: Vec<&str> = line.split(',').collect();
        assert_eq!(cols[0], "6f9619ff-8b86-d011-b42d-00c04fc964ff");
        assert_eq!(cols[4], "/auth/login");
        assert_eq!(cols[6], "sql_injection");
        assert_eq!(cols[7], "high");
        assert_eq!(cols[8], "82");
        assert_eq!(cols[9], "new");
    }

    #[test]
    fn csv_escapes_embedded_quotes_and_commas() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn cursor_round_trips() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let id = Uuid::new_v4();
        let encoded = encode_cursor(ts, id);
        let (ts2, id2) = decode_cursor(&encoded).unwrap();
        assert_eq!(ts, ts2);
        assert_eq!(id, id2);
    }

    #[test]
    fn malformed_cursor_is_rejected() {
        assert!(decode_cursor("not base64 at all!!").is_err());
        let bogus = BASE64URL_NOPAD.encode(b"no-pipe-here");
        assert!(decode_cursor(&bogus).is_err());
    }

    #[test]
    fn payload_is_sanitized_and_bounded() {
        let raw = format!("abc\x00def\x1b[31m{}", "x".repeat(8192));
        let clean = sanitize_payload(&raw);
        assert!(!clean.contains('\x00'));
        assert!(!clean.contains('\x1b'));
        assert!(clean.len() <= MAX_PAYLOAD_BYTES);
        assert!(clean.starts_with("abcdef"));
    }

    #[test]
    fn json_export_line_carries_excerpt_not_full_payload() {
        let mut alert = alert_fixture();
        alert.payload = "p".repeat(1000);
        let line = export_json_line(&alert).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["payload_excerpt"].as_str().unwrap().len(), 256);
    }
}
