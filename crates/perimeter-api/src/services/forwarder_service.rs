use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use perimeter_shared::{
    Alert, AlertKind, CreateForwarderRequest, ForwarderConfig, PerimeterError, Result, Severity,
    UpdateForwarderRequest,
};
use sha2::Sha256;
use sqlx::PgPool;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::telemetry;

const FORWARDER_COLUMNS: &str = "forwarder_id, name, endpoint, secret, event_kinds, min_severity, \
                                 enabled, max_retries, timeout_secs, created_at, updated_at";

/// Retries are capped regardless of configuration; backoff is 1 s, 4 s, 16 s.
const MAX_RETRIES: i32 = 3;
/// An item still queued past this age is dropped, not delivered late.
const ITEM_TTL: Duration = Duration::from_secs(120);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
pub struct ForwardItem {
    pub endpoint: String,
    pub secret: String,
    pub body: String,
    pub retries: i32,
    pub timeout: Duration,
    pub deadline: Instant,
}

/// Bounded in-process delivery queue. Overflow drops the oldest item; the
/// caller is told so it can raise an internal alert.
pub struct ForwarderQueue {
    items: Mutex<VecDeque<ForwardItem>>,
    notify: Notify,
    cap: usize,
}

impl ForwarderQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap,
        }
    }

    /// Returns `true` when an older item had to be dropped to make room.
    pub fn push(&self, item: ForwardItem) -> bool {
        let mut items = self.items.lock().expect("forwarder queue poisoned");
        let mut overflowed = false;
        if items.len() >= self.cap {
            items.pop_front();
            overflowed = true;
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        overflowed
    }

    pub async fn pop(&self) -> ForwardItem {
        loop {
            if let Some(item) = self.items.lock().expect("forwarder queue poisoned").pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("forwarder queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// HMAC-SHA256 over the exact request body, hex encoded, carried in the
/// `X-Perimeter-Signature` header.
pub fn sign_payload(secret: &str, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Does this config want this alert?
pub fn config_matches(config: &ForwarderConfig, kind: AlertKind, severity: Severity) -> bool {
    if !config.enabled {
        return false;
    }
    if severity.rank() < config.min_severity.rank() {
        return false;
    }
    // An empty kind list subscribes to everything.
    config.event_kinds.is_empty()
        || config
            .event_kinds
            .iter()
            .any(|k| k == kind.as_slug())
}

pub struct ForwarderService {
    pool: PgPool,
}

impl ForwarderService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Match an alert against every enabled config and enqueue deliveries.
    /// Returns the number of overflow drops the push caused.
    pub async fn dispatch(
        &self,
        queue: &ForwarderQueue,
        alert: &Alert,
        severity_override: Option<Severity>,
    ) -> Result<usize> {
        let severity = severity_override.unwrap_or(alert.severity);
        let configs = self.list_forwarders().await?;
        let mut overflows = 0;

        for config in configs
            .iter()
            .filter(|c| config_matches(c, alert.kind, severity))
        {
            let body = serde_json::json!({
                "event": "security_alert",
                "timestamp": chrono::Utc::now(),
                "severity": severity,
                "alert": alert,
            })
            .to_string();

            let item = ForwardItem {
                endpoint: config.endpoint.clone(),
                secret: config.secret.clone(),
                body,
                retries: config.max_retries.clamp(0, MAX_RETRIES),
                timeout: Duration::from_secs(config.timeout_secs.max(1) as u64),
                deadline: Instant::now() + ITEM_TTL,
            };
            if queue.push(item) {
                overflows += 1;
            }
        }

        Ok(overflows)
    }

    pub async fn list_forwarders(&self) -> Result<Vec<ForwarderConfig>> {
        sqlx::query_as::<_, ForwarderConfig>(&format!(
            "SELECT {FORWARDER_COLUMNS} FROM forwarder_configs ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    pub async fn get_forwarder(&self, forwarder_id: Uuid) -> Result<Option<ForwarderConfig>> {
        sqlx::query_as::<_, ForwarderConfig>(&format!(
            "SELECT {FORWARDER_COLUMNS} FROM forwarder_configs WHERE forwarder_id = $1"
        ))
        .bind(forwarder_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    pub async fn create_forwarder(&self, request: CreateForwarderRequest) -> Result<ForwarderConfig> {
        validate_endpoint(&request.endpoint)?;
        sqlx::query_as::<_, ForwarderConfig>(&format!(
            r#"
            INSERT INTO forwarder_configs
            (name, endpoint, secret, event_kinds, min_severity, enabled, max_retries, timeout_secs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {FORWARDER_COLUMNS}
            "#
        ))
        .bind(&request.name)
        .bind(&request.endpoint)
        .bind(&request.secret)
        .bind(&request.event_kinds)
        .bind(request.min_severity)
        .bind(request.enabled.unwrap_or(true))
        .bind(request.max_retries.unwrap_or(MAX_RETRIES))
        .bind(request.timeout_secs.unwrap_or(5))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    pub async fn update_forwarder(
        &self,
        forwarder_id: Uuid,
        request: UpdateForwarderRequest,
    ) -> Result<ForwarderConfig> {
        if let Some(endpoint) = &request.endpoint {
            validate_endpoint(endpoint)?;
        }
        sqlx::query_as::<_, ForwarderConfig>(&format!(
            r#"
            UPDATE forwarder_configs
            SET name = COALESCE($2, name),
                endpoint = COALESCE($3, endpoint),
                secret = COALESCE($4, secret),
                event_kinds = COALESCE($5, event_kinds),
                min_severity = COALESCE($6, min_severity),
                enabled = COALESCE($7, enabled),
                max_retries = COALESCE($8, max_retries),
                timeout_secs = COALESCE($9, timeout_secs),
                updated_at = now()
            WHERE forwarder_id = $1
            RETURNING {FORWARDER_COLUMNS}
            "#
        ))
        .bind(forwarder_id)
        .bind(request.name)
        .bind(request.endpoint)
        .bind(request.secret)
        .bind(request.event_kinds)
        .bind(request.min_severity)
        .bind(request.enabled)
        .bind(request.max_retries)
        .bind(request.timeout_secs)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?
        .ok_or_else(|| PerimeterError::NotFound(format!("forwarder {forwarder_id}")))
    }

    pub async fn delete_forwarder(&self, forwarder_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM forwarder_configs WHERE forwarder_id = $1")
            .bind(forwarder_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    /// Synchronous test delivery so an operator can verify a sink.
    pub async fn test_ping(&self, forwarder_id: Uuid) -> Result<bool> {
        let config = self
            .get_forwarder(forwarder_id)
            .await?
            .ok_or_else(|| PerimeterError::NotFound(format!("forwarder {forwarder_id}")))?;

        let body = serde_json::json!({
            "event": "test",
            "timestamp": chrono::Utc::now(),
            "forwarder_id": forwarder_id,
        })
        .to_string();

        let client = reqwest::Client::new();
        let response = client
            .post(&config.endpoint)
            .header("Content-Type", "application/json")
            .header("X-Perimeter-Signature", sign_payload(&config.secret, &body))
            .timeout(Duration::from_secs(config.timeout_secs.max(1) as u64))
            .body(body)
            .send()
            .await;

        Ok(matches!(response, Ok(r) if r.status().is_success()))
    }
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(())
    } else {
        Err(PerimeterError::InvalidInput(
            "forwarder endpoint must be an http(s) URL".to_string(),
        ))
    }
}

/// Background delivery loop. Failures are contained here; nothing propagates
/// to request processing.
pub async fn run_forwarder_worker(queue: Arc<ForwarderQueue>) {
    let client = reqwest::Client::new();
    loop {
        let item = queue.pop().await;
        if Instant::now() > item.deadline {
            tracing::warn!(endpoint = %item.endpoint, "dropping stale forwarder item");
            telemetry::metrics::handle().forwarder_failures.add(1, &[]);
            continue;
        }
        deliver(&client, item).await;
    }
}

async fn deliver(client: &reqwest::Client, item: ForwardItem) {
    let signature = sign_payload(&item.secret, &item.body);
    let attempts = item.retries.max(0) as u32 + 1;

    for attempt in 0..attempts {
        if attempt > 0 {
            // 1 s, 4 s, 16 s
            let backoff = Duration::from_secs(4_u64.pow(attempt - 1));
            tokio::time::sleep(backoff).await;
            if Instant::now() > item.deadline {
                tracing::warn!(endpoint = %item.endpoint, "forwarder item expired mid-retry");
                break;
            }
        }

        let result = client
            .post(&item.endpoint)
            .header("Content-Type", "application/json")
            .header("X-Perimeter-Signature", signature.clone())
            .timeout(item.timeout)
            .body(item.body.clone())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                telemetry::metrics::handle().forwarder_deliveries.add(1, &[]);
                tracing::debug!(endpoint = %item.endpoint, attempt, "alert forwarded");
                return;
            }
            Ok(response) => {
                tracing::warn!(
                    endpoint = %item.endpoint,
                    status = %response.status(),
                    attempt,
                    "forwarder sink rejected delivery"
                );
            }
            Err(e) => {
                tracing::warn!(endpoint = %item.endpoint, error = %e, attempt, "forwarder delivery failed");
            }
        }
    }

    telemetry::metrics::handle().forwarder_failures.add(1, &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config(enabled: bool, min: Severity, kinds: &[&str]) -> ForwarderConfig {
        ForwarderConfig {
            forwarder_id: Uuid::new_v4(),
            name: "ir-sink".to_string(),
            endpoint: "https://ir.example.test/hook".to_string(),
            secret: "s3cret".to_string(),
            event_kinds: kinds.iter().map(|k| k.to_string()).collect(),
            min_severity: min,
            enabled,
            max_retries: 3,
            timeout_secs: 5,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn item(tag: &str) -> ForwardItem {
        ForwardItem {
            endpoint: "https://ir.example.test/hook".to_string(),
            secret: "s3cret".to_string(),
            body: tag.to_string(),
            retries: 0,
            timeout: Duration::from_secs(5),
            deadline: Instant::now() + Duration::from_secs(60),
        }
    }

    #[test]
    fn signature_is_stable_and_keyed() {
        let a = sign_payload("secret", "{\"x\":1}");
        let b = sign_payload("secret", "{\"x\":1}");
        let c = sign_payload("other", "{\"x\":1}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("sha256="));
        assert_eq!(a.len(), "sha256=".len() + 64);
    }

    #[test]
    fn matching_honors_enabled_kind_and_severity() {
        let c = config(true, Severity::High, &["sql_injection"]);
        assert!(config_matches(&c, AlertKind::SqlInjection, Severity::High));
        assert!(config_matches(&c, AlertKind::SqlInjection, Severity::Critical));
        assert!(!config_matches(&c, AlertKind::SqlInjection, Severity::Medium));
        assert!(!config_matches(&c, AlertKind::Xss, Severity::Critical));
        assert!(!config_matches(
            &config(false, Severity::Low, &[]),
            AlertKind::Xss,
            Severity::Critical
        ));
    }

    #[test]
    fn empty_kind_list_subscribes_to_everything() {
        let c = config(true, Severity::Low, &[]);
        assert!(config_matches(&c, AlertKind::ApiAbuse, Severity::Low));
        assert!(config_matches(&c, AlertKind::BruteForce, Severity::High));
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let queue = ForwarderQueue::new(2);
        assert!(!queue.push(item("a")));
        assert!(!queue.push(item("b")));
        assert!(queue.push(item("c")));
        assert_eq!(queue.len(), 2);
        let first = queue.items.lock().unwrap().pop_front().unwrap();
        assert_eq!(first.body, "b");
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(ForwarderQueue::new(8));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.body })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(item("later"));
        assert_eq!(popper.await.unwrap(), "later");
    }
}
