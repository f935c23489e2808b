use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::user_service::normalize_email;

/// Resolves the principal a request should be attributed to, so pre-auth
/// attacks land on the targeted account instead of only the attacker's
/// address. Infallible: any ambiguity or error resolves to `None`.
pub struct IdentityService {
    pool: PgPool,
}

impl IdentityService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn resolve(
        &self,
        session_principal: Option<Uuid>,
        body: &[u8],
        remote_address: Option<&str>,
    ) -> Option<Uuid> {
        if let Some(principal_id) = session_principal {
            return Some(principal_id);
        }

        if let Some(candidate) = extract_credential_field(body) {
            if let Some(principal_id) = self.lookup_email(&candidate).await {
                return Some(principal_id);
            }
        }

        // Sticky attribution: reuse the newest attribution for this address
        // so rapid-fire attempts against one victim do not oscillate.
        if let Some(addr) = remote_address {
            return self.sticky_principal(addr).await;
        }

        None
    }

    async fn lookup_email(&self, raw: &str) -> Option<Uuid> {
        let email = normalize_email(raw);
        if email.is_empty() {
            return None;
        }
        sqlx::query_scalar::<_, Uuid>("SELECT principal_id FROM principals WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
    }

    async fn sticky_principal(&self, remote_address: &str) -> Option<Uuid> {
        let since = Utc::now() - Duration::seconds(30);
        sqlx::query_scalar::<_, Option<Uuid>>(
            r#"
            SELECT principal_id FROM alerts
            WHERE remote_address = $1 AND principal_id IS NOT NULL AND created_at > $2
            ORDER BY created_at DESC, alert_id DESC
            LIMIT 1
            "#,
        )
        .bind(remote_address)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
        .flatten()
    }
}

/// Pull a credential identifier out of a request body: `email` first, then
/// `username`, from JSON or form encoding. Best effort only.
pub fn extract_credential_field(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    let trimmed = text.trim_start();

    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        for key in ["email", "username"] {
            if let Some(field) = value.get(key).and_then(|v| v.as_str()) {
                if !field.trim().is_empty() {
                    return Some(field.to_string());
                }
            }
        }
        return None;
    }

    // Form encoding: first match wins per key priority.
    let mut username = None;
    for pair in trimmed.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let Ok(decoded) = urlencoding::decode(value).map(|v| v.into_owned()) else {
            continue;
        };
        if decoded.trim().is_empty() {
            continue;
        }
        match key {
            "email" => return Some(decoded),
            "username" if username.is_none() => username = Some(decoded),
            _ => {}
        }
    }
    username
}
