use chrono::{DateTime, Utc};
use perimeter_shared::{Ban, BanSubjectKind, PerimeterError, Result};
use sqlx::PgPool;

const BAN_COLUMNS: &str = "ban_id, subject_kind, subject, reason, created_at, expires_at, active";

pub struct BanService {
    pool: PgPool,
}

impl BanService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn active_ban(
        &self,
        subject_kind: BanSubjectKind,
        subject: &str,
    ) -> Result<Option<Ban>> {
        sqlx::query_as::<_, Ban>(&format!(
            r#"
            SELECT {BAN_COLUMNS} FROM bans
            WHERE subject_kind = $1 AND subject = $2 AND active
              AND (expires_at IS NULL OR expires_at > now())
            "#
        ))
        .bind(subject_kind)
        .bind(subject)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    /// Write a ban. A principal ban deactivates the principal in the same
    /// transaction. At most one active ban per subject; a concurrent
    /// duplicate resolves to the existing row.
    pub async fn create_ban(
        &self,
        subject_kind: BanSubjectKind,
        subject: &str,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Ban> {
        if let Some(expiry) = expires_at {
            if expiry <= Utc::now() {
                return Err(PerimeterError::InvalidInput(
                    "ban expiry must be in the future".to_string(),
                ));
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        let inserted = sqlx::query_as::<_, Ban>(&format!(
            r#"
            INSERT INTO bans (subject_kind, subject, reason, expires_at, active)
            VALUES ($1, $2, $3, $4, true)
            ON CONFLICT (subject_kind, subject) WHERE active DO NOTHING
            RETURNING {BAN_COLUMNS}
            "#
        ))
        .bind(subject_kind)
        .bind(subject)
        .bind(reason)
        .bind(expires_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        let ban = match inserted {
            Some(ban) => ban,
            None => {
                // Lost the race; the standing ban is the authority.
                tx.rollback()
                    .await
                    .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;
                return self
                    .active_ban(subject_kind, subject)
                    .await?
                    .ok_or_else(|| {
                        PerimeterError::Conflict("ban already exists for subject".to_string())
                    });
            }
        };

        if subject_kind == BanSubjectKind::Principal {
            sqlx::query(
                "UPDATE principals SET is_active = false, updated_at = now() WHERE principal_id = $1::uuid",
            )
            .bind(subject)
            .execute(&mut *tx)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        tracing::warn!(
            subject_kind = ?subject_kind,
            subject = %subject,
            reason = %reason,
            expires_at = ?expires_at,
            "ban written"
        );

        Ok(ban)
    }

    /// Lift the active ban for a subject. Unbanning a principal reactivates
    /// the account.
    pub async fn lift_ban(&self, subject_kind: BanSubjectKind, subject: &str) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE bans SET active = false WHERE subject_kind = $1 AND subject = $2 AND active",
        )
        .bind(subject_kind)
        .bind(subject)
        .execute(&mut *tx)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        if result.rows_affected() > 0 && subject_kind == BanSubjectKind::Principal {
            sqlx::query(
                "UPDATE principals SET is_active = true, updated_at = now() WHERE principal_id = $1::uuid",
            )
            .bind(subject)
            .execute(&mut *tx)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Deactivate bans whose expiry has passed. Run by the background sweep.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE bans SET active = false WHERE active AND expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        if result.rows_affected() > 0 {
            tracing::info!(count = result.rows_affected(), "expired bans deactivated");
        }
        Ok(result.rows_affected())
    }
}
