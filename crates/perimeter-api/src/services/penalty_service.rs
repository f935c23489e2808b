use chrono::Utc;
use perimeter_shared::{
    AdminActionKind, Alert, BanSubjectKind, PerimeterError, PrincipalRole, Result, Severity,
};
use sqlx::PgPool;

use crate::config::Config;
use crate::services::audit_service::AuditService;
use crate::services::ban_service::BanService;
use crate::services::offense_service::OffenseService;
use crate::telemetry;

/// What the engine did for one alert; the pipeline forwards accordingly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PenaltyOutcome {
    pub principal_banned: bool,
    pub suspended: bool,
    pub address_banned: bool,
}

impl PenaltyOutcome {
    /// Severity override for the incident forward, if any action fired.
    pub fn escalation_severity(&self) -> Option<Severity> {
        if self.principal_banned {
            Some(Severity::Critical)
        } else if self.suspended || self.address_banned {
            Some(Severity::High)
        } else {
            None
        }
    }
}

/// Applies `active → suspended → banned` transitions after every new alert.
/// Callers must hold the subject lock so count-read and ban-write are
/// serialized per subject.
pub struct PenaltyService {
    pool: PgPool,
    suspend_threshold: i64,
    ban_threshold: i64,
    addr_burst_threshold: i64,
    addr_ban_duration_secs: i64,
    addr_burst_window: std::time::Duration,
}

impl PenaltyService {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        Self {
            pool,
            suspend_threshold: config.suspend_threshold,
            ban_threshold: config.ban_threshold,
            addr_burst_threshold: config.addr_burst_threshold,
            addr_ban_duration_secs: config.addr_ban_duration_secs,
            addr_burst_window: config.addr_burst_window(),
        }
    }

    pub async fn evaluate(&self, alert: &Alert) -> Result<PenaltyOutcome> {
        let mut outcome = PenaltyOutcome::default();

        if let Some(principal_id) = alert.principal_id {
            outcome = self
                .evaluate_principal(
                    principal_id,
                    alert,
                    self.ban_threshold,
                    self.suspend_threshold,
                )
                .await?;
        }

        // Critical findings act on a halved burst threshold. Principal
        // thresholds stay fixed: suspension and ban counts are part of the
        // audited contract.
        let burst_threshold = if alert.severity == Severity::Critical {
            (self.addr_burst_threshold / 2).max(1)
        } else {
            self.addr_burst_threshold
        };

        if let Some(address) = alert.remote_address.as_deref() {
            outcome.address_banned = self.evaluate_address(address, burst_threshold).await?;
        }

        Ok(outcome)
    }

    async fn evaluate_principal(
        &self,
        principal_id: uuid::Uuid,
        alert: &Alert,
        ban_threshold: i64,
        suspend_threshold: i64,
    ) -> Result<PenaltyOutcome> {
        let mut outcome = PenaltyOutcome::default();

        let Some((role, is_active)) = sqlx::query_as::<_, (PrincipalRole, bool)>(
            "SELECT role, is_active FROM principals WHERE principal_id = $1",
        )
        .bind(principal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?
        else {
            return Ok(outcome);
        };

        if role == PrincipalRole::Admin {
            tracing::info!(
                principal_id = %principal_id,
                alert_id = %alert.alert_id,
                "admin principal exempt from automatic penalties"
            );
            return Ok(outcome);
        }

        let offense = OffenseService::new(self.pool.clone());
        let bans = BanService::new(self.pool.clone());
        let audit = AuditService::new(self.pool.clone());

        let n = offense.count_all(principal_id).await?;
        let subject = principal_id.to_string();

        if n >= ban_threshold {
            if bans
                .active_ban(BanSubjectKind::Principal, &subject)
                .await?
                .is_none()
            {
                bans.create_ban(
                    BanSubjectKind::Principal,
                    &subject,
                    &format!("{n} security alerts on record"),
                    None,
                )
                .await?;
                audit
                    .append(
                        None,
                        AdminActionKind::AutoBan,
                        &subject,
                        Some(&format!("offense count {n} >= {ban_threshold}")),
                    )
                    .await?;
                telemetry::metrics::handle().bans_issued.add(1, &[]);
                tracing::warn!(principal_id = %principal_id, count = n, "principal auto-banned");
                outcome.principal_banned = true;
            }
        } else if n >= suspend_threshold && is_active {
            sqlx::query(
                "UPDATE principals SET is_active = false, updated_at = now() WHERE principal_id = $1",
            )
            .bind(principal_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

            audit
                .append(
                    None,
                    AdminActionKind::AutoSuspend,
                    &subject,
                    Some(&format!("offense count {n} >= {suspend_threshold}")),
                )
                .await?;
            telemetry::metrics::handle().suspensions.add(1, &[]);
            tracing::warn!(principal_id = %principal_id, count = n, "principal auto-suspended");
            outcome.suspended = true;
        }

        Ok(outcome)
    }

    async fn evaluate_address(&self, address: &str, burst_threshold: i64) -> Result<bool> {
        let offense = OffenseService::new(self.pool.clone());
        let bans = BanService::new(self.pool.clone());
        let audit = AuditService::new(self.pool.clone());

        let m = offense.count_recent(address, self.addr_burst_window).await?;
        if m < burst_threshold {
            return Ok(false);
        }
        if bans
            .active_ban(BanSubjectKind::Address, address)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        let expires_at = Utc::now() + chrono::Duration::seconds(self.addr_ban_duration_secs);
        bans.create_ban(
            BanSubjectKind::Address,
            address,
            &format!("{m} alerts inside the burst window"),
            Some(expires_at),
        )
        .await?;
        audit
            .append(
                None,
                AdminActionKind::AutoIpBan,
                address,
                Some(&format!("burst count {m} >= {burst_threshold}")),
            )
            .await?;
        telemetry::metrics::handle().bans_issued.add(1, &[]);
        tracing::warn!(address = %address, count = m, "address auto-banned");
        Ok(true)
    }
}
