use std::sync::Arc;

use opentelemetry::KeyValue;
use perimeter_shared::{Alert, AlertContext, AlertKind, Finding, Result, Severity};
use sqlx::PgPool;

use crate::config::Config;
use crate::services::alert_service::AlertService;
use crate::services::alert_stream::AlertStreamHub;
use crate::services::classifier::{self, Classifier};
use crate::services::forwarder_service::{ForwarderQueue, ForwarderService};
use crate::services::penalty_service::PenaltyService;
use crate::services::subject_locks::{subject_key, SubjectLocks};
use crate::telemetry;

/// Orchestrates the post-classification path: dedupe → persist → offense
/// count → penalty → forward, serialized per subject.
#[derive(Clone)]
pub struct PipelineService {
    pool: PgPool,
    config: Arc<Config>,
    classifier: Arc<Classifier>,
    locks: Arc<SubjectLocks>,
    stream: AlertStreamHub,
    queue: Arc<ForwarderQueue>,
}

impl PipelineService {
    pub fn new(
        pool: PgPool,
        config: Arc<Config>,
        classifier: Arc<Classifier>,
        locks: Arc<SubjectLocks>,
        stream: AlertStreamHub,
        queue: Arc<ForwarderQueue>,
    ) -> Self {
        Self {
            pool,
            config,
            classifier,
            locks,
            stream,
            queue,
        }
    }

    pub async fn process_findings(&self, findings: &[Finding], ctx: &AlertContext) {
        for finding in findings {
            let mut result = self.process_finding(finding, ctx).await;
            if matches!(result, Err(perimeter_shared::PerimeterError::DatabaseError(_))) {
                // One retry for transient store errors, then drop the alert.
                result = self.process_finding(finding, ctx).await;
            }
            if let Err(e) = result {
                // The request path never fails because of the pipeline.
                tracing::error!(
                    kind = finding.kind.as_slug(),
                    error = %e,
                    "failed to process finding, alert dropped"
                );
            }
        }
    }

    /// Run one finding through the full pipeline. Returns the stored alert,
    /// or `None` when the source is whitelisted.
    pub async fn process_finding(
        &self,
        finding: &Finding,
        ctx: &AlertContext,
    ) -> Result<Option<Alert>> {
        if self.classifier.is_suppressed(ctx.remote_address.as_deref()) {
            return Ok(None);
        }

        let key = subject_key(ctx.principal_id, ctx.remote_address.as_deref());
        let lock = self.locks.acquire(&key);
        let _guard = lock.lock().await;

        let alert_service = AlertService::with_stream(
            self.pool.clone(),
            self.stream.clone(),
            self.config.dedupe_window_secs,
        );
        let (alert, created) = alert_service.create_alert(finding, ctx).await?;

        let m = telemetry::metrics::handle();
        if !created {
            m.alerts_deduped.add(1, &[]);
            return Ok(Some(alert));
        }
        m.alerts_created
            .add(1, &[KeyValue::new("kind", finding.kind.as_slug())]);

        let penalty = PenaltyService::new(self.pool.clone(), &self.config);
        let outcome = penalty.evaluate(&alert).await?;

        let forwarder = ForwarderService::new(self.pool.clone());
        let mut overflows = forwarder.dispatch(&self.queue, &alert, None).await?;
        if let Some(severity) = outcome.escalation_severity() {
            overflows += forwarder
                .dispatch(&self.queue, &alert, Some(severity))
                .await?;
        }

        if overflows > 0 {
            self.emit_internal(
                AlertKind::ForwarderOverflow,
                Severity::Low,
                &format!("forwarder queue overflowed, {overflows} dropped"),
                ctx,
            )
            .await;
        }

        Ok(Some(alert))
    }

    /// Record an internally generated condition as an alert without running
    /// the penalty path. Best effort; never propagates an error.
    pub async fn emit_internal(
        &self,
        kind: AlertKind,
        severity: Severity,
        message: &str,
        ctx: &AlertContext,
    ) {
        if self.classifier.is_suppressed(ctx.remote_address.as_deref()) {
            tracing::warn!(kind = kind.as_slug(), message, "internal alert from suppressed source");
            return;
        }
        let finding = classifier::finding_for(kind, severity, message);
        let alert_service = AlertService::with_stream(
            self.pool.clone(),
            self.stream.clone(),
            self.config.dedupe_window_secs,
        );
        if let Err(e) = alert_service.create_alert(&finding, ctx).await {
            tracing::error!(kind = kind.as_slug(), error = %e, "failed to record internal alert");
        }
    }
}
