use std::sync::Arc;

use crate::config::Config;
use crate::database::Database;
use crate::services::alert_stream::AlertStreamHub;
use crate::services::auth_service::AuthService;
use crate::services::classifier::Classifier;
use crate::services::forwarder_service::ForwarderQueue;
use crate::services::pipeline_service::PipelineService;
use crate::services::rate_limit::RateLimiter;
use crate::services::subject_locks::SubjectLocks;
use crate::services::user_service::UserService;

/// Shared handles threaded through every handler and the enforcement
/// middleware. Everything here is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub classifier: Arc<Classifier>,
    pub rate_limiter: Arc<RateLimiter>,
    pub subject_locks: Arc<SubjectLocks>,
    pub stream: AlertStreamHub,
    pub forwarder_queue: Arc<ForwarderQueue>,
}

impl AppState {
    pub fn new(db: Database, config: Arc<Config>) -> Self {
        let classifier = Arc::new(Classifier::new(
            config.whitelist_addrs.clone(),
            config.testing,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_n,
            config.rate_limit_window(),
        ));

        Self {
            db,
            classifier,
            rate_limiter,
            subject_locks: Arc::new(SubjectLocks::new()),
            stream: AlertStreamHub::new(256),
            forwarder_queue: Arc::new(ForwarderQueue::new(config.forwarder_queue_cap)),
            config,
        }
    }

    pub fn pipeline(&self) -> PipelineService {
        PipelineService::new(
            self.db.pool().clone(),
            self.config.clone(),
            self.classifier.clone(),
            self.subject_locks.clone(),
            self.stream.clone(),
            self.forwarder_queue.clone(),
        )
    }

    pub fn auth_service(&self) -> AuthService {
        AuthService::new(self.config.jwt_secret.clone())
    }

    pub fn user_service(&self) -> UserService {
        UserService::new(self.db.pool().clone(), self.auth_service())
    }
}
