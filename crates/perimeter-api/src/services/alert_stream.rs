use perimeter_shared::Alert;
use tokio::sync::broadcast;

/// In-process fan-out of newly created (post-dedupe) alerts to live admin
/// streams. Slow subscribers lag and resync from the table via `?after`.
#[derive(Clone)]
pub struct AlertStreamHub {
    tx: broadcast::Sender<Alert>,
}

impl AlertStreamHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, alert: &Alert) {
        // No receivers is the normal idle state, not an error.
        let _ = self.tx.send(alert.clone());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use perimeter_shared::{AlertKind, AlertStatus, Severity};
    use uuid::Uuid;

    fn sample_alert() -> Alert {
        Alert {
            alert_id: Uuid::new_v4(),
            created_at: Utc::now(),
            principal_id: None,
            remote_address: Some("203.0.113.9".to_string()),
            route: "/auth/login".to_string(),
            method: "POST".to_string(),
            kind: AlertKind::SqlInjection,
            severity: Severity::High,
            risk_score: 82,
            signature: "SIG".to_string(),
            payload: "' or 1=1".to_string(),
            user_agent: None,
            status: AlertStatus::New,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_alerts() {
        let hub = AlertStreamHub::new(16);
        let mut rx = hub.subscribe();
        let alert = sample_alert();
        hub.publish(&alert);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.alert_id, alert.alert_id);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let hub = AlertStreamHub::new(16);
        hub.publish(&sample_alert());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
