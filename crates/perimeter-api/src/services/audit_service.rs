use perimeter_shared::{AdminAction, AdminActionKind, PerimeterError, Result};
use sqlx::PgPool;
use uuid::Uuid;

/// Append-only audit log. Every state-changing admin call and every
/// automatic penalty transition lands here.
pub struct AuditService {
    pool: PgPool,
}

impl AuditService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        actor_principal_id: Option<Uuid>,
        kind: AdminActionKind,
        target: &str,
        note: Option<&str>,
    ) -> Result<AdminAction> {
        sqlx::query_as::<_, AdminAction>(
            r#"
            INSERT INTO admin_actions (actor_principal_id, kind, target, note)
            VALUES ($1, $2, $3, $4)
            RETURNING action_id, actor_principal_id, kind, target, note, created_at
            "#,
        )
        .bind(actor_principal_id)
        .bind(kind)
        .bind(target)
        .bind(note)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    pub async fn for_target(&self, target: &str, limit: i64) -> Result<Vec<AdminAction>> {
        sqlx::query_as::<_, AdminAction>(
            r#"
            SELECT action_id, actor_principal_id, kind, target, note, created_at
            FROM admin_actions
            WHERE target = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(target)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }
}
