use perimeter_shared::{PerimeterError, Principal, PrincipalRole, RegisterRequest, Result};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::services::auth_service::AuthService;

const PRINCIPAL_COLUMNS: &str =
    "principal_id, email, display_name, role, is_active, created_at, updated_at";

/// Read side of the identity directory, plus the one mutation the pipeline
/// owns: flipping `is_active`.
pub struct UserService {
    pool: PgPool,
    auth_service: AuthService,
}

impl UserService {
    pub fn new(pool: PgPool, auth_service: AuthService) -> Self {
        Self { pool, auth_service }
    }

    pub async fn create_principal(&self, request: RegisterRequest) -> Result<Principal> {
        let email = normalize_email(&request.email);
        if email.is_empty() || !email.contains('@') {
            return Err(PerimeterError::InvalidInput("invalid email".to_string()));
        }
        if request.display_name.trim().is_empty() {
            return Err(PerimeterError::InvalidInput(
                "display name is required".to_string(),
            ));
        }
        if request.password.len() < 8 {
            return Err(PerimeterError::InvalidInput(
                "password too short".to_string(),
            ));
        }

        let password_hash = self.auth_service.hash_password(&request.password)?;

        sqlx::query_as::<_, Principal>(&format!(
            r#"
            INSERT INTO principals (email, display_name, role, password_hash)
            VALUES ($1, $2, 'user', $3)
            RETURNING {PRINCIPAL_COLUMNS}
            "#
        ))
        .bind(&email)
        .bind(request.display_name.trim())
        .bind(&password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.constraint().is_some() => {
                PerimeterError::Conflict("email already registered".to_string())
            }
            _ => PerimeterError::DatabaseError(e.to_string()),
        })
    }

    /// Lookup without an `is_active` filter: enforcement needs to see
    /// suspended principals too.
    pub async fn find_by_id(&self, principal_id: Uuid) -> Result<Option<Principal>> {
        sqlx::query_as::<_, Principal>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM principals WHERE principal_id = $1"
        ))
        .bind(principal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<Principal>> {
        sqlx::query_as::<_, Principal>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM principals WHERE email = $1"
        ))
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))
    }

    /// Password check against the stored hash. Returns the principal even
    /// when suspended; the caller decides between 401 and 403.
    pub async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Principal>> {
        let row = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT principal_id, password_hash FROM principals WHERE email = $1",
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        let Some((principal_id, password_hash)) = row else {
            return Ok(None);
        };

        if !self.auth_service.verify_password(password, &password_hash)? {
            return Ok(None);
        }

        self.find_by_id(principal_id).await
    }

    pub async fn set_active(&self, principal_id: Uuid, is_active: bool) -> Result<()> {
        sqlx::query(
            "UPDATE principals SET is_active = $2, updated_at = now() WHERE principal_id = $1",
        )
        .bind(principal_id)
        .bind(is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    pub async fn list_principals(
        &self,
        q: Option<&str>,
        role: Option<PrincipalRole>,
        active: Option<bool>,
        skip: i64,
        limit: i64,
    ) -> Result<(Vec<Principal>, i64)> {
        let limit = limit.clamp(1, 200);
        let skip = skip.max(0);

        let push_conditions = |qb: &mut QueryBuilder<'_, Postgres>| {
            if let Some(q) = q {
                let pattern = format!("%{}%", q.trim().to_lowercase());
                qb.push(" AND (email LIKE ");
                qb.push_bind(pattern.clone());
                qb.push(" OR lower(display_name) LIKE ");
                qb.push_bind(pattern);
                qb.push(")");
            }
            if let Some(role) = role {
                qb.push(" AND role = ");
                qb.push_bind(role);
            }
            if let Some(active) = active {
                qb.push(" AND is_active = ");
                qb.push_bind(active);
            }
        };

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM principals WHERE 1=1"
        ));
        push_conditions(&mut qb);
        qb.push(" ORDER BY created_at DESC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(skip);

        let principals: Vec<Principal> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM principals WHERE 1=1");
        push_conditions(&mut count_qb);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PerimeterError::DatabaseError(e.to_string()))?;

        Ok((principals, total))
    }
}

/// Email normalization used for storage and every lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
