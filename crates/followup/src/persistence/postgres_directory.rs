//! PostgreSQL-backed directory

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{error, instrument};
use uuid::Uuid;

use crate::notify::{Directory, DirectoryError, MessageTemplate, Recipient};

/// Reads recipients, staff roles and templates from the followup tables
#[derive(Clone)]
pub struct PostgresDirectory {
    pool: PgPool,
}

impl PostgresDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: sqlx::Error) -> DirectoryError {
    error!("Directory query failed: {}", e);
    DirectoryError::Unavailable(e.to_string())
}

#[async_trait]
impl Directory for PostgresDirectory {
    #[instrument(skip(self))]
    async fn recipient(
        &self,
        tenant_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Option<Recipient>, DirectoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, first_name, last_name, email, phone, user_id
            FROM followup_recipients
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|row| Recipient {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            email: row.get("email"),
            phone: row.get("phone"),
            user_id: row.get("user_id"),
        }))
    }

    #[instrument(skip(self))]
    async fn staff_address_for_role(
        &self,
        tenant_id: Uuid,
        role: &str,
    ) -> Result<Option<String>, DirectoryError> {
        sqlx::query_scalar(
            r#"
            SELECT address FROM followup_staff
            WHERE tenant_id = $1 AND role = $2
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(role)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)
    }

    #[instrument(skip(self))]
    async fn template(
        &self,
        tenant_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<MessageTemplate>, DirectoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, name, subject, body
            FROM followup_templates
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|row| MessageTemplate {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            name: row.get("name"),
            subject: row.get("subject"),
            body: row.get("body"),
        }))
    }
}
