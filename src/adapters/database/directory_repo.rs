use crate::adapters::database::DbPool;
use crate::adapters::repository::Directory;
use crate::error::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Reads the profile and membership tables maintained by the account and group services.
#[derive(Clone, Debug)]
pub struct PgDirectory {
    pool: DbPool,
}

impl PgDirectory {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn is_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2)",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Uuid>> {
        let members = sqlx::query_scalar::<_, Uuid>("SELECT user_id FROM group_members WHERE group_id = $1")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(members)
    }

    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn groups_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let groups = sqlx::query_scalar::<_, Uuid>("SELECT group_id FROM group_members WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(groups)
    }

    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn preferred_language(&self, user_id: Uuid) -> Result<Option<String>> {
        let language = sqlx::query_scalar::<_, Option<String>>(
            "SELECT preferred_language FROM user_profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(language.flatten())
    }
}
