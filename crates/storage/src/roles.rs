use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use stockflow_core::roles::RoleDefinition;

use crate::{is_unique_violation, to_rfc3339};

/// Repository for role definitions and their permission grants.
#[derive(Clone)]
pub struct RoleRepository {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct RoleRow {
    name: String,
    display_name: String,
    description: Option<String>,
    is_system: bool,
    is_active: bool,
    priority: i64,
}

impl RoleRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Seeds the built-in roles. Existing rows and their grants are left alone so
    /// administrators can edit system role permissions.
    pub async fn ensure_system_roles(
        &self,
        roles: &[RoleDefinition],
        now: DateTime<Utc>,
    ) -> Result<u64, RoleRepoError> {
        let stamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        let mut created = 0;
        for role in roles {
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO roles \
                 (name, display_name, description, is_system, is_active, priority, created_at, updated_at) \
                 VALUES (?, ?, ?, 1, 1, ?, ?, ?)",
            )
            .bind(&role.name)
            .bind(&role.display_name)
            .bind(&role.description)
            .bind(role.priority)
            .bind(&stamp)
            .bind(&stamp)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                continue;
            }
            created += 1;
            for permission in &role.permissions {
                sqlx::query("INSERT INTO role_permissions (role_name, permission) VALUES (?, ?)")
                    .bind(&role.name)
                    .bind(permission)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(created)
    }

    /// All roles ordered by descending priority.
    pub async fn list(&self) -> Result<Vec<RoleDefinition>, RoleRepoError> {
        let rows = sqlx::query_as::<_, RoleRow>(
            "SELECT name, display_name, description, is_system, is_active, priority \
             FROM roles ORDER BY priority DESC, name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut roles = Vec::with_capacity(rows.len());
        for row in rows {
            let permissions = self.grants(&row.name).await?;
            roles.push(into_definition(row, permissions));
        }
        Ok(roles)
    }

    pub async fn find(&self, name: &str) -> Result<Option<RoleDefinition>, RoleRepoError> {
        let row = sqlx::query_as::<_, RoleRow>(
            "SELECT name, display_name, description, is_system, is_active, priority \
             FROM roles WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let permissions = self.grants(&row.name).await?;
                Ok(Some(into_definition(row, permissions)))
            }
            None => Ok(None),
        }
    }

    pub async fn create(
        &self,
        role: &RoleDefinition,
        now: DateTime<Utc>,
    ) -> Result<(), RoleRepoError> {
        let stamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO roles \
             (name, display_name, description, is_system, is_active, priority, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&role.name)
        .bind(&role.display_name)
        .bind(&role.description)
        .bind(role.is_system)
        .bind(role.is_active)
        .bind(role.priority)
        .bind(&stamp)
        .bind(&stamp)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(RoleRepoError::Duplicate(role.name.clone()))
            }
            Err(err) => return Err(RoleRepoError::Database(err)),
        }

        for permission in &role.permissions {
            sqlx::query("INSERT INTO role_permissions (role_name, permission) VALUES (?, ?)")
                .bind(&role.name)
                .bind(permission)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Replaces the full grant list of a role atomically.
    pub async fn replace_permissions(
        &self,
        name: &str,
        permissions: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), RoleRepoError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE roles SET updated_at = ? WHERE name = ?")
            .bind(to_rfc3339(now))
            .bind(name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(RoleRepoError::NotFound);
        }

        sqlx::query("DELETE FROM role_permissions WHERE role_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        for permission in permissions {
            sqlx::query("INSERT INTO role_permissions (role_name, permission) VALUES (?, ?)")
                .bind(name)
                .bind(permission)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_active(
        &self,
        name: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RoleRepoError> {
        let updated = sqlx::query("UPDATE roles SET is_active = ?, updated_at = ? WHERE name = ?")
            .bind(active)
            .bind(to_rfc3339(now))
            .bind(name)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(RoleRepoError::NotFound);
        }
        Ok(())
    }

    /// Deletes a custom role that no user is assigned to.
    pub async fn delete(&self, name: &str) -> Result<(), RoleRepoError> {
        let mut tx = self.pool.begin().await?;
        let is_system: Option<bool> = sqlx::query_scalar("SELECT is_system FROM roles WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        match is_system {
            None => return Err(RoleRepoError::NotFound),
            Some(true) => return Err(RoleRepoError::SystemRole),
            Some(false) => {}
        }

        let assigned: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
        if assigned > 0 {
            return Err(RoleRepoError::InUse(assigned));
        }

        sqlx::query("DELETE FROM roles WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Grants of an active role. An inactive or unknown role grants nothing.
    pub async fn permissions_for(&self, name: &str) -> Result<Vec<String>, RoleRepoError> {
        let rows = sqlx::query_scalar(
            "SELECT rp.permission FROM role_permissions AS rp \
             JOIN roles AS r ON r.name = rp.role_name \
             WHERE r.name = ? AND r.is_active = 1 \
             ORDER BY rp.permission",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn grants(&self, name: &str) -> Result<Vec<String>, RoleRepoError> {
        let rows = sqlx::query_scalar(
            "SELECT permission FROM role_permissions WHERE role_name = ? ORDER BY permission",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn into_definition(row: RoleRow, permissions: Vec<String>) -> RoleDefinition {
    RoleDefinition {
        name: row.name,
        display_name: row.display_name,
        description: row.description,
        permissions,
        is_system: row.is_system,
        is_active: row.is_active,
        priority: row.priority,
    }
}

#[derive(Debug, Error)]
pub enum RoleRepoError {
    #[error("role not found")]
    NotFound,
    #[error("role {0} already exists")]
    Duplicate(String),
    #[error("system roles cannot be deleted")]
    SystemRole,
    #[error("role is assigned to {0} user(s)")]
    InUse(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use crate::users::tests::create_user;

    fn auditor() -> RoleDefinition {
        RoleDefinition::custom(
            "auditor",
            "Auditor",
            Some("Read-only inventory access".into()),
            vec!["product.view".into(), "product.view_reports".into()],
            20,
        )
        .expect("valid role")
    }

    #[tokio::test]
    async fn seeding_is_idempotent_and_preserves_edits() {
        let (db, _dir) = test_support::database().await;
        let repo = db.roles();

        repo.replace_permissions("user", &["product.view".into()], Utc::now())
            .await
            .expect("edit grants");
        let created = repo
            .ensure_system_roles(&RoleDefinition::system_defaults(), Utc::now())
            .await
            .expect("reseed");
        assert_eq!(created, 0);
        assert_eq!(
            repo.permissions_for("user").await.expect("grants"),
            vec!["product.view".to_string()]
        );

        let names: Vec<_> = repo
            .list()
            .await
            .expect("list")
            .into_iter()
            .map(|role| role.name)
            .collect();
        assert_eq!(names, vec!["admin", "manager", "user"]);
    }

    #[tokio::test]
    async fn custom_role_lifecycle() {
        let (db, _dir) = test_support::database().await;
        let repo = db.roles();
        repo.create(&auditor(), Utc::now()).await.expect("create");

        let err = repo.create(&auditor(), Utc::now()).await.expect_err("dup");
        assert!(matches!(err, RoleRepoError::Duplicate(_)));

        let stored = repo.find("auditor").await.expect("find").expect("exists");
        assert_eq!(stored.permissions.len(), 2);
        assert!(!stored.is_system);

        repo.set_active("auditor", false, Utc::now())
            .await
            .expect("deactivate");
        assert!(repo.permissions_for("auditor").await.expect("grants").is_empty());

        create_user(&db, "u-1", "a@example.com", "auditor").await;
        assert!(matches!(
            repo.delete("auditor").await,
            Err(RoleRepoError::InUse(1))
        ));
        assert!(matches!(
            repo.delete("admin").await,
            Err(RoleRepoError::SystemRole)
        ));
        assert!(matches!(
            repo.delete("missing").await,
            Err(RoleRepoError::NotFound)
        ));
    }
}
