use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use stockflow_core::identity::User;
use stockflow_core::paging::{Page, PageRequest};

use crate::{is_foreign_key_violation, is_unique_violation, like_pattern, opt_rfc3339, to_rfc3339};

const USER_COLUMNS: &str = "id, first_name, last_name, email, phone_number, timezone, role, \
     password_hash, is_active, email_verified_at, created_at, updated_at";

/// Repository for user accounts.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

/// Data required to create an account. The email must already be normalised.
pub struct NewUser<'a> {
    pub id: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub email: &'a str,
    pub phone_number: Option<&'a str>,
    pub timezone: &'a str,
    pub role: &'a str,
    pub password_hash: &'a str,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub struct ProfileUpdate<'a> {
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub phone_number: Option<&'a str>,
    pub timezone: &'a str,
}

/// User plus the stored credential hash, which never leaves the server.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user: User,
    pub password_hash: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    first_name: String,
    last_name: String,
    email: String,
    phone_number: Option<String>,
    timezone: String,
    role: String,
    password_hash: String,
    is_active: bool,
    email_verified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn into_record(self) -> UserRecord {
        UserRecord {
            password_hash: self.password_hash,
            user: User {
                id: self.id,
                first_name: self.first_name,
                last_name: self.last_name,
                email: self.email,
                phone_number: self.phone_number,
                timezone: self.timezone,
                role: self.role,
                is_active: self.is_active,
                email_verified_at: self.email_verified_at,
                created_at: self.created_at,
                updated_at: self.updated_at,
            },
        }
    }
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &NewUser<'_>) -> Result<User, UserError> {
        let created_at = to_rfc3339(record.created_at);
        let result = sqlx::query(
            "INSERT INTO users \
             (id, first_name, last_name, email, phone_number, timezone, role, password_hash, is_active, email_verified_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(record.first_name)
        .bind(record.last_name)
        .bind(record.email)
        .bind(record.phone_number)
        .bind(record.timezone)
        .bind(record.role)
        .bind(record.password_hash)
        .bind(opt_rfc3339(record.email_verified_at))
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => return Err(UserError::EmailTaken),
            Err(err) if is_foreign_key_violation(&err) => {
                return Err(UserError::UnknownRole(record.role.to_string()))
            }
            Err(err) => return Err(UserError::Database(err)),
        }

        self.find_by_id(record.id)
            .await?
            .map(|r| r.user)
            .ok_or(UserError::NotFound)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>, UserError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRow::into_record))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, UserError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ?"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRow::into_record))
    }

    /// Lists users ordered by name, optionally filtered by a name/email search.
    pub async fn page(
        &self,
        search: Option<&str>,
        request: PageRequest,
    ) -> Result<Page<User>, UserError> {
        let pattern = search
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(like_pattern);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM users");
        push_search(&mut count, pattern.as_deref());
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {USER_COLUMNS} FROM users"));
        push_search(&mut select, pattern.as_deref());
        select
            .push(" ORDER BY last_name COLLATE NOCASE, first_name COLLATE NOCASE, id LIMIT ")
            .push_bind(request.limit())
            .push(" OFFSET ")
            .push_bind(request.offset());
        let rows: Vec<UserRow> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page::new(
            rows.into_iter().map(|row| row.into_record().user).collect(),
            total,
            request,
        ))
    }

    pub async fn set_role(&self, id: &str, role: &str, now: DateTime<Utc>) -> Result<(), UserError> {
        let result = sqlx::query("UPDATE users SET role = ?, updated_at = ? WHERE id = ?")
            .bind(role)
            .bind(to_rfc3339(now))
            .bind(id)
            .execute(&self.pool)
            .await;
        match result {
            Ok(done) if done.rows_affected() == 0 => Err(UserError::NotFound),
            Ok(_) => Ok(()),
            Err(err) if is_foreign_key_violation(&err) => Err(UserError::UnknownRole(role.into())),
            Err(err) => Err(UserError::Database(err)),
        }
    }

    pub async fn set_active(
        &self,
        id: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<(), UserError> {
        let done = sqlx::query("UPDATE users SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(to_rfc3339(now))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }

    /// Marks the address verified. Returns `false` when no account uses it.
    pub async fn mark_email_verified(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, UserError> {
        let stamp = to_rfc3339(now);
        let done = sqlx::query(
            "UPDATE users SET email_verified_at = COALESCE(email_verified_at, ?), updated_at = ? \
             WHERE email = ?",
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn update_password_hash(
        &self,
        id: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), UserError> {
        let done = sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(password_hash)
            .bind(to_rfc3339(now))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }

    pub async fn update_profile(
        &self,
        id: &str,
        update: &ProfileUpdate<'_>,
        now: DateTime<Utc>,
    ) -> Result<User, UserError> {
        let done = sqlx::query(
            "UPDATE users SET first_name = ?, last_name = ?, phone_number = ?, timezone = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(update.first_name)
        .bind(update.last_name)
        .bind(update.phone_number)
        .bind(update.timezone)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(UserError::NotFound);
        }
        self.find_by_id(id)
            .await?
            .map(|r| r.user)
            .ok_or(UserError::NotFound)
    }

    /// Active users whose active role grants `permission`.
    pub async fn list_with_permission(&self, permission: &str) -> Result<Vec<User>, UserError> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT u.id, u.first_name, u.last_name, u.email, u.phone_number, u.timezone, u.role, \
                    u.password_hash, u.is_active, u.email_verified_at, u.created_at, u.updated_at \
               FROM users AS u \
               JOIN roles AS r ON r.name = u.role AND r.is_active = 1 \
               JOIN role_permissions AS rp ON rp.role_name = r.name \
              WHERE u.is_active = 1 AND rp.permission = ? \
              ORDER BY u.id",
        )
        .bind(permission)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.into_record().user).collect())
    }

    pub async fn list_active_by_role(&self, role: &str) -> Result<Vec<User>, UserError> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE role = ? AND is_active = 1 ORDER BY id"
        ))
        .bind(role)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.into_record().user).collect())
    }

    pub async fn count_by_role(&self, role: &str) -> Result<i64, UserError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = ?")
            .bind(role)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn push_search(builder: &mut QueryBuilder<'_, Sqlite>, pattern: Option<&str>) {
    if let Some(pattern) = pattern {
        builder
            .push(" WHERE (first_name LIKE ")
            .push_bind(pattern.to_string())
            .push(" ESCAPE '\\' OR last_name LIKE ")
            .push_bind(pattern.to_string())
            .push(" ESCAPE '\\' OR email LIKE ")
            .push_bind(pattern.to_string())
            .push(" ESCAPE '\\')");
    }
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("email address is already registered")]
    EmailTaken,
    #[error("user not found")]
    NotFound,
    #[error("role {0} does not exist")]
    UnknownRole(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_support;
    use crate::Database;

    pub(crate) async fn create_user(db: &Database, id: &str, email: &str, role: &str) -> User {
        db.users()
            .insert(&NewUser {
                id,
                first_name: "Test",
                last_name: id,
                email,
                phone_number: None,
                timezone: "UTC",
                role,
                password_hash: "hash",
                email_verified_at: None,
                created_at: Utc::now(),
            })
            .await
            .expect("insert user")
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_email() {
        let (db, _dir) = test_support::database().await;
        create_user(&db, "u-1", "a@example.com", "user").await;

        let err = db
            .users()
            .insert(&NewUser {
                id: "u-2",
                first_name: "B",
                last_name: "B",
                email: "a@example.com",
                phone_number: None,
                timezone: "UTC",
                role: "user",
                password_hash: "hash",
                email_verified_at: None,
                created_at: Utc::now(),
            })
            .await
            .expect_err("duplicate");
        assert!(matches!(err, UserError::EmailTaken));
    }

    #[tokio::test]
    async fn insert_rejects_unknown_role() {
        let (db, _dir) = test_support::database().await;
        let err = db
            .users()
            .insert(&NewUser {
                id: "u-1",
                first_name: "A",
                last_name: "A",
                email: "a@example.com",
                phone_number: None,
                timezone: "UTC",
                role: "overlord",
                password_hash: "hash",
                email_verified_at: None,
                created_at: Utc::now(),
            })
            .await
            .expect_err("unknown role");
        assert!(matches!(err, UserError::UnknownRole(role) if role == "overlord"));
    }

    #[tokio::test]
    async fn page_searches_names_and_email() {
        let (db, _dir) = test_support::database().await;
        for idx in 0..12 {
            create_user(&db, &format!("u-{idx:02}"), &format!("user{idx}@example.com"), "user")
                .await;
        }
        create_user(&db, "u-special", "ops_lead@corp.io", "manager").await;

        let page = db
            .users()
            .page(None, PageRequest::new(Some(2), Some(5)))
            .await
            .expect("page");
        assert_eq!(page.total_count, 13);
        assert_eq!(page.items.len(), 5);
        assert!(page.has_next);

        let found = db
            .users()
            .page(Some("ops_"), PageRequest::default())
            .await
            .expect("search");
        assert_eq!(found.total_count, 1);
        assert_eq!(found.items[0].email, "ops_lead@corp.io");
    }

    #[tokio::test]
    async fn verification_and_role_updates() {
        let (db, _dir) = test_support::database().await;
        create_user(&db, "u-1", "a@example.com", "user").await;
        let repo = db.users();

        assert!(repo
            .mark_email_verified("a@example.com", Utc::now())
            .await
            .expect("verify"));
        assert!(!repo
            .mark_email_verified("missing@example.com", Utc::now())
            .await
            .expect("verify"));

        repo.set_role("u-1", "manager", Utc::now())
            .await
            .expect("set role");
        let record = repo.find_by_id("u-1").await.expect("load").expect("exists");
        assert_eq!(record.user.role, "manager");
        assert!(record.user.is_email_verified());

        let err = repo
            .set_role("u-1", "ghost", Utc::now())
            .await
            .expect_err("fk");
        assert!(matches!(err, UserError::UnknownRole(_)));
        assert!(matches!(
            repo.set_active("missing", false, Utc::now()).await,
            Err(UserError::NotFound)
        ));
    }

    #[tokio::test]
    async fn permission_lookup_uses_role_mapping() {
        let (db, _dir) = test_support::database().await;
        create_user(&db, "u-user", "user@example.com", "user").await;
        create_user(&db, "u-manager", "manager@example.com", "manager").await;
        create_user(&db, "u-admin", "admin@example.com", "admin").await;
        db.users()
            .set_active("u-admin", false, Utc::now())
            .await
            .expect("deactivate");

        let recipients = db
            .users()
            .list_with_permission("product.update_stock")
            .await
            .expect("lookup");
        let ids: Vec<_> = recipients.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u-manager"]);
    }
}
