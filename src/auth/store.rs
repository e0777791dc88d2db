//! Persistence for users, scopes, and refresh tokens.
//!
//! The SQL implementation targets the auth database (MySQL or PostgreSQL,
//! schema: `user`, `scope`, `group_scope_rel`, `refresh_token` with
//! `yn SMALLINT` flags and naive local timestamps). The in-memory
//! implementation backs tests.

use crate::error::Result;
use crate::ingest::source::SourcePool;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::Row;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub name: String,
    pub hashed_password: String,
    pub active: bool,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RefreshRecord {
    pub active: bool,
    pub expires_at: NaiveDateTime,
}

#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn fetch_user(&self, username: &str) -> Result<Option<UserRecord>>;
    /// scope name -> description, enumerated at startup.
    async fn all_scopes(&self) -> Result<HashMap<String, String>>;
    async fn insert_refresh_token(
        &self,
        jti: &str,
        username: &str,
        expires_at: NaiveDateTime,
    ) -> Result<()>;
    /// Marks yn = 0; true when a row was updated.
    async fn revoke_refresh_token(&self, jti: &str, username: &str) -> Result<bool>;
    async fn fetch_refresh_token(&self, jti: &str, username: &str)
    -> Result<Option<RefreshRecord>>;
}

pub struct SqlAuthStore {
    pool: SourcePool,
}

impl SqlAuthStore {
    pub fn new(pool: SourcePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthStore for SqlAuthStore {
    async fn fetch_user(&self, username: &str) -> Result<Option<UserRecord>> {
        match &self.pool {
            SourcePool::MySql(pool) => {
                let row = sqlx::query(
                    "SELECT name, hashed_password, yn, group_name FROM user WHERE name = ?",
                )
                .bind(username)
                .fetch_optional(pool)
                .await?;
                let Some(row) = row else { return Ok(None) };
                let group_name: String = row.try_get("group_name")?;
                let scope_rows = sqlx::query(
                    "SELECT scope.name FROM group_scope_rel \
                     JOIN scope ON group_scope_rel.scope_name = scope.name \
                     WHERE group_scope_rel.group_name = ?",
                )
                .bind(&group_name)
                .fetch_all(pool)
                .await?;
                let scopes = scope_rows
                    .iter()
                    .map(|r| r.try_get::<String, _>("name"))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Some(UserRecord {
                    name: row.try_get("name")?,
                    hashed_password: row.try_get("hashed_password")?,
                    active: row.try_get::<i8, _>("yn")? != 0,
                    scopes,
                }))
            }
            SourcePool::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT name, hashed_password, yn, group_name FROM \"user\" WHERE name = $1",
                )
                .bind(username)
                .fetch_optional(pool)
                .await?;
                let Some(row) = row else { return Ok(None) };
                let group_name: String = row.try_get("group_name")?;
                let scope_rows = sqlx::query(
                    "SELECT scope.name FROM group_scope_rel \
                     JOIN scope ON group_scope_rel.scope_name = scope.name \
                     WHERE group_scope_rel.group_name = $1",
                )
                .bind(&group_name)
                .fetch_all(pool)
                .await?;
                let scopes = scope_rows
                    .iter()
                    .map(|r| r.try_get::<String, _>("name"))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Some(UserRecord {
                    name: row.try_get("name")?,
                    hashed_password: row.try_get("hashed_password")?,
                    active: row.try_get::<i16, _>("yn")? != 0,
                    scopes,
                }))
            }
        }
    }

    async fn all_scopes(&self) -> Result<HashMap<String, String>> {
        let rows = match &self.pool {
            SourcePool::MySql(pool) => {
                sqlx::query("SELECT name, description FROM scope")
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(|r| {
                        Ok((
                            r.try_get::<String, _>("name")?,
                            r.try_get::<String, _>("description")?,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            SourcePool::Postgres(pool) => {
                sqlx::query("SELECT name, description FROM scope")
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(|r| {
                        Ok((
                            r.try_get::<String, _>("name")?,
                            r.try_get::<String, _>("description")?,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };
        Ok(rows.into_iter().collect())
    }

    async fn insert_refresh_token(
        &self,
        jti: &str,
        username: &str,
        expires_at: NaiveDateTime,
    ) -> Result<()> {
        match &self.pool {
            SourcePool::MySql(pool) => {
                sqlx::query(
                    "INSERT INTO refresh_token (jti, username, expires_at) VALUES (?, ?, ?)",
                )
                .bind(jti)
                .bind(username)
                .bind(expires_at)
                .execute(pool)
                .await?;
            }
            SourcePool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO refresh_token (jti, username, expires_at) VALUES ($1, $2, $3)",
                )
                .bind(jti)
                .bind(username)
                .bind(expires_at)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn revoke_refresh_token(&self, jti: &str, username: &str) -> Result<bool> {
        let affected = match &self.pool {
            SourcePool::MySql(pool) => {
                sqlx::query("UPDATE refresh_token SET yn = 0 WHERE jti = ? AND username = ?")
                    .bind(jti)
                    .bind(username)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
            SourcePool::Postgres(pool) => {
                sqlx::query("UPDATE refresh_token SET yn = 0 WHERE jti = $1 AND username = $2")
                    .bind(jti)
                    .bind(username)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
        };
        Ok(affected > 0)
    }

    async fn fetch_refresh_token(
        &self,
        jti: &str,
        username: &str,
    ) -> Result<Option<RefreshRecord>> {
        match &self.pool {
            SourcePool::MySql(pool) => {
                let row = sqlx::query(
                    "SELECT yn, expires_at FROM refresh_token WHERE jti = ? AND username = ?",
                )
                .bind(jti)
                .bind(username)
                .fetch_optional(pool)
                .await?;
                Ok(match row {
                    Some(row) => Some(RefreshRecord {
                        active: row.try_get::<i8, _>("yn")? != 0,
                        expires_at: row.try_get("expires_at")?,
                    }),
                    None => None,
                })
            }
            SourcePool::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT yn, expires_at FROM refresh_token WHERE jti = $1 AND username = $2",
                )
                .bind(jti)
                .bind(username)
                .fetch_optional(pool)
                .await?;
                Ok(match row {
                    Some(row) => Some(RefreshRecord {
                        active: row.try_get::<i16, _>("yn")? != 0,
                        expires_at: row.try_get("expires_at")?,
                    }),
                    None => None,
                })
            }
        }
    }
}

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct MemoryAuthStore {
    pub users: Mutex<HashMap<String, UserRecord>>,
    pub scopes: Mutex<HashMap<String, String>>,
    tokens: Mutex<HashMap<(String, String), RefreshRecord>>,
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn fetch_user(&self, username: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.lock().await.get(username).cloned())
    }

    async fn all_scopes(&self) -> Result<HashMap<String, String>> {
        Ok(self.scopes.lock().await.clone())
    }

    async fn insert_refresh_token(
        &self,
        jti: &str,
        username: &str,
        expires_at: NaiveDateTime,
    ) -> Result<()> {
        self.tokens.lock().await.insert(
            (jti.to_string(), username.to_string()),
            RefreshRecord {
                active: true,
                expires_at,
            },
        );
        Ok(())
    }

    async fn revoke_refresh_token(&self, jti: &str, username: &str) -> Result<bool> {
        let mut tokens = self.tokens.lock().await;
        match tokens.get_mut(&(jti.to_string(), username.to_string())) {
            Some(record) => {
                record.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fetch_refresh_token(
        &self,
        jti: &str,
        username: &str,
    ) -> Result<Option<RefreshRecord>> {
        Ok(self
            .tokens
            .lock()
            .await
            .get(&(jti.to_string(), username.to_string()))
            .cloned())
    }
}
