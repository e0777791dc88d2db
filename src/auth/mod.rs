//! OAuth2-password flow with refresh-token rotation and revocation.

pub mod store;

use crate::config::Config;
use crate::error::{Result, TableRagError};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Argon2, password_hash::rand_core::OsRng};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use store::AuthStore;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Space-joined scope names.
    pub scope: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl Claims {
    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(str::to_string).collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

pub struct AuthService {
    store: Arc<dyn AuthStore>,
    secret: String,
    algorithm: Algorithm,
    access_ttl: Duration,
    refresh_ttl: Duration,
    offset: FixedOffset,
    /// Fixed hash compared against for unknown users, so login timing does
    /// not reveal whether a username exists.
    dummy_hash: String,
}

impl AuthService {
    pub fn new(store: Arc<dyn AuthStore>, config: &Config) -> Result<Self> {
        let algorithm = match config.auth.algorithm.as_str() {
            "HS384" => Algorithm::HS384,
            _ => Algorithm::HS256,
        };
        let offset = FixedOffset::east_opt(config.auth.utc_offset_hours * 3600).ok_or_else(
            || TableRagError::Config {
                message: format!("invalid utc_offset_hours {}", config.auth.utc_offset_hours),
            },
        )?;
        let salt = SaltString::generate(&mut OsRng);
        let dummy_hash = Argon2::default()
            .hash_password(b"dummy_password", &salt)
            .map_err(|e| TableRagError::Internal {
                message: format!("dummy hash failed: {}", e),
            })?
            .to_string();
        Ok(Self {
            store,
            secret: config.runtime.secret_key.clone(),
            algorithm,
            access_ttl: Duration::minutes(config.auth.access_ttl_minutes),
            refresh_ttl: Duration::days(config.auth.refresh_ttl_days),
            offset,
            dummy_hash,
        })
    }

    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    fn encode(&self, claims: &Claims) -> Result<String> {
        jsonwebtoken::encode(
            &Header::new(self.algorithm),
            claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| TableRagError::Internal {
            message: format!("token encode failed: {}", e),
        })
    }

    fn decode(&self, token: &str, challenge: &str) -> Result<Claims> {
        let validation = Validation::new(self.algorithm);
        jsonwebtoken::decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|_| TableRagError::Unauthorized {
            message: "Could not validate credentials".into(),
            challenge: challenge.to_string(),
        })
    }

    fn create_access_token(&self, username: &str, scopes: &[String]) -> Result<String> {
        let exp = self.now() + self.access_ttl;
        self.encode(&Claims {
            sub: username.to_string(),
            scope: scopes.join(" "),
            exp: exp.timestamp(),
            jti: None,
        })
    }

    async fn create_refresh_token(&self, username: &str, scopes: &[String]) -> Result<String> {
        let jti = Uuid::new_v4().to_string();
        let expires = self.now() + self.refresh_ttl;
        let token = self.encode(&Claims {
            sub: username.to_string(),
            scope: scopes.join(" "),
            exp: expires.timestamp(),
            jti: Some(jti.clone()),
        })?;
        self.store
            .insert_refresh_token(&jti, username, expires.naive_local())
            .await?;
        Ok(token)
    }

    async fn authenticate_user(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<store::UserRecord> {
        let user = self.store.fetch_user(username).await?;
        let target_hash = user
            .as_ref()
            .map(|u| u.hashed_password.clone())
            .unwrap_or_else(|| self.dummy_hash.clone());
        let parsed = PasswordHash::new(&target_hash).map_err(|e| TableRagError::Internal {
            message: format!("stored password hash invalid: {}", e),
        })?;
        let password_correct = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();
        let Some(user) = user.filter(|_| password_correct) else {
            tracing::info!(target: "auth", "{} | {}: validation user failed", client_ip, username);
            return Err(TableRagError::unauthorized("Incorrect username or password"));
        };
        if !user.active {
            return Err(TableRagError::forbidden("Inactive user"));
        }
        Ok(user)
    }

    /// Password login: returns a fresh access/refresh pair.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<TokenPair> {
        let user = self.authenticate_user(username, password, client_ip).await?;
        let refresh_token = self.create_refresh_token(username, &user.scopes).await?;
        let access_token = self.create_access_token(username, &user.scopes)?;
        tracing::info!(target: "auth", "{} | {}: create tokens success", client_ip, username);
        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
        })
    }

    /// Exchange a refresh token for a new access token, rotating the
    /// refresh token: the old record is revoked, a new one inserted.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        scopes: Vec<String>,
        client_ip: &str,
    ) -> Result<TokenPair> {
        let claims = self.decode(refresh_token, "Bearer")?;
        let username = claims.sub.clone();
        let jti = claims
            .jti
            .clone()
            .filter(|j| !j.is_empty())
            .ok_or_else(|| TableRagError::unauthorized("Could not validate credentials"))?;
        if username.is_empty() {
            return Err(TableRagError::unauthorized("Could not validate credentials"));
        }

        let record = self
            .store
            .fetch_refresh_token(&jti, &username)
            .await?
            .ok_or_else(|| TableRagError::unauthorized("Invalid refresh token"))?;
        if !record.active {
            return Err(TableRagError::unauthorized(
                "Refresh token has been revoked",
            ));
        }
        if record.expires_at < self.now().naive_local() {
            return Err(TableRagError::unauthorized("Refresh token has expired"));
        }

        let token_scopes = claims.scopes();
        // No requested scopes means everything the refresh token carries
        let scopes = if scopes.is_empty() {
            token_scopes.clone()
        } else {
            scopes
        };
        let exceed: Vec<&String> = scopes
            .iter()
            .filter(|s| !token_scopes.contains(s))
            .collect();
        if !exceed.is_empty() {
            tracing::info!(
                target: "auth",
                "{} | {} | {:?}: validation scope failed", client_ip, username, scopes
            );
            return Err(TableRagError::forbidden(format!(
                "Requested scopes {:?} exceed user's permissions",
                exceed
            )));
        }

        let access_token = self.create_access_token(&username, &scopes)?;
        self.store.revoke_refresh_token(&jti, &username).await?;
        let new_refresh_token = self.create_refresh_token(&username, &token_scopes).await?;
        tracing::info!(
            target: "auth",
            "{} | {} | {:?}: refresh token success with rotation", client_ip, username, scopes
        );
        Ok(TokenPair {
            access_token,
            refresh_token: new_refresh_token,
            token_type: "bearer".to_string(),
        })
    }

    /// Revoke a refresh token; subsequent refresh attempts fail with 401.
    pub async fn logout(&self, refresh_token: &str, client_ip: &str) -> Result<String> {
        let claims = self.decode(refresh_token, "Bearer").map_err(|_| {
            TableRagError::unauthorized("Invalid refresh token")
        })?;
        let username = claims.sub.clone();
        let jti = claims
            .jti
            .filter(|j| !j.is_empty())
            .ok_or_else(|| TableRagError::unauthorized("Invalid refresh token"))?;
        if username.is_empty() {
            return Err(TableRagError::unauthorized("Invalid refresh token"));
        }
        let revoked = self.store.revoke_refresh_token(&jti, &username).await?;
        if !revoked {
            return Err(TableRagError::unauthorized("Invalid refresh token"));
        }
        tracing::info!(target: "auth", "{} | {}: revoke refresh token success", client_ip, username);
        Ok("Logged out successfully".to_string())
    }

    /// Access-token check for an endpoint requiring `required_scopes`.
    pub fn authorize(&self, access_token: &str, required_scopes: &[&str]) -> Result<Claims> {
        let challenge = if required_scopes.is_empty() {
            "Bearer".to_string()
        } else {
            format!("Bearer scope=\"{}\"", required_scopes.join(" "))
        };
        let claims = self.decode(access_token, &challenge)?;
        if claims.sub.is_empty() {
            return Err(TableRagError::Unauthorized {
                message: "Could not validate credentials".into(),
                challenge,
            });
        }
        let token_scopes = claims.scopes();
        let missing = required_scopes
            .iter()
            .any(|s| !token_scopes.iter().any(|t| t == s));
        if missing {
            return Err(TableRagError::Forbidden {
                message: "Not enough permissions".into(),
                challenge,
            });
        }
        Ok(claims)
    }
}

/// Hash a password for seeding the user table.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| TableRagError::Internal {
            message: format!("password hash failed: {}", e),
        })
}
