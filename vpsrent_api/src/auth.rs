//! Bearer-token authentication boundary.
//!
//! Tokens are HS256: two base64url JSON segments signed with HMAC-SHA256.
//! Access tokens live 15 minutes, refresh tokens 14 days and travel in an
//! HTTP-only cookie. Password digests are salted SHA-256, stored as
//! `<salt>$<digest>` hex.

use crate::error::{ServiceError, ServiceResult};
use crate::settings::AuthConfig;
use anyhow::anyhow;
use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;
use vpsrent_db::{User, UserRole, VpsRentDb};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: String,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::random();
    let digest = salted_digest(&salt, password);
    format!("{}${}", hex::encode(salt), hex::encode(digest))
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(digest_hex) else {
        return false;
    };
    salted_digest(&salt, password).as_slice() == expected.as_slice()
}

fn salted_digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Token issue/verify plus the thin account flows around it
pub struct AuthService {
    db: Arc<dyn VpsRentDb>,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(db: Arc<dyn VpsRentDb>, config: AuthConfig) -> Self {
        Self { db, config }
    }

    pub fn refresh_cookie_name(&self) -> &str {
        &self.config.refresh_cookie
    }

    pub fn refresh_ttl_days(&self) -> u64 {
        self.config.refresh_ttl_days
    }

    fn mint(&self, user: &User, kind: TokenKind, ttl: Duration) -> ServiceResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id,
            role: match user.role {
                UserRole::Admin => "admin".to_string(),
                UserRole::User => "user".to_string(),
            },
            kind,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        let header = BASE64_URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = BASE64_URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims).map_err(|e| ServiceError::Internal(anyhow!(e)))?,
        );
        let signing_input = format!("{}.{}", header, payload);
        let mut mac = HmacSha256::new_from_slice(self.config.secret_key.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(signing_input.as_bytes());
        let signature = BASE64_URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", signing_input, signature))
    }

    pub fn mint_access(&self, user: &User) -> ServiceResult<String> {
        self.mint(
            user,
            TokenKind::Access,
            Duration::minutes(self.config.access_ttl_minutes as i64),
        )
    }

    pub fn mint_refresh(&self, user: &User) -> ServiceResult<String> {
        self.mint(
            user,
            TokenKind::Refresh,
            Duration::days(self.config.refresh_ttl_days as i64),
        )
    }

    pub fn verify(&self, token: &str, kind: TokenKind) -> ServiceResult<Claims> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ServiceError::Unauthenticated("Malformed token".to_string()));
        };

        let signing_input = format!("{}.{}", header, payload);
        let mut mac = HmacSha256::new_from_slice(self.config.secret_key.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(signing_input.as_bytes());
        let sig = BASE64_URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| ServiceError::Unauthenticated("Malformed token".to_string()))?;
        mac.verify_slice(&sig)
            .map_err(|_| ServiceError::Unauthenticated("Invalid token signature".to_string()))?;

        let claims: Claims = BASE64_URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|p| serde_json::from_slice(&p).ok())
            .ok_or_else(|| ServiceError::Unauthenticated("Malformed token".to_string()))?;

        if claims.kind != kind {
            return Err(ServiceError::Unauthenticated(
                "Wrong token type".to_string(),
            ));
        }
        if claims.exp < Utc::now().timestamp() {
            return Err(ServiceError::Unauthenticated("Token expired".to_string()));
        }
        Ok(claims)
    }

    /// Resolve a bearer access token to its user
    pub async fn authenticate(&self, token: &str) -> ServiceResult<User> {
        let claims = self.verify(token, TokenKind::Access)?;
        self.db
            .get_user(claims.sub)
            .await
            .map_err(|_| ServiceError::Unauthenticated("Unknown user".to_string()))
    }

    /// Create an account; the returned verify token is emailed out-of-band
    pub async fn register(&self, email: &str, password: &str) -> ServiceResult<User> {
        let email = email.trim().to_lowercase();
        if !email.contains('@') || !email.contains('.') {
            return Err(ServiceError::invalid_state("Invalid email address"));
        }
        if password.len() < 8 {
            return Err(ServiceError::invalid_state(
                "Password must be at least 8 characters",
            ));
        }
        if self.db.get_user_by_email(&email).await.is_ok() {
            return Err(ServiceError::conflict("Email is already registered"));
        }

        let user = User {
            id: Uuid::new_v4(),
            email,
            password_hash: hash_password(password),
            role: UserRole::User,
            email_verified_at: None,
            verify_token: hex::encode(rand::random::<[u8; 32]>()),
            reset_token: String::new(),
            created: Utc::now(),
        };
        self.db.insert_user(&user).await?;
        info!("Registered user {}", user.email);
        Ok(user)
    }

    pub async fn login(&self, email: &str, password: &str) -> ServiceResult<(User, String, String)> {
        let user = self
            .db
            .get_user_by_email(&email.trim().to_lowercase())
            .await
            .map_err(|_| ServiceError::Unauthenticated("Invalid email or password".to_string()))?;
        if !verify_password(&user.password_hash, password) {
            return Err(ServiceError::Unauthenticated(
                "Invalid email or password".to_string(),
            ));
        }
        let access = self.mint_access(&user)?;
        let refresh = self.mint_refresh(&user)?;
        Ok((user, access, refresh))
    }

    pub async fn refresh(&self, refresh_token: &str) -> ServiceResult<(User, String)> {
        let claims = self.verify(refresh_token, TokenKind::Refresh)?;
        let user = self
            .db
            .get_user(claims.sub)
            .await
            .map_err(|_| ServiceError::Unauthenticated("Unknown user".to_string()))?;
        let access = self.mint_access(&user)?;
        Ok((user, access))
    }

    pub async fn verify_email(&self, token: &str) -> ServiceResult<User> {
        let mut user = self
            .db
            .get_user_by_verify_token(token)
            .await
            .map_err(|_| ServiceError::not_found("Invalid or expired verification link"))?;
        user.email_verified_at = Some(Utc::now());
        user.verify_token = String::new();
        self.db.update_user(&user).await?;
        Ok(user)
    }

    /// Always succeeds from the caller's view to avoid account probing; the
    /// token only exists when the email matched.
    pub async fn forgot_password(&self, email: &str) -> ServiceResult<Option<(User, String)>> {
        match self.db.get_user_by_email(&email.trim().to_lowercase()).await {
            Ok(mut user) => {
                let token = hex::encode(rand::random::<[u8; 32]>());
                user.reset_token = token.clone();
                self.db.update_user(&user).await?;
                Ok(Some((user, token)))
            }
            Err(_) => Ok(None),
        }
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> ServiceResult<()> {
        if new_password.len() < 8 {
            return Err(ServiceError::invalid_state(
                "Password must be at least 8 characters",
            ));
        }
        let mut user = self
            .db
            .get_user_by_reset_token(token)
            .await
            .map_err(|_| ServiceError::not_found("Invalid or expired reset link"))?;
        user.password_hash = hash_password(new_password);
        user.reset_token = String::new();
        self.db.update_user(&user).await?;
        info!("Password reset for {}", user.email);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockDb;
    use crate::settings::mock_settings;

    fn service(db: Arc<MockDb>) -> AuthService {
        AuthService::new(db, mock_settings().auth)
    }

    #[test]
    fn password_hash_roundtrip() {
        let stored = hash_password("hunter2hunter2");
        assert!(verify_password(&stored, "hunter2hunter2"));
        assert!(!verify_password(&stored, "wrong-password"));
        // distinct salts give distinct digests
        assert_ne!(stored, hash_password("hunter2hunter2"));
    }

    #[tokio::test]
    async fn token_roundtrip() {
        let db = Arc::new(MockDb::default());
        let user = db.add_user("a@example.com").await;
        let svc = service(db);

        let access = svc.mint_access(&user).unwrap();
        let claims = svc.verify(&access, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.role, "user");
    }

    #[tokio::test]
    async fn refresh_token_is_not_an_access_token() {
        let db = Arc::new(MockDb::default());
        let user = db.add_user("a@example.com").await;
        let svc = service(db);

        let refresh = svc.mint_refresh(&user).unwrap();
        let err = svc.verify(&refresh, TokenKind::Access).unwrap_err();
        assert!(matches!(err, ServiceError::Unauthenticated(_)));
        assert!(svc.verify(&refresh, TokenKind::Refresh).is_ok());
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let db = Arc::new(MockDb::default());
        let user = db.add_user("a@example.com").await;
        let svc = service(db);

        let mut token = svc.mint_access(&user).unwrap();
        token.pop();
        token.push('A');
        assert!(svc.verify(&token, TokenKind::Access).is_err());
    }

    #[tokio::test]
    async fn login_and_refresh_flow() {
        let db = Arc::new(MockDb::default());
        let svc = service(db.clone());

        let user = svc.register("new@example.com", "super-secret").await.unwrap();
        assert!(user.email_verified_at.is_none());
        assert!(!user.verify_token.is_empty());

        let (logged_in, access, refresh) =
            svc.login("new@example.com", "super-secret").await.unwrap();
        assert_eq!(logged_in.id, user.id);
        assert!(svc.authenticate(&access).await.is_ok());

        let (_, new_access) = svc.refresh(&refresh).await.unwrap();
        assert!(svc.authenticate(&new_access).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let db = Arc::new(MockDb::default());
        let svc = service(db);
        svc.register("dup@example.com", "super-secret").await.unwrap();
        let err = svc
            .register("dup@example.com", "other-secret")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn email_verification_consumes_token() {
        let db = Arc::new(MockDb::default());
        let svc = service(db.clone());
        let user = svc.register("v@example.com", "super-secret").await.unwrap();

        let verified = svc.verify_email(&user.verify_token).await.unwrap();
        assert!(verified.email_verified_at.is_some());
        // token is one-shot
        assert!(svc.verify_email(&user.verify_token).await.is_err());
    }

    #[tokio::test]
    async fn password_reset_flow() {
        let db = Arc::new(MockDb::default());
        let svc = service(db.clone());
        svc.register("r@example.com", "super-secret").await.unwrap();

        let (_, token) = svc
            .forgot_password("r@example.com")
            .await
            .unwrap()
            .expect("known email yields a token");
        svc.reset_password(&token, "brand-new-pass").await.unwrap();

        assert!(svc.login("r@example.com", "super-secret").await.is_err());
        assert!(svc.login("r@example.com", "brand-new-pass").await.is_ok());

        // unknown emails do not reveal anything
        assert!(
            svc.forgot_password("nobody@example.com")
                .await
                .unwrap()
                .is_none()
        );
    }
}
