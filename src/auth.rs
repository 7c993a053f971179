//! Account credential lifecycle.
//!
//! `TokenManager::valid_credential` decrypts an account's stored tokens,
//! returns them untouched while they are comfortably valid, and otherwise
//! refreshes against the provider's token endpoint and persists the result.
//! A refresh rejected with `invalid_grant` demotes the account to `revoked`,
//! which is terminal here: no further refresh is attempted for it.

use crate::clients::{HttpsClient, https_client};
use crate::db::Database;
use crate::models::{Account, AccountStatus};
use crate::vault::{Vault, VaultError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hyper::{Body, Method, Request, StatusCode, Uri, header};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, warn};

/// Decrypted credential handed to the evaluators.
#[derive(Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        !self.access_token.is_empty() && self.expires_at > now + margin
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("account {0} not found")]
    AccountNotFound(String),
    #[error("failed to decrypt stored credential: {0}")]
    DecryptionFailed(#[source] VaultError),
    #[error("failed to encrypt refreshed credential: {0}")]
    EncryptionFailed(#[source] VaultError),
    #[error("account authorization has been revoked")]
    TokenRevoked,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("credential expired and no refresh token is stored")]
    MissingRefreshToken,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Tokens issued by a successful refresh. The provider may omit the refresh token.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The user withdrew consent or the grant is otherwise permanently invalid.
    #[error("grant revoked: {0}")]
    Revoked(String),
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth 2.0 refresh-token grant against a token endpoint.
///
/// Each request is built from scratch with only the form body, on a client
/// owned by the refresher, so nothing from a caller's request context leaks
/// into the provider call.
pub struct OAuthRefresher {
    http: HttpsClient,
    client_id: String,
    client_secret: String,
    token_url: Uri,
}

impl OAuthRefresher {
    pub fn new(client_id: String, client_secret: String, token_url: &str) -> Result<Self> {
        Ok(Self {
            http: https_client()?,
            client_id,
            client_secret,
            token_url: token_url.parse().context("Invalid token endpoint URL")?,
        })
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
        let form = serde_urlencoded::to_string([
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .map_err(|e| RefreshError::Failed(format!("failed to encode refresh request: {}", e)))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.token_url.clone())
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .map_err(|e| RefreshError::Failed(format!("failed to build refresh request: {}", e)))?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(|e| RefreshError::Failed(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| RefreshError::Failed(format!("failed to read token response: {}", e)))?;

        parse_token_response(status, &body, Utc::now())
    }
}

/// Interprets a token endpoint response. `invalid_grant` is the only
/// revocation signal; every other failure is treated as transient.
fn parse_token_response(
    status: StatusCode,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<RefreshedToken, RefreshError> {
    if status.is_success() {
        let token: TokenResponse = serde_json::from_slice(body)
            .map_err(|e| RefreshError::Failed(format!("malformed token response: {}", e)))?;
        if token.access_token.is_empty() {
            return Err(RefreshError::Failed(
                "token response carried an empty access token".to_string(),
            ));
        }
        let expires_at = Duration::try_seconds(token.expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                RefreshError::Failed(format!("token lifetime out of range: {}", token.expires_in))
            })?;
        return Ok(RefreshedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expires_at,
        });
    }

    match serde_json::from_slice::<TokenErrorResponse>(body) {
        Ok(err) if err.error == "invalid_grant" => Err(RefreshError::Revoked(
            err.error_description.unwrap_or(err.error),
        )),
        Ok(err) => Err(RefreshError::Failed(format!(
            "HTTP {}: {}{}",
            status,
            err.error,
            err.error_description
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        ))),
        Err(_) => Err(RefreshError::Failed(format!(
            "HTTP {}: {}",
            status,
            String::from_utf8_lossy(body)
        ))),
    }
}

/// Upper bound on a single token endpoint call. The persist that follows is not bounded.
pub const REFRESH_TIMEOUT: StdDuration = StdDuration::from_secs(30);

pub struct TokenManager {
    db: Database,
    vault: Arc<Vault>,
    refresher: Arc<dyn TokenRefresher>,
    expiry_margin: Duration,
    refresh_timeout: StdDuration,
}

impl TokenManager {
    pub fn new(
        db: Database,
        vault: Arc<Vault>,
        refresher: Arc<dyn TokenRefresher>,
        expiry_margin: Duration,
    ) -> Self {
        Self {
            db,
            vault,
            refresher,
            expiry_margin,
            refresh_timeout: REFRESH_TIMEOUT,
        }
    }

    pub fn with_refresh_timeout(mut self, refresh_timeout: StdDuration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self
    }

    /// Returns a credential that is valid now, refreshing and persisting it if needed.
    pub async fn valid_credential(&self, account_id: &str) -> Result<Credential, TokenError> {
        let account = self
            .db
            .get_account_by_id(account_id)
            .await?
            .ok_or_else(|| TokenError::AccountNotFound(account_id.to_string()))?;

        if account.status == AccountStatus::Revoked {
            return Err(TokenError::TokenRevoked);
        }

        let current = self.decrypt(&account)?;
        if current.is_valid_at(Utc::now(), self.expiry_margin) {
            debug!(account_id, expires_at = %current.expires_at, "Stored credential still valid");
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token else {
            return Err(TokenError::MissingRefreshToken);
        };

        // Refresh and persist run on their own task: if the caller's cycle
        // deadline drops this future, a rotated refresh token is still saved.
        let db = self.db.clone();
        let vault = Arc::clone(&self.vault);
        let refresher = Arc::clone(&self.refresher);
        let account_id = account.id.clone();
        let limit = self.refresh_timeout;
        tokio::spawn(async move {
            refresh_and_store(&db, &vault, refresher.as_ref(), limit, &account_id, refresh_token).await
        })
        .await
        .map_err(|e| TokenError::RefreshFailed(format!("refresh task failed: {}", e)))?
    }

    fn decrypt(&self, account: &Account) -> Result<Credential, TokenError> {
        let access_token = self
            .vault
            .decrypt_str(&account.access_token)
            .map_err(TokenError::DecryptionFailed)?;
        let refresh_token = account
            .refresh_token
            .as_deref()
            .map(|ct| self.vault.decrypt_str(ct))
            .transpose()
            .map_err(TokenError::DecryptionFailed)?
            .filter(|t| !t.is_empty());

        Ok(Credential {
            access_token,
            refresh_token,
            expires_at: account.token_expiry,
        })
    }
}

async fn refresh_and_store(
    db: &Database,
    vault: &Vault,
    refresher: &dyn TokenRefresher,
    limit: StdDuration,
    account_id: &str,
    previous_refresh_token: String,
) -> Result<Credential, TokenError> {
    let outcome = match tokio::time::timeout(limit, refresher.refresh(&previous_refresh_token)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(account_id, timeout_secs = limit.as_secs_f64(), "Token refresh timed out");
            return Err(TokenError::RefreshFailed("token endpoint timed out".to_string()));
        }
    };

    match outcome {
        Ok(token) => {
            // Providers do not always reissue the refresh token; keep the old one then.
            let refresh_token = token.refresh_token.unwrap_or(previous_refresh_token);

            let access_ct = vault
                .encrypt_str(&token.access_token)
                .map_err(TokenError::EncryptionFailed)?;
            let refresh_ct = vault
                .encrypt_str(&refresh_token)
                .map_err(TokenError::EncryptionFailed)?;
            db.update_credentials(account_id, &access_ct, Some(&refresh_ct), token.expires_at)
                .await?;

            info!(account_id, expires_at = %token.expires_at, "Refreshed account credential");
            Ok(Credential {
                access_token: token.access_token,
                refresh_token: Some(refresh_token),
                expires_at: token.expires_at,
            })
        }
        Err(RefreshError::Revoked(reason)) => {
            warn!(account_id, reason = %reason, "Refresh grant revoked, marking account revoked");
            if let Err(e) = db.update_status(account_id, AccountStatus::Revoked).await {
                error!(account_id, error = %e, "Failed to persist revoked status");
            }
            Err(TokenError::TokenRevoked)
        }
        Err(RefreshError::Failed(reason)) => Err(TokenError::RefreshFailed(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeRefresher, new_account, test_db, test_vault};

    async fn seed(
        db: &Database,
        vault: &Vault,
        access: &str,
        refresh: Option<&str>,
        expiry: DateTime<Utc>,
    ) -> String {
        let access_ct = vault.encrypt_str(access).unwrap();
        let refresh_ct = refresh.map(|r| vault.encrypt_str(r).unwrap());
        db.create_account(&new_account(&access_ct, refresh_ct.as_deref(), expiry))
            .await
            .unwrap()
    }

    fn manager(db: &Database, vault: Arc<Vault>, refresher: Arc<FakeRefresher>) -> TokenManager {
        TokenManager::new(db.clone(), vault, refresher, Duration::seconds(60))
    }

    #[tokio::test]
    async fn valid_credential_needs_no_refresh_or_write() {
        let (_dir, db) = test_db().await;
        let vault = Arc::new(test_vault());
        let expiry = Utc::now() + Duration::hours(1);
        let id = seed(&db, &vault, "access-1", Some("refresh-1"), expiry).await;
        let before = db.get_account_by_id(&id).await.unwrap().unwrap();

        let refresher = Arc::new(FakeRefresher::succeeding("unused", None));
        let credential = manager(&db, vault, refresher.clone())
            .valid_credential(&id)
            .await
            .unwrap();

        assert_eq!(credential.access_token, "access-1");
        assert_eq!(credential.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(refresher.calls(), 0);

        let after = db.get_account_by_id(&id).await.unwrap().unwrap();
        assert_eq!(after.access_token, before.access_token);
        assert_eq!(after.refresh_token, before.refresh_token);
        assert_eq!(after.token_expiry, before.token_expiry);
    }

    #[tokio::test]
    async fn expired_credential_is_refreshed_and_refresh_token_reused() {
        let (_dir, db) = test_db().await;
        let vault = Arc::new(test_vault());
        let id = seed(&db, &vault, "old-access", Some("keep-me"), Utc::now() - Duration::minutes(5)).await;

        let refresher = Arc::new(FakeRefresher::succeeding("new-access", None));
        let credential = manager(&db, vault.clone(), refresher.clone())
            .valid_credential(&id)
            .await
            .unwrap();

        assert_eq!(credential.access_token, "new-access");
        assert_eq!(refresher.calls(), 1);
        assert_eq!(refresher.last_refresh_token().as_deref(), Some("keep-me"));

        let stored = db.get_account_by_id(&id).await.unwrap().unwrap();
        assert_eq!(vault.decrypt_str(&stored.access_token).unwrap(), "new-access");
        assert_eq!(
            vault.decrypt_str(stored.refresh_token.as_deref().unwrap()).unwrap(),
            "keep-me"
        );
        assert!(stored.token_expiry > Utc::now());
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_stored() {
        let (_dir, db) = test_db().await;
        let vault = Arc::new(test_vault());
        let id = seed(&db, &vault, "old", Some("r1"), Utc::now()).await;

        let refresher = Arc::new(FakeRefresher::succeeding("new", Some("r2")));
        manager(&db, vault.clone(), refresher).valid_credential(&id).await.unwrap();

        let stored = db.get_account_by_id(&id).await.unwrap().unwrap();
        assert_eq!(vault.decrypt_str(stored.refresh_token.as_deref().unwrap()).unwrap(), "r2");
    }

    #[tokio::test]
    async fn revoked_grant_marks_account_revoked() {
        let (_dir, db) = test_db().await;
        let vault = Arc::new(test_vault());
        let id = seed(&db, &vault, "old", Some("r1"), Utc::now() - Duration::hours(2)).await;

        let refresher = Arc::new(FakeRefresher::revoked());
        let tokens = manager(&db, vault, refresher.clone());

        let err = tokens.valid_credential(&id).await.unwrap_err();
        assert!(matches!(err, TokenError::TokenRevoked));
        let stored = db.get_account_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Revoked);

        // terminal: no second refresh attempt
        let err = tokens.valid_credential(&id).await.unwrap_err();
        assert!(matches!(err, TokenError::TokenRevoked));
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failure_leaves_status_untouched() {
        let (_dir, db) = test_db().await;
        let vault = Arc::new(test_vault());
        let id = seed(&db, &vault, "old", Some("r1"), Utc::now() - Duration::hours(2)).await;

        let refresher = Arc::new(FakeRefresher::failing("HTTP 503"));
        let err = manager(&db, vault, refresher)
            .valid_credential(&id)
            .await
            .unwrap_err();

        assert!(matches!(err, TokenError::RefreshFailed(_)));
        let stored = db.get_account_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn missing_account_and_bad_ciphertext() {
        let (_dir, db) = test_db().await;
        let vault = Arc::new(test_vault());
        let refresher = Arc::new(FakeRefresher::succeeding("x", None));
        let tokens = manager(&db, vault, refresher.clone());

        assert!(matches!(
            tokens.valid_credential("nope").await,
            Err(TokenError::AccountNotFound(_))
        ));

        let other = Vault::new(vec![42u8; crate::vault::KEY_LEN]);
        let id = seed(&db, &other, "a", Some("r"), Utc::now() + Duration::hours(1)).await;
        assert!(matches!(
            tokens.valid_credential(&id).await,
            Err(TokenError::DecryptionFailed(_))
        ));
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn expired_without_refresh_token() {
        let (_dir, db) = test_db().await;
        let vault = Arc::new(test_vault());
        let id = seed(&db, &vault, "old", None, Utc::now() - Duration::hours(1)).await;
        let refresher = Arc::new(FakeRefresher::succeeding("x", None));

        let err = manager(&db, vault, refresher.clone())
            .valid_credential(&id)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::MissingRefreshToken));
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn stalled_refresh_times_out_and_releases_its_task() {
        let (_dir, db) = test_db().await;
        let vault = Arc::new(test_vault());
        let id = seed(&db, &vault, "old", Some("r1"), Utc::now() - Duration::hours(1)).await;

        let refresher = Arc::new(FakeRefresher::hanging());
        let tokens = manager(&db, vault, refresher.clone())
            .with_refresh_timeout(StdDuration::from_millis(100));
        let baseline = Arc::strong_count(&refresher);

        let err = tokio::time::timeout(StdDuration::from_secs(5), tokens.valid_credential(&id))
            .await
            .expect("refresh should give up on its own")
            .unwrap_err();

        assert!(matches!(err, TokenError::RefreshFailed(ref reason) if reason.contains("timed out")));
        assert_eq!(refresher.calls(), 1);
        assert_eq!(Arc::strong_count(&refresher), baseline);
        let stored = db.get_account_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Active);
    }

    #[test]
    fn token_endpoint_responses_are_classified() {
        let now = Utc::now();

        let ok = parse_token_response(
            StatusCode::OK,
            br#"{"access_token":"ya29","expires_in":3599,"token_type":"Bearer"}"#,
            now,
        )
        .unwrap();
        assert_eq!(ok.access_token, "ya29");
        assert!(ok.refresh_token.is_none());
        assert_eq!(ok.expires_at, now + Duration::seconds(3599));

        let revoked = parse_token_response(
            StatusCode::BAD_REQUEST,
            br#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
            now,
        );
        assert!(matches!(revoked, Err(RefreshError::Revoked(_))));

        let other = parse_token_response(
            StatusCode::UNAUTHORIZED,
            br#"{"error":"invalid_client"}"#,
            now,
        );
        assert!(matches!(other, Err(RefreshError::Failed(_))));

        let outage = parse_token_response(StatusCode::SERVICE_UNAVAILABLE, b"<html>", now);
        assert!(matches!(outage, Err(RefreshError::Failed(_))));

        let malformed = parse_token_response(StatusCode::OK, b"{}", now);
        assert!(matches!(malformed, Err(RefreshError::Failed(_))));

        let endless = parse_token_response(
            StatusCode::OK,
            br#"{"access_token":"ya29","expires_in":9223372036854775807}"#,
            now,
        );
        assert!(matches!(endless, Err(RefreshError::Failed(ref m)) if m.contains("out of range")));

        let far = parse_token_response(
            StatusCode::OK,
            br#"{"access_token":"ya29","expires_in":9000000000000}"#,
            now,
        );
        assert!(matches!(far, Err(RefreshError::Failed(_))));
    }

    #[test]
    fn validity_respects_margin() {
        let now = Utc::now();
        let credential = Credential {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_at: now + Duration::seconds(30),
        };
        assert!(credential.is_valid_at(now, Duration::zero()));
        assert!(!credential.is_valid_at(now, Duration::seconds(60)));
    }
}
