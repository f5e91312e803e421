//! # CRM Token Manager
//!
//! Keeps a working OAuth access token for the CRM account.
//!
//! ## Token Resolution Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      access_token()                                     │
//! │                                                                         │
//! │  cached and validated < 5 min ago? ──yes──► return cached              │
//! │            │ no (take write lock, check again)                          │
//! │            ▼                                                            │
//! │  load {access, refresh} from token file (env fallback)                  │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  GET /api/v4/account with stored access token ──200──► cache, return   │
//! │            │ rejected                                                   │
//! │            ▼                                                            │
//! │  refresh token present? ──yes──► POST /oauth2/access_token             │
//! │            │ no                    (grant_type=refresh_token)           │
//! │            ▼                                                            │
//! │  auth code configured?  ──yes──► POST /oauth2/access_token             │
//! │            │ no                    (grant_type=authorization_code)      │
//! │            ▼                                                            │
//! │       AuthFailed (operator must run POST /oauth/exchange)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every new pair is written back to the token file before it is used.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use leadsync_core::ValidationError;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CrmSettings;
use crate::error::{SyncError, SyncResult};
use crate::throttle::Throttle;

/// A validated token is trusted without a new account check for this long (5 minutes).
const REVALIDATE_AFTER_SECS: u64 = 300;

const CONSENT_URL: &str = "https://www.amocrm.ru/oauth";

// =============================================================================
// Token Storage
// =============================================================================

/// The persisted OAuth pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
}

/// JSON file holding the current [`TokenPair`].
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the pair. Without a file, `AMO_ACCESS_TOKEN` and
    /// `AMO_REFRESH_TOKEN` are used.
    pub async fn load(&self) -> SyncResult<TokenPair> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TokenPair {
                access_token: std::env::var("AMO_ACCESS_TOKEN").unwrap_or_default(),
                refresh_token: std::env::var("AMO_REFRESH_TOKEN").unwrap_or_default(),
            }),
            Err(e) => Err(SyncError::AuthFailed(format!(
                "cannot read token file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    pub async fn save(&self, pair: &TokenPair) -> SyncResult<()> {
        let bytes = serde_json::to_vec_pretty(pair)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let write = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        write.await.map_err(|e| {
            SyncError::AuthFailed(format!(
                "cannot write token file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!(path = %self.path.display(), "Token pair saved");
        Ok(())
    }
}

// =============================================================================
// Token Manager
// =============================================================================

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    validated_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.validated_at.elapsed() < Duration::from_secs(REVALIDATE_AFTER_SECS)
    }
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
}

/// Issues access tokens for CRM calls.
pub struct TokenManager {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    auth_code: Option<String>,
    store: TokenStore,
    throttle: Arc<Throttle>,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(settings: &CrmSettings, throttle: Arc<Throttle>) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| SyncError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: settings.base_url()?,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            redirect_uri: settings.redirect_uri.clone(),
            auth_code: settings.auth_code.clone().filter(|c| !c.trim().is_empty()),
            store: TokenStore::new(&settings.token_store),
            throttle,
            cached: RwLock::new(None),
        })
    }

    /// Returns a token the CRM accepts, refreshing or bootstrapping as
    /// needed.
    pub async fn access_token(&self) -> SyncResult<String> {
        {
            let guard = self.cached.read().await;
            if let Some(token) = guard.as_ref().filter(|t| t.is_fresh()) {
                return Ok(token.value.clone());
            }
        }

        let mut guard = self.cached.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = guard.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        let pair = self.store.load().await?;

        if !pair.access_token.is_empty() && self.check_account(&pair.access_token).await? {
            debug!("Stored access token accepted");
            *guard = Some(CachedToken {
                value: pair.access_token.clone(),
                validated_at: Instant::now(),
            });
            return Ok(pair.access_token);
        }

        let fresh = if !pair.refresh_token.is_empty() {
            let fresh = self.grant_refresh(&pair.refresh_token).await?;
            info!("Access token refreshed");
            fresh
        } else if let Some(code) = &self.auth_code {
            info!("No refresh token found, bootstrapping from configured authorization code");
            let code = extract_code(code)?;
            self.grant_code(&code).await.map_err(|e| {
                SyncError::AuthFailed(format!("authorization code bootstrap failed: {}", e))
            })?
        } else {
            return Err(SyncError::AuthFailed(
                "No refresh token found. Complete OAuth first via POST /oauth/exchange".into(),
            ));
        };

        self.store.save(&fresh).await?;
        *guard = Some(CachedToken {
            value: fresh.access_token.clone(),
            validated_at: Instant::now(),
        });
        Ok(fresh.access_token)
    }

    /// Forgets the cached token so the next call re-validates it.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    /// Exchanges an authorization code (or a redirect URL carrying one) for a
    /// new pair, persists it, and starts using it.
    pub async fn exchange_code(&self, code_or_redirect_url: &str) -> SyncResult<TokenPair> {
        let code = extract_code(code_or_redirect_url)?;
        let mut guard = self.cached.write().await;

        let pair = self.grant_code(&code).await?;
        self.store.save(&pair).await?;
        *guard = Some(CachedToken {
            value: pair.access_token.clone(),
            validated_at: Instant::now(),
        });

        info!("Authorization code exchanged, token pair saved");
        Ok(pair)
    }

    /// Consent URL an operator opens to authorize the integration.
    pub fn authorization_url(&self) -> SyncResult<Url> {
        Ok(Url::parse_with_params(
            CONSENT_URL,
            &[
                ("client_id", self.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("state", "setup"),
            ],
        )?)
    }

    // =========================================================================
    // CRM Calls
    // =========================================================================

    async fn check_account(&self, access_token: &str) -> SyncResult<bool> {
        let url = self.base_url.join("/api/v4/account")?;
        self.throttle.acquire().await;
        let resp = self.http.get(url).bearer_auth(access_token).send().await?;
        if resp.status() != StatusCode::OK {
            warn!(status = %resp.status(), "Stored access token rejected");
            return Ok(false);
        }
        Ok(true)
    }

    async fn grant_refresh(&self, refresh_token: &str) -> SyncResult<TokenPair> {
        self.grant(json!({
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "redirect_uri": self.redirect_uri,
        }))
        .await
    }

    async fn grant_code(&self, code: &str) -> SyncResult<TokenPair> {
        self.grant(json!({
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": self.redirect_uri,
        }))
        .await
    }

    async fn grant(&self, body: serde_json::Value) -> SyncResult<TokenPair> {
        let url = self.base_url.join("/oauth2/access_token")?;
        self.throttle.acquire().await;
        let resp = self.http.post(url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SyncError::AuthFailed(format!(
                "token grant failed: {} {}",
                status, text
            )));
        }
        let grant: GrantResponse = resp.json().await?;
        Ok(TokenPair {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
        })
    }
}

/// Pulls the authorization code out of a bare code or a redirect URL.
pub fn extract_code(value: &str) -> SyncResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: "code".into(),
        }
        .into());
    }

    let code = match Url::parse(value) {
        Ok(url) => url
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default(),
        Err(_) => match value.split_once("code=") {
            Some((_, rest)) => rest.split('&').next().unwrap_or_default().to_string(),
            None => value.to_string(),
        },
    };

    if code.is_empty() {
        return Err(ValidationError::Required {
            field: "code".into(),
        }
        .into());
    }
    if code.starts_with("eyJ") && code.split('.').count() == 3 {
        return Err(ValidationError::InvalidFormat {
            field: "code".into(),
            reason: "looks like a JWT access token, not an OAuth authorization code; \
                     use the short-lived value of the redirect URL's ?code= parameter"
                .into(),
        }
        .into());
    }
    Ok(code)
}

// =============================================================================
// Tests
// =============================================================================
