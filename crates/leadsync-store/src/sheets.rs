//! # Google Sheets Backend
//!
//! [`TableBackend`] over the Sheets API v4, authenticated as a service
//! account.
//!
//! ## Authentication Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  Service Account Authentication                         │
//! │                                                                         │
//! │  ┌──────────────────┐        ┌──────────────────┐                       │
//! │  │ GoogleSheets     │        │ oauth2.google    │                       │
//! │  │ Backend          │        │ apis.com/token   │                       │
//! │  └────────┬─────────┘        └────────┬─────────┘                       │
//! │           │  1. RS256 JWT assertion    │                                 │
//! │           │  (iss, scope, aud, exp)    │                                 │
//! │           │───────────────────────────►│                                 │
//! │           │  2. access_token, 3600s    │                                 │
//! │           │◄───────────────────────────│                                 │
//! │           │                                                              │
//! │           │  3. Bearer calls to sheets.googleapis.com/v4/...            │
//! │           │     (token reused until 5 minutes before expiry)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Status Mapping
//! - `429` → [`StoreError::Quota`]
//! - `401` / `403` → [`StoreError::Auth`]
//! - anything else non-2xx → [`StoreError::Backend`]

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::backend::{Grid, TableBackend};
use crate::error::{StoreError, StoreResult};

// =============================================================================
// Constants
// =============================================================================

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Margin before token expiration to mint a new one (5 minutes).
const REFRESH_MARGIN_SECS: u64 = 300;

/// Rows given to a freshly created partition.
const NEW_PARTITION_ROWS: usize = 2000;

// =============================================================================
// Service Account Key
// =============================================================================

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// The fields of a service-account JSON key file this backend needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    /// Reads a key file downloaded from the cloud console.
    pub async fn from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn needs_refresh(&self) -> bool {
        Instant::now() + Duration::from_secs(REFRESH_MARGIN_SECS) >= self.expires_at
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// 1 → "A", 26 → "Z", 27 → "AA".
pub fn column_letter(mut column: usize) -> String {
    let mut letters = Vec::new();
    while column > 0 {
        let rem = (column - 1) % 26;
        letters.push(b'A' + rem as u8);
        column = (column - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Quotes a sheet title for A1 notation (`Bob's` → `'Bob''s'`).
pub fn quote_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Extracts the grid from a `values.get` response body.
fn grid_from_values(body: &Value) -> Grid {
    body.get("values")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| cells.iter().map(cell_text).collect())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn validation_request(
    sheet_id: i64,
    column: usize,
    rows: &RangeInclusive<usize>,
    choices: &[String],
) -> Value {
    json!({
        "setDataValidation": {
            "range": {
                "sheetId": sheet_id,
                "startRowIndex": rows.start().saturating_sub(1),
                "endRowIndex": *rows.end(),
                "startColumnIndex": column - 1,
                "endColumnIndex": column,
            },
            "rule": {
                "condition": {
                    "type": "ONE_OF_LIST",
                    "values": choices
                        .iter()
                        .map(|c| json!({ "userEnteredValue": c }))
                        .collect::<Vec<_>>(),
                },
                "showCustomUi": true,
                "strict": false,
            }
        }
    })
}

async fn check(resp: Response) -> StoreResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => StoreError::Quota(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StoreError::Auth(format!("{}: {}", status, body))
        }
        _ => StoreError::Backend(format!("{}: {}", status, body)),
    })
}

// =============================================================================
// Backend
// =============================================================================

/// Sheets API v4 backend for one spreadsheet.
pub struct GoogleSheetsBackend {
    http: Client,
    key: ServiceAccountKey,
    spreadsheet_id: String,
    api_base: String,
    token: RwLock<Option<CachedToken>>,
    sheet_ids: Mutex<HashMap<String, i64>>,
}

impl GoogleSheetsBackend {
    pub fn new(key: ServiceAccountKey, spreadsheet_id: impl Into<String>) -> StoreResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StoreError::Backend(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            key,
            spreadsheet_id: spreadsheet_id.into(),
            api_base: SHEETS_API_BASE.to_string(),
            token: RwLock::new(None),
            sheet_ids: Mutex::new(HashMap::new()),
        })
    }

    /// Points the backend at a different API host.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    // =========================================================================
    // Auth
    // =========================================================================

    async fn access_token(&self) -> StoreResult<String> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if !token.needs_refresh() {
                    return Ok(token.value.clone());
                }
            }
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref() {
            if !token.needs_refresh() {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.mint_token().await?;
        let value = fresh.value.clone();
        *guard = Some(fresh);
        Ok(value)
    }

    async fn mint_token(&self) -> StoreResult<CachedToken> {
        let iat = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + 3600,
        };
        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| StoreError::Auth(format!("invalid service account key: {}", e)))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| StoreError::Auth(format!("failed to sign assertion: {}", e)))?;

        let resp = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let body: TokenResponse = check(resp).await?.json().await?;

        info!(account = %self.key.client_email, "Obtained Sheets access token");
        Ok(CachedToken {
            value: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        })
    }

    // =========================================================================
    // URLs
    // =========================================================================

    fn url(&self, segments: &[&str]) -> StoreResult<Url> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| StoreError::Backend(format!("invalid api base: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Backend("api base cannot hold a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn values_url(&self, range: &str) -> StoreResult<Url> {
        self.url(&["v4", "spreadsheets", &self.spreadsheet_id, "values", range])
    }

    // =========================================================================
    // Sheet Metadata
    // =========================================================================

    async fn sheet_id(&self, title: &str) -> StoreResult<Option<i64>> {
        if let Some(id) = self.cached_sheet_id(title) {
            return Ok(Some(id));
        }

        let mut url = self.url(&["v4", "spreadsheets", &self.spreadsheet_id])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(sheetId,title)");
        let token = self.access_token().await?;
        let resp = self.http.get(url).bearer_auth(token).send().await?;
        let body: Value = check(resp).await?.json().await?;

        let ids: HashMap<String, i64> = body
            .get("sheets")
            .and_then(Value::as_array)
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| {
                        let props = s.get("properties")?;
                        Some((
                            props.get("title")?.as_str()?.to_string(),
                            props.get("sheetId")?.as_i64()?,
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let found = ids.get(title).copied();
        *self.sheet_ids.lock().unwrap_or_else(|e| e.into_inner()) = ids;
        Ok(found)
    }

    fn cached_sheet_id(&self, title: &str) -> Option<i64> {
        self.sheet_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(title)
            .copied()
    }

    fn forget_sheet_ids(&self) {
        self.sheet_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    async fn batch_update(&self, requests: Vec<Value>) -> StoreResult<Value> {
        let batch = format!("{}:batchUpdate", self.spreadsheet_id);
        let url = self.url(&["v4", "spreadsheets", &batch])?;
        let token = self.access_token().await?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&json!({ "requests": requests }))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn put_values(&self, range: &str, cells: &[String]) -> StoreResult<()> {
        let mut url = self.values_url(range)?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        let token = self.access_token().await?;
        let resp = self
            .http
            .put(url)
            .bearer_auth(token)
            .json(&json!({ "majorDimension": "ROWS", "values": [cells] }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl TableBackend for GoogleSheetsBackend {
    async fn read_grid(&self, partition: &str) -> StoreResult<Option<Grid>> {
        if self.sheet_id(partition).await?.is_none() {
            return Ok(None);
        }
        let url = self.values_url(&quote_title(partition))?;
        let token = self.access_token().await?;
        let resp = self.http.get(url).bearer_auth(token).send().await?;
        let body: Value = check(resp).await?.json().await?;
        let grid = grid_from_values(&body);
        debug!(partition, rows = grid.len(), "Read sheet grid");
        Ok(Some(grid))
    }

    async fn create_partition(&self, partition: &str, columns: usize) -> StoreResult<()> {
        self.batch_update(vec![json!({
            "addSheet": {
                "properties": {
                    "title": partition,
                    "gridProperties": {
                        "rowCount": NEW_PARTITION_ROWS,
                        "columnCount": columns.max(26),
                        "frozenRowCount": 1,
                    }
                }
            }
        })])
        .await?;
        self.forget_sheet_ids();
        info!(partition, "Created sheet");
        Ok(())
    }

    async fn write_row(&self, partition: &str, row: usize, cells: &[String]) -> StoreResult<()> {
        let range = format!("{}!A{}", quote_title(partition), row);
        self.put_values(&range, cells).await
    }

    async fn write_cell(
        &self,
        partition: &str,
        row: usize,
        column: usize,
        value: &str,
    ) -> StoreResult<()> {
        let range = format!("{}!{}{}", quote_title(partition), column_letter(column), row);
        self.put_values(&range, &[value.to_string()]).await
    }

    async fn rename_partition(&self, from: &str, to: &str) -> StoreResult<()> {
        let sheet_id = self
            .sheet_id(from)
            .await?
            .ok_or_else(|| StoreError::PartitionNotFound(from.to_string()))?;
        if self.sheet_id(to).await?.is_some() {
            return Err(StoreError::PartitionExists(to.to_string()));
        }
        self.batch_update(vec![json!({
            "updateSheetProperties": {
                "properties": { "sheetId": sheet_id, "title": to },
                "fields": "title",
            }
        })])
        .await?;
        self.forget_sheet_ids();
        info!(from, to, "Renamed sheet");
        Ok(())
    }

    async fn set_choice_validation(
        &self,
        partition: &str,
        column: usize,
        rows: RangeInclusive<usize>,
        choices: &[String],
    ) -> StoreResult<()> {
        let sheet_id = self
            .sheet_id(partition)
            .await?
            .ok_or_else(|| StoreError::PartitionNotFound(partition.to_string()))?;
        self.batch_update(vec![validation_request(sheet_id, column, &rows, choices)])
            .await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
