//! # Sync Configuration
//!
//! Configuration management for the reconciliation service.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     AMO_SUBDOMAIN=acme          GOOGLE_SHEET_ID=1AbC...                │
//! │     ENVIRONMENT=prod → PROD_AMO_SUBDOMAIN wins over AMO_SUBDOMAIN      │
//! │     ENVIRONMENT unset → dev, so DEV_AMO_SUBDOMAIN wins                 │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     --config / LEADSYNC_CONFIG                                         │
//! │     ~/.config/leadsync/leadsync.toml (Linux)                           │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [crm]
//! subdomain = "acme"
//! client_id = "..."
//! client_secret = "..."
//! redirect_uri = "https://sync.example.com/oauth"
//! request_delay_ms = 50
//!
//! [table]
//! spreadsheet_id = "1AbC..."
//! worksheet = "Sheet1"
//! date_offset_hours = 5
//!
//! [sync]
//! trigger_status_names = ["NOMERATSIYALANMAGAN ZAKAZ"]
//! poll_interval_secs = 60
//! dedup_ttl_secs = 300
//! pipeline_keywords = ["Bioflex"]
//!
//! [sync.terminal_statuses]
//! "Отказ" = 143
//! "У курера" = 0
//!
//! [sync.expiry_secs]
//! "Отказ" = 604800
//!
//! [server]
//! port = 8000
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;
use leadsync_core::precedence::{default_rules, PrecedenceRule, PrecedenceTable};
use leadsync_core::{PipelineId, StatusId, TableSchema, Vocabulary};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// CRM Settings
// =============================================================================

/// CRM account and HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmSettings {
    /// Account subdomain (`<subdomain>.amocrm.ru`).
    #[serde(default)]
    pub subdomain: String,

    /// Full base URL, overriding the one derived from `subdomain`.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default)]
    pub redirect_uri: String,

    /// One-time authorization code used when no refresh token exists yet.
    #[serde(default)]
    pub auth_code: Option<String>,

    /// JSON file holding the `{access_token, refresh_token}` pair.
    #[serde(default = "default_token_store")]
    pub token_store: PathBuf,

    /// Minimum gap between two CRM calls, across all callers (milliseconds).
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,

    /// Attempts per call when the CRM answers 429.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff grows by this much per attempt (seconds).
    #[serde(default = "default_retry_step")]
    pub retry_step_secs: u64,

    /// Backoff cap (seconds).
    #[serde(default = "default_retry_cap")]
    pub retry_cap_secs: u64,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_token_store() -> PathBuf {
    PathBuf::from(".amo_tokens.json")
}
fn default_request_delay() -> u64 {
    50
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_step() -> u64 {
    10
}
fn default_retry_cap() -> u64 {
    60
}
fn default_request_timeout() -> u64 {
    30
}

impl Default for CrmSettings {
    fn default() -> Self {
        CrmSettings {
            subdomain: String::new(),
            base_url: None,
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            auth_code: None,
            token_store: default_token_store(),
            request_delay_ms: default_request_delay(),
            max_attempts: default_max_attempts(),
            retry_step_secs: default_retry_step(),
            retry_cap_secs: default_retry_cap(),
            timeout_secs: default_request_timeout(),
        }
    }
}

impl CrmSettings {
    /// Base URL of the CRM account API.
    pub fn base_url(&self) -> SyncResult<Url> {
        let raw = match &self.base_url {
            Some(url) => url.clone(),
            None => format!("https://{}.amocrm.ru", self.subdomain),
        };
        Ok(Url::parse(&raw)?)
    }
}

// =============================================================================
// Table Settings
// =============================================================================

/// Which table backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Google Sheets via a service account.
    #[default]
    Google,

    /// In-process grid; nothing survives a restart.
    Memory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Google => write!(f, "google"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "google" | "sheets" => Ok(BackendKind::Google),
            "memory" => Ok(BackendKind::Memory),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown table backend: '{}'. Valid options: google, memory",
                other
            ))),
        }
    }
}

/// Spreadsheet settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSettings {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_service_account_file")]
    pub service_account_file: PathBuf,

    #[serde(default)]
    pub spreadsheet_id: String,

    /// Active partition (worksheet) name.
    #[serde(default = "default_worksheet")]
    pub worksheet: String,

    /// Worksheet holding the staff code → name directory.
    #[serde(default = "default_staff_sheet")]
    pub staff_sheet: String,

    #[serde(default = "default_staff_cache_ttl")]
    pub staff_cache_ttl_secs: u64,

    /// UTC offset used when rendering dates into cells.
    #[serde(default = "default_date_offset")]
    pub date_offset_hours: i32,

    #[serde(default)]
    pub schema: TableSchema,
}

fn default_service_account_file() -> PathBuf {
    PathBuf::from("gsheet.json")
}
fn default_worksheet() -> String {
    "Sheet1".to_string()
}
fn default_staff_sheet() -> String {
    "Staff".to_string()
}
fn default_staff_cache_ttl() -> u64 {
    300
}
fn default_date_offset() -> i32 {
    5
}

impl Default for TableSettings {
    fn default() -> Self {
        TableSettings {
            backend: BackendKind::default(),
            service_account_file: default_service_account_file(),
            spreadsheet_id: String::new(),
            worksheet: default_worksheet(),
            staff_sheet: default_staff_sheet(),
            staff_cache_ttl_secs: default_staff_cache_ttl(),
            date_offset_hours: default_date_offset(),
            schema: TableSchema::default(),
        }
    }
}

impl TableSettings {
    pub fn date_offset(&self) -> SyncResult<FixedOffset> {
        FixedOffset::east_opt(self.date_offset_hours * 3600).ok_or_else(|| {
            SyncError::InvalidConfig(format!(
                "table.date_offset_hours out of range: {}",
                self.date_offset_hours
            ))
        })
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Reconciliation behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Raw or display names of the statuses that start tracking.
    #[serde(default = "default_trigger_names")]
    pub trigger_status_names: Vec<String>,

    /// Extra trigger status ids.
    #[serde(default)]
    pub trigger_status_ids: Vec<StatusId>,

    /// Pipeline used in status PATCHes when the lead reports none.
    #[serde(default)]
    pub fallback_pipeline_id: PipelineId,

    /// Terminal status name → id. Names are matched against the loaded
    /// pipelines; the ids are the last-resort lookup.
    #[serde(default)]
    pub terminal_statuses: BTreeMap<String, StatusId>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Identical (entity, status) events inside this window are dropped.
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_secs: u64,

    /// Leads created before this Unix timestamp are ignored. 0 = no cutoff.
    #[serde(default)]
    pub created_after: i64,

    /// Only pipelines whose name contains one of these keywords are synced.
    /// Empty = all pipelines.
    #[serde(default)]
    pub pipeline_keywords: Vec<String>,

    /// Sheet status value → tracking lifetime after reaching it (seconds).
    #[serde(default)]
    pub expiry_secs: BTreeMap<String, u64>,

    /// Ordering that keeps automatic updates from demoting sheet values.
    #[serde(default = "default_rules")]
    pub precedence: Vec<PrecedenceRule>,

    /// CRM custom field that receives the order number typed in the sheet.
    #[serde(default)]
    pub marker_field_id: Option<u64>,

    /// CRM display status a lead moves to once its order number is filled.
    #[serde(default = "default_dispatched_status")]
    pub dispatched_status: String,

    /// Poll the CRM event log for changes the webhook missed.
    #[serde(default = "default_true")]
    pub catch_up_enabled: bool,

    /// How far back the first catch-up looks (seconds).
    #[serde(default = "default_catch_up_lookback")]
    pub catch_up_lookback_secs: u64,

    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Startup baseline attempts when the table is over quota.
    #[serde(default = "default_bootstrap_attempts")]
    pub bootstrap_attempts: u32,

    /// Wait before bootstrap attempt `n` is `n × bootstrap_wait_secs`.
    #[serde(default = "default_bootstrap_wait")]
    pub bootstrap_wait_secs: u64,

    /// Ceiling for the poller's backoff after systemic failures (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_trigger_names() -> Vec<String> {
    vec!["NOMERATSIYALANMAGAN ZAKAZ".to_string()]
}
fn default_poll_interval() -> u64 {
    60
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_dedup_ttl() -> u64 {
    300
}
fn default_dispatched_status() -> String {
    "У курера".to_string()
}
fn default_true() -> bool {
    true
}
fn default_catch_up_lookback() -> u64 {
    3600
}
fn default_state_file() -> PathBuf {
    PathBuf::from(".sync_state.json")
}
fn default_bootstrap_attempts() -> u32 {
    5
}
fn default_bootstrap_wait() -> u64 {
    30
}
fn default_max_backoff() -> u64 {
    300
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            trigger_status_names: default_trigger_names(),
            trigger_status_ids: Vec::new(),
            fallback_pipeline_id: PipelineId::default(),
            terminal_statuses: BTreeMap::new(),
            poll_interval_secs: default_poll_interval(),
            sweep_interval_secs: default_sweep_interval(),
            dedup_ttl_secs: default_dedup_ttl(),
            created_after: 0,
            pipeline_keywords: Vec::new(),
            expiry_secs: BTreeMap::new(),
            precedence: default_rules(),
            marker_field_id: None,
            dispatched_status: default_dispatched_status(),
            catch_up_enabled: true,
            catch_up_lookback_secs: default_catch_up_lookback(),
            state_file: default_state_file(),
            bootstrap_attempts: default_bootstrap_attempts(),
            bootstrap_wait_secs: default_bootstrap_wait(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}

// =============================================================================
// Server Settings
// =============================================================================

/// Inbound HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Wraps a raw variable lookup so that, for [`ENV_SCOPED_KEYS`], the
/// `<ENV>_`-prefixed variable wins. `ENVIRONMENT` defaults to `dev`.
fn scoped_lookup<F>(raw: F) -> impl Fn(&str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let scope = raw("ENVIRONMENT")
        .map(|e| e.trim().to_uppercase())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| "DEV".to_string());
    move |key: &str| {
        let scoped = if ENV_SCOPED_KEYS.contains(&key) {
            raw(&format!("{}_{}", scope, key))
        } else {
            None
        };
        scoped
            .or_else(|| raw(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Keys that `ENVIRONMENT=<env>` lets a `<ENV>_`-prefixed variable override.
const ENV_SCOPED_KEYS: &[&str] = &[
    "AMO_SUBDOMAIN",
    "AMO_CLIENT_ID",
    "AMO_CLIENT_SECRET",
    "AMO_REDIRECT_URI",
    "AMO_AUTH_CODE",
    "AMO_TOKEN_STORE",
    "GOOGLE_SERVICE_ACCOUNT_FILE",
    "GOOGLE_SHEET_ID",
    "GOOGLE_WORKSHEET_NAME",
];

/// Complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub crm: CrmSettings,

    #[serde(default)]
    pub table: TableSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub vocabulary: Vocabulary,

    #[serde(default)]
    pub server: ServerSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (leadsync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        let path = config_path
            .or_else(|| std::env::var("LEADSYNC_CONFIG").ok().map(PathBuf::from))
            .or_else(Self::default_config_path);
        if let Some(path) = path {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.crm.subdomain.is_empty() && self.crm.base_url.is_none() {
            return Err(SyncError::InvalidConfig(
                "crm.subdomain (AMO_SUBDOMAIN) is required".into(),
            ));
        }
        self.crm.base_url()?;

        if self.crm.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "crm.max_attempts must be greater than 0".into(),
            ));
        }

        if self.table.backend == BackendKind::Google && self.table.spreadsheet_id.is_empty() {
            return Err(SyncError::InvalidConfig(
                "table.spreadsheet_id (GOOGLE_SHEET_ID) is required".into(),
            ));
        }
        if self.table.worksheet.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "table.worksheet must not be empty".into(),
            ));
        }
        self.table
            .schema
            .validate()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        self.table.date_offset()?;

        if self.sync.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.sync.dedup_ttl_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.dedup_ttl_secs must be greater than 0".into(),
            ));
        }
        PrecedenceTable::new(&self.sync.precedence)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(scoped_lookup(|key| std::env::var(key).ok()));
    }

    /// Applies overrides from `lookup` (variable name → value).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // CRM
        if let Some(v) = lookup("AMO_SUBDOMAIN") {
            debug!(subdomain = %v, "Overriding CRM subdomain from environment");
            self.crm.subdomain = v;
        }
        if let Some(v) = lookup("AMO_BASE_URL") {
            self.crm.base_url = Some(v);
        }
        if let Some(v) = lookup("AMO_CLIENT_ID") {
            self.crm.client_id = v;
        }
        if let Some(v) = lookup("AMO_CLIENT_SECRET") {
            self.crm.client_secret = v;
        }
        if let Some(v) = lookup("AMO_REDIRECT_URI").or_else(|| lookup("AMO_REDIRECT_URL")) {
            self.crm.redirect_uri = v;
        }
        if let Some(v) = lookup("AMO_AUTH_CODE") {
            self.crm.auth_code = Some(v);
        }
        if let Some(v) = lookup("AMO_TOKEN_STORE") {
            self.crm.token_store = PathBuf::from(v);
        }
        if let Some(v) = lookup("AMO_REQUEST_DELAY_SEC") {
            match v.parse::<f64>() {
                Ok(secs) if secs >= 0.0 => self.crm.request_delay_ms = (secs * 1000.0).round() as u64,
                _ => warn!(value = %v, "Ignoring invalid AMO_REQUEST_DELAY_SEC"),
            }
        }

        // Table
        if let Some(v) = lookup("GOOGLE_SERVICE_ACCOUNT_FILE") {
            self.table.service_account_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("GOOGLE_SHEET_ID") {
            self.table.spreadsheet_id = v;
        }
        if let Some(v) = lookup("GOOGLE_WORKSHEET_NAME") {
            self.table.worksheet = v;
        }
        if let Some(v) = lookup("STAFF_CACHE_TTL_SEC") {
            parse_into(&v, "STAFF_CACHE_TTL_SEC", &mut self.table.staff_cache_ttl_secs);
        }
        if let Some(v) = lookup("LEADSYNC_TABLE_BACKEND") {
            match v.parse() {
                Ok(kind) => self.table.backend = kind,
                Err(e) => warn!(error = %e, "Ignoring LEADSYNC_TABLE_BACKEND"),
            }
        }

        // Sync
        if let Some(v) = lookup("TRIGGER_STATUS_NAME") {
            self.sync.trigger_status_names = vec![v];
        }
        if let Some(v) = lookup("TRIGGER_STATUS_ID") {
            match v.parse::<StatusId>() {
                Ok(id) if !id.is_unset() => self.sync.trigger_status_ids = vec![id],
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Ignoring TRIGGER_STATUS_ID"),
            }
        }
        if let Some(v) = lookup("PIPELINE_ID") {
            match v.parse::<PipelineId>() {
                Ok(id) => self.sync.fallback_pipeline_id = id,
                Err(e) => warn!(error = %e, "Ignoring PIPELINE_ID"),
            }
        }
        if let Some(v) = lookup("DROPDOWN_STATUS_MAP_JSON") {
            match serde_json::from_str::<BTreeMap<String, StatusId>>(&v) {
                Ok(map) => self.sync.terminal_statuses = map,
                Err(e) => warn!(error = %e, "Ignoring DROPDOWN_STATUS_MAP_JSON"),
            }
        }
        if let Some(v) = lookup("SYNC_POLL_SECONDS") {
            parse_into(&v, "SYNC_POLL_SECONDS", &mut self.sync.poll_interval_secs);
        }
        if let Some(v) = lookup("LEADS_CREATED_AFTER") {
            parse_into(&v, "LEADS_CREATED_AFTER", &mut self.sync.created_after);
        }
        if let Some(v) = lookup("LEADSYNC_DEDUP_TTL_SECS") {
            parse_into(&v, "LEADSYNC_DEDUP_TTL_SECS", &mut self.sync.dedup_ttl_secs);
        }
        if let Some(v) = lookup("LEADSYNC_PIPELINE_KEYWORDS") {
            self.sync.pipeline_keywords = v
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("LEADSYNC_STATE_FILE") {
            self.sync.state_file = PathBuf::from(v);
        }

        // Server
        if let Some(v) = lookup("HOST") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("PORT") {
            parse_into(&v, "PORT", &mut self.server.port);
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "leadsync", "leadsync")
            .map(|dirs| dirs.config_dir().join("leadsync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Lifetime of a sheet status, if it arms expiry.
    pub fn expiry_for(&self, status: &str) -> Option<chrono::Duration> {
        self.sync
            .expiry_secs
            .get(status)
            .and_then(|secs| chrono::Duration::try_seconds(*secs as i64))
    }

    /// Returns true if `pipeline_name` passes the keyword allow-list.
    pub fn pipeline_allowed(&self, pipeline_name: &str) -> bool {
        if self.sync.pipeline_keywords.is_empty() {
            return true;
        }
        let name = pipeline_name.to_lowercase();
        self.sync
            .pipeline_keywords
            .iter()
            .any(|k| name.contains(&k.to_lowercase()))
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, key: &str, target: &mut T) {
    match value.parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value, "Ignoring unparsable environment value"),
    }
}
