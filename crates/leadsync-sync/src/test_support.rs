//! In-process fake of the CRM's REST surface for HTTP-level tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use url::Url;

pub struct FakeCrm {
    leads: Mutex<BTreeMap<u64, Value>>,
    contacts: Mutex<BTreeMap<u64, Value>>,
    events: Mutex<Vec<Value>>,
    pipelines: Mutex<Vec<Value>>,
    users: Mutex<Vec<Value>>,
    page_size: AtomicUsize,
    rate_limit_budget: AtomicUsize,
    rate_limited: AtomicUsize,
    account_checks: AtomicUsize,
    grants: Mutex<Vec<Value>>,
    patches: Mutex<Vec<(u64, Value)>>,
    queries: Mutex<HashMap<String, String>>,
}

impl FakeCrm {
    pub const VALID_TOKEN: &'static str = "access-ok";
    pub const NEXT_REFRESH: &'static str = "refresh-next";

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            leads: Mutex::new(BTreeMap::new()),
            contacts: Mutex::new(BTreeMap::new()),
            events: Mutex::new(Vec::new()),
            pipelines: Mutex::new(vec![json!({
                "id": 7,
                "name": "Sales",
                "_embedded": { "statuses": [
                    { "id": 42, "name": "NOMERATSIYALANMAGAN ZAKAZ" },
                    { "id": 142, "name": "Успешно" },
                    { "id": 143, "name": "У курера" }
                ]}
            })]),
            users: Mutex::new(vec![json!({ "id": 1, "name": "Dilnoza" })]),
            page_size: AtomicUsize::new(250),
            rate_limit_budget: AtomicUsize::new(0),
            rate_limited: AtomicUsize::new(0),
            account_checks: AtomicUsize::new(0),
            grants: Mutex::new(Vec::new()),
            patches: Mutex::new(Vec::new()),
            queries: Mutex::new(HashMap::new()),
        })
    }

    pub fn put_lead(&self, lead: Value) {
        let id = lead["id"].as_u64().unwrap_or_default();
        self.leads.lock().unwrap().insert(id, lead);
    }

    pub fn put_contact(&self, contact: Value) {
        let id = contact["id"].as_u64().unwrap_or_default();
        self.contacts.lock().unwrap().insert(id, contact);
    }

    pub fn put_event(&self, event: Value) {
        self.events.lock().unwrap().push(event);
    }

    pub fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::SeqCst);
    }

    /// The next `n` API calls (other than the account check) get HTTP 429.
    pub fn rate_limit_next(&self, n: usize) {
        self.rate_limit_budget.store(n, Ordering::SeqCst);
    }

    pub fn rate_limited(&self) -> usize {
        self.rate_limited.load(Ordering::SeqCst)
    }

    pub fn account_checks(&self) -> usize {
        self.account_checks.load(Ordering::SeqCst)
    }

    pub fn grants(&self) -> usize {
        self.grants.lock().unwrap().len()
    }

    pub fn last_grant_type(&self) -> Option<String> {
        self.last_grant_field("grant_type")
    }

    pub fn last_code(&self) -> Option<String> {
        self.last_grant_field("code")
    }

    fn last_grant_field(&self, field: &str) -> Option<String> {
        self.grants
            .lock()
            .unwrap()
            .last()
            .and_then(|g| g[field].as_str().map(str::to_string))
    }

    pub fn patches(&self) -> Vec<(u64, Value)> {
        self.patches.lock().unwrap().clone()
    }

    pub fn last_query(&self, path: &str) -> Option<String> {
        self.queries.lock().unwrap().get(path).cloned()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {}", Self::VALID_TOKEN))
            .unwrap_or(false)
    }

    /// Shared gate for API routes: auth, then the 429 budget.
    fn gate(&self, headers: &HeaderMap) -> Option<Response> {
        if !self.authorized(headers) {
            return Some(StatusCode::UNAUTHORIZED.into_response());
        }
        let limited = self
            .rate_limit_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            self.rate_limited.fetch_add(1, Ordering::SeqCst);
            return Some(StatusCode::TOO_MANY_REQUESTS.into_response());
        }
        None
    }

    fn record_query(&self, path: &str, params: &HashMap<String, String>) {
        let mut pairs: Vec<_> = params.iter().collect();
        pairs.sort();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.queries.lock().unwrap().insert(path.to_string(), query);
    }
}

/// Starts the fake on an ephemeral port and returns its base URL.
pub async fn spawn_fake_crm(crm: Arc<FakeCrm>) -> Url {
    let app = Router::new()
        .route("/api/v4/account", get(account))
        .route("/oauth2/access_token", post(access_token))
        .route("/api/v4/leads", get(list_leads))
        .route("/api/v4/leads/pipelines", get(list_pipelines))
        .route("/api/v4/leads/{id}", get(get_lead).patch(patch_lead))
        .route("/api/v4/contacts/{id}", get(get_contact))
        .route("/api/v4/events", get(list_events))
        .route("/api/v4/users", get(list_users))
        .with_state(crm);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}", addr)).unwrap()
}

type Params = Query<HashMap<String, String>>;

async fn account(State(crm): State<Arc<FakeCrm>>, headers: HeaderMap) -> Response {
    crm.account_checks.fetch_add(1, Ordering::SeqCst);
    if crm.authorized(&headers) {
        Json(json!({ "id": 1, "name": "fake" })).into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn access_token(State(crm): State<Arc<FakeCrm>>, Json(body): Json<Value>) -> Response {
    crm.grants.lock().unwrap().push(body);
    Json(json!({
        "token_type": "Bearer",
        "expires_in": 86400,
        "access_token": FakeCrm::VALID_TOKEN,
        "refresh_token": FakeCrm::NEXT_REFRESH
    }))
    .into_response()
}

fn in_range(item: &Value, field: &str, params: &HashMap<String, String>) -> bool {
    let at = item[field].as_i64().unwrap_or_default();
    let bound = |side: &str| {
        params
            .get(&format!("filter[{}][{}]", field, side))
            .and_then(|v| v.parse::<i64>().ok())
    };
    bound("from").map_or(true, |from| at >= from) && bound("to").map_or(true, |to| at <= to)
}

fn page_of(
    crm: &FakeCrm,
    path: &str,
    key: &str,
    items: Vec<Value>,
    params: &HashMap<String, String>,
) -> Response {
    let size = crm.page_size.load(Ordering::SeqCst);
    let page: usize = params
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(1)
        .max(1);
    let chunk: Vec<Value> = items.iter().skip((page - 1) * size).take(size).cloned().collect();
    if chunk.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }

    let mut links = json!({});
    if page * size < items.len() {
        let mut next: Vec<(String, String)> = params
            .iter()
            .filter(|(k, _)| k.as_str() != "page")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        next.push(("page".into(), (page + 1).to_string()));
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(next)
            .finish();
        links = json!({ "next": { "href": format!("{}?{}", path, query) } });
    }
    Json(json!({ "_embedded": { key: chunk }, "_links": links })).into_response()
}

async fn list_leads(
    State(crm): State<Arc<FakeCrm>>,
    headers: HeaderMap,
    Query(params): Params,
) -> Response {
    if let Some(rejected) = crm.gate(&headers) {
        return rejected;
    }
    let items: Vec<Value> = crm
        .leads
        .lock()
        .unwrap()
        .values()
        .filter(|l| in_range(l, "created_at", &params) && in_range(l, "updated_at", &params))
        .cloned()
        .collect();
    page_of(&crm, "/api/v4/leads", "leads", items, &params)
}

async fn list_events(
    State(crm): State<Arc<FakeCrm>>,
    headers: HeaderMap,
    Query(params): Params,
) -> Response {
    if let Some(rejected) = crm.gate(&headers) {
        return rejected;
    }
    let items: Vec<Value> = crm
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| in_range(e, "created_at", &params))
        .cloned()
        .collect();
    page_of(&crm, "/api/v4/events", "events", items, &params)
}

async fn list_pipelines(
    State(crm): State<Arc<FakeCrm>>,
    headers: HeaderMap,
    Query(params): Params,
) -> Response {
    if let Some(rejected) = crm.gate(&headers) {
        return rejected;
    }
    let items = crm.pipelines.lock().unwrap().clone();
    page_of(&crm, "/api/v4/leads/pipelines", "pipelines", items, &params)
}

async fn list_users(
    State(crm): State<Arc<FakeCrm>>,
    headers: HeaderMap,
    Query(params): Params,
) -> Response {
    if let Some(rejected) = crm.gate(&headers) {
        return rejected;
    }
    let items = crm.users.lock().unwrap().clone();
    page_of(&crm, "/api/v4/users", "users", items, &params)
}

async fn get_lead(
    State(crm): State<Arc<FakeCrm>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Query(params): Params,
) -> Response {
    if let Some(rejected) = crm.gate(&headers) {
        return rejected;
    }
    crm.record_query(&format!("/api/v4/leads/{}", id), &params);
    match crm.leads.lock().unwrap().get(&id) {
        Some(lead) => Json(lead.clone()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn patch_lead(
    State(crm): State<Arc<FakeCrm>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(rejected) = crm.gate(&headers) {
        return rejected;
    }
    let mut leads = crm.leads.lock().unwrap();
    let Some(lead) = leads.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    for field in ["status_id", "pipeline_id"] {
        if let Some(v) = body.get(field) {
            lead[field] = v.clone();
        }
    }
    crm.patches.lock().unwrap().push((id, body));
    Json(json!({ "id": id })).into_response()
}

async fn get_contact(
    State(crm): State<Arc<FakeCrm>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    if let Some(rejected) = crm.gate(&headers) {
        return rejected;
    }
    match crm.contacts.lock().unwrap().get(&id) {
        Some(contact) => Json(contact.clone()).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
