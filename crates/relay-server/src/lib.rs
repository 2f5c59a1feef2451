use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use relay_config::Config;
use relay_contracts::{
    AiConfig, ChannelType, DisconnectRequest, ErrorBody, ErrorResponse, ExtraConfig, Integration,
    IntegrationStatus, NewIntegration, SelectAccountRequest, SelectableAccount, SendRequest,
    SendResponse, TenantContext, WebhookPlatform,
};
use relay_kernel::{
    build_authorization_url, build_forward_payload, classify_object, constant_time_eq,
    extract_account_id, resolve_send_target, sign_state, verify_payload_signature, verify_state,
    verify_subscription, OAuthState,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

mod audit;
mod forward;
mod graph;
mod store;

pub use audit::{verify_audit_chain, LifecycleEvent};
pub use store::{StoreBackend, StoreError};

use audit::AuditLog;
use forward::{ForwardOutcome, Forwarder};
use graph::{GraphClient, GraphError};

/// Store handle shared by every request; opened once per process.
pub type SharedStore = Arc<Mutex<StoreBackend>>;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

pub fn open_store(cfg: &Config) -> Result<SharedStore, String> {
    let store = StoreBackend::open(&cfg.store.kind, cfg.store.sqlite_path.as_deref())
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(Mutex::new(store)))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let store = open_store(&cfg)?;
    build_app_with_store(cfg, store).await
}

pub async fn build_app_with_store(cfg: Config, store: SharedStore) -> Result<Router, String> {
    let state = AppState::new(cfg, store).await?;
    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/meta", get(verify_webhook).post(webhook_event))
        .route("/auth/connect", get(connect))
        .route("/auth/callback", get(oauth_callback))
        .route("/integrations", get(list_integrations))
        .route("/integrations/accounts", get(list_accounts))
        .route("/integrations/select", post(select_account))
        .route("/integrations/disconnect", post(disconnect))
        .route("/ai-config", get(get_ai_config).put(put_ai_config))
        .route("/internal/send", post(send_message))
        .with_state(state))
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Backend(msg) => {
                error!(error = %msg, "store operation failed");
                ApiError::Internal("storage unavailable".to_string())
            }
        }
    }
}

/// Failure modes of the OAuth callback, each rendered as a redirect error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackFailure {
    MissingParams,
    InvalidState,
    TokenExchangeFailed,
    AccountAlreadyLinked,
    ServerError,
}

impl CallbackFailure {
    fn code(&self) -> &'static str {
        match self {
            CallbackFailure::MissingParams => "missing_params",
            CallbackFailure::InvalidState => "invalid_state",
            CallbackFailure::TokenExchangeFailed => "token_exchange_failed",
            CallbackFailure::AccountAlreadyLinked => "account_already_linked",
            CallbackFailure::ServerError => "server_error",
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    tenant_id: String,
    user_id: String,
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<Config>,
    store: SharedStore,
    graph: Arc<GraphClient>,
    forwarder: Arc<Forwarder>,
    audit: Arc<AuditLog>,
}

impl AppState {
    async fn new(cfg: Config, store: SharedStore) -> Result<Self, String> {
        Ok(Self {
            graph: Arc::new(GraphClient::new(&cfg.meta)?),
            forwarder: Arc::new(Forwarder::new(&cfg.forward)?),
            audit: Arc::new(AuditLog::open(cfg.audit.jsonl_path.as_deref()).await?),
            store,
            cfg: Arc::new(cfg),
        })
    }

    /// Tenant identity asserted by the identity gateway in front of dashboard routes.
    fn session(&self, headers: &HeaderMap) -> Result<Session, ApiError> {
        let tenant_id =
            header_value(headers, &self.cfg.auth.tenant_header).ok_or(ApiError::Unauthorized)?;
        let user_id = header_value(headers, &self.cfg.auth.user_header).unwrap_or_default();
        Ok(Session { tenant_id, user_id })
    }

    fn authorize_internal(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .unwrap_or("");
        if presented.is_empty()
            || !constant_time_eq(
                presented.as_bytes(),
                self.cfg.internal.api_secret.as_bytes(),
            )
        {
            warn!("internal send rejected: bad or missing bearer token");
            return Err(ApiError::Unauthorized);
        }
        Ok(())
    }

    async fn dispatch_event(&self, headers: &HeaderMap, body: &[u8]) {
        if self.cfg.meta.verify_payload_signature {
            let signature = headers
                .get("x-hub-signature-256")
                .and_then(|v| v.to_str().ok());
            if !verify_payload_signature(&self.cfg.meta.app_secret, signature, body) {
                warn!("webhook payload signature mismatch; event dropped");
                return;
            }
        }

        let raw: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "webhook body is not valid json");
                Value::String(String::from_utf8_lossy(body).into_owned())
            }
        };
        let platform = classify_object(&raw);
        let account_id = extract_account_id(&raw);
        debug!(?platform, account_id = ?account_id, "inbound webhook event");

        let context = match &account_id {
            Some(id) => {
                let context = self.resolve_tenant(id, platform).await;
                if context.is_none() {
                    warn!(account_id = %id, ?platform, "no integration owns webhook account; forwarding without context");
                }
                context
            }
            None => {
                warn!(?platform, "webhook event has no account id; forwarding without context");
                None
            }
        };

        let payload = build_forward_payload(raw, platform, context);
        match self.forwarder.forward(&payload).await {
            ForwardOutcome::Skipped => {
                debug!("no automation engine configured; event not forwarded");
            }
            ForwardOutcome::Delivered { attempts } => {
                info!(attempts, ?platform, "webhook event forwarded");
            }
            ForwardOutcome::Failed { attempts, reason } => {
                error!(attempts, %reason, ?platform, "webhook event could not be forwarded");
            }
        }
    }

    async fn resolve_tenant(
        &self,
        account_id: &str,
        platform: WebhookPlatform,
    ) -> Option<TenantContext> {
        let store = self.store.lock().await;
        let integration = match store.find_by_external_id(account_id, platform.channel()) {
            Ok(Some(v)) => v,
            Ok(None) => return None,
            Err(e) => {
                error!(error = %e, "tenant lookup failed");
                return None;
            }
        };
        let ai_config = match store.get_ai_config(&integration.tenant_id) {
            Ok(v) => v.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, tenant_id = %integration.tenant_id, "ai config load failed; using defaults");
                AiConfig::default()
            }
        };
        drop(store);

        Some(TenantContext {
            organization_id: integration.tenant_id,
            integration_type: integration.channel_type,
            ai_config,
        })
    }

    async fn complete_oauth(&self, query: CallbackQuery) -> Result<(), CallbackFailure> {
        if let Some(reason) = &query.error {
            warn!(%reason, "oauth dialog returned an error");
        }
        let (Some(code), Some(raw_state)) = (non_empty(query.code), non_empty(query.state)) else {
            return Err(CallbackFailure::MissingParams);
        };

        let oauth_state = verify_state(&raw_state, self.cfg.state_secret(), Utc::now())
            .map_err(|e| {
                warn!(error = %e, "oauth state rejected");
                CallbackFailure::InvalidState
            })?;

        let short_lived = self
            .graph
            .exchange_code_for_token(&code)
            .await
            .map_err(|e| {
                log_graph_error("oauth code exchange failed", &e);
                CallbackFailure::TokenExchangeFailed
            })?;

        let access_token = match self
            .graph
            .upgrade_to_long_lived_token(&short_lived.access_token)
            .await
        {
            Ok(long_lived) => {
                debug!(expires_in = ?long_lived.expires_in, "long-lived token issued");
                long_lived.access_token
            }
            Err(e) => {
                log_graph_error("long-lived token upgrade failed; keeping short-lived token", &e);
                short_lived.access_token
            }
        };

        let me = self.graph.fetch_me(&access_token).await.map_err(|e| {
            log_graph_error("facebook profile lookup failed", &e);
            CallbackFailure::TokenExchangeFailed
        })?;

        let saved = {
            let mut store = self.store.lock().await;
            store.upsert_integration(NewIntegration {
                tenant_id: oauth_state.tenant_id.clone(),
                channel_type: ChannelType::FacebookRoot,
                external_account_id: me.id,
                access_token,
                extra_config: ExtraConfig::None,
            })
        };
        let saved = saved.map_err(|e| match e {
            StoreError::Conflict(msg) => {
                warn!(tenant_id = %oauth_state.tenant_id, %msg, "facebook account already linked");
                CallbackFailure::AccountAlreadyLinked
            }
            StoreError::Backend(msg) => {
                error!(error = %msg, "failed to persist facebook credential");
                CallbackFailure::ServerError
            }
        })?;

        self.audit
            .record(
                &saved.tenant_id,
                ChannelType::FacebookRoot,
                LifecycleEvent::Connected,
                Some(&saved.external_account_id),
                Some(&oauth_state.user_id),
            )
            .await;
        info!(tenant_id = %saved.tenant_id, requested = ?oauth_state.channel, "facebook account connected");
        Ok(())
    }

    async fn root_integration(&self, tenant_id: &str) -> Result<Integration, ApiError> {
        let store = self.store.lock().await;
        store
            .get_integration(tenant_id, ChannelType::FacebookRoot)?
            .ok_or_else(|| ApiError::NotFound("facebook account is not connected".to_string()))
    }

    async fn select_account(
        &self,
        session: &Session,
        req: SelectAccountRequest,
    ) -> Result<Integration, ApiError> {
        let channel = parse_user_channel(&req.platform)?;
        let account_id = req.account_id.trim().to_string();
        if account_id.is_empty() {
            return Err(ApiError::BadRequest("accountId is required".to_string()));
        }
        let root = self.root_integration(&session.tenant_id).await?;

        let new = match channel {
            ChannelType::Whatsapp => {
                let phone_number_id = non_empty(req.phone_number_id).ok_or_else(|| {
                    ApiError::BadRequest("phoneNumberId is required for whatsapp".to_string())
                })?;
                let numbers = self
                    .graph
                    .list_phone_numbers(&account_id, &root.access_token)
                    .await
                    .map_err(|e| match e {
                        GraphError::Api { .. } => {
                            log_graph_error("whatsapp account not reachable with root token", &e);
                            ApiError::NotFound(format!(
                                "whatsapp account {account_id} is not available"
                            ))
                        }
                        other => ApiError::Upstream(other.to_string()),
                    })?;
                if !numbers.iter().any(|n| n.id == phone_number_id) {
                    return Err(ApiError::NotFound(format!(
                        "phone number {phone_number_id} does not belong to whatsapp account {account_id}"
                    )));
                }
                NewIntegration {
                    tenant_id: session.tenant_id.clone(),
                    channel_type: channel,
                    external_account_id: account_id,
                    access_token: root.access_token,
                    extra_config: ExtraConfig::Whatsapp { phone_number_id },
                }
            }
            ChannelType::Messenger | ChannelType::Instagram => {
                let pages = self
                    .graph
                    .list_pages(&root.access_token)
                    .await
                    .map_err(|e| ApiError::Upstream(e.to_string()))?;
                let page = pages
                    .into_iter()
                    .find(|page| match channel {
                        ChannelType::Messenger => page.id == account_id,
                        _ => page
                            .instagram_business_account
                            .as_ref()
                            .map(|ig| ig.id == account_id)
                            .unwrap_or(false),
                    })
                    .ok_or_else(|| {
                        ApiError::NotFound(format!("{channel} account {account_id} is not available"))
                    })?;

                if let Err(e) = self.graph.subscribe_page(&page.id, &page.access_token).await {
                    log_graph_error("page webhook subscription failed", &e);
                }

                if channel == ChannelType::Messenger {
                    NewIntegration {
                        tenant_id: session.tenant_id.clone(),
                        channel_type: channel,
                        external_account_id: page.id,
                        access_token: page.access_token,
                        extra_config: ExtraConfig::None,
                    }
                } else {
                    NewIntegration {
                        tenant_id: session.tenant_id.clone(),
                        channel_type: channel,
                        external_account_id: account_id,
                        access_token: page.access_token,
                        extra_config: ExtraConfig::Instagram { page_id: page.id },
                    }
                }
            }
            ChannelType::FacebookRoot => {
                return Err(ApiError::BadRequest(
                    "facebook_root cannot be selected".to_string(),
                ))
            }
        };

        let saved = {
            let mut store = self.store.lock().await;
            store.upsert_integration(new)?
        };
        self.audit
            .record(
                &saved.tenant_id,
                saved.channel_type,
                LifecycleEvent::ChannelSelected,
                Some(&saved.external_account_id),
                Some(&session.user_id),
            )
            .await;
        info!(tenant_id = %saved.tenant_id, channel = %saved.channel_type, "channel integration selected");
        Ok(saved)
    }

    async fn disconnect(&self, session: &Session, channel: ChannelType) -> Result<(), ApiError> {
        let tenant_id = session.tenant_id.as_str();
        let (removed, root_removed) = {
            let mut store = self.store.lock().await;
            let removed = store.delete_integration(tenant_id, channel)?;
            let mut root_removed = false;
            if channel.is_page_backed()
                && store.count_channels(tenant_id, &ChannelType::PAGE_BACKED)? == 0
            {
                root_removed = store.delete_integration(tenant_id, ChannelType::FacebookRoot)?;
            }
            (removed, root_removed)
        };

        if removed {
            self.audit
                .record(tenant_id, channel, LifecycleEvent::Disconnected, None, Some(&session.user_id))
                .await;
        }
        if root_removed {
            self.audit
                .record(
                    tenant_id,
                    ChannelType::FacebookRoot,
                    LifecycleEvent::Disconnected,
                    None,
                    Some(&session.user_id),
                )
                .await;
        }
        info!(%tenant_id, %channel, removed, root_removed, "channel disconnected");
        Ok(())
    }

    async fn send(&self, req: SendRequest) -> Result<SendResponse, ApiError> {
        let (Some(platform), Some(tenant_id), Some(recipient_id), Some(message)) = (
            non_empty(req.platform),
            non_empty(req.org_id),
            non_empty(req.recipient_id),
            req.message.filter(|m| !m.text().trim().is_empty()),
        ) else {
            return Err(ApiError::BadRequest(
                "platform, orgId, recipientId and message are required".to_string(),
            ));
        };
        let channel = parse_user_channel(&platform)?;

        let integration = {
            let store = self.store.lock().await;
            store.get_integration(&tenant_id, channel)?
        }
        .filter(|i| i.status == IntegrationStatus::Active)
        .ok_or_else(|| {
            ApiError::NotFound(format!("no active {channel} integration for organization"))
        })?;

        let target =
            resolve_send_target(&integration).map_err(|e| ApiError::BadRequest(e.to_string()))?;

        match self
            .graph
            .send_message(&target, &integration.access_token, &recipient_id, message.text())
            .await
        {
            Ok(data) => Ok(SendResponse {
                success: true,
                data,
            }),
            Err(e) => {
                if e.is_invalid_token() {
                    self.revoke(&tenant_id, channel).await;
                }
                error!(%tenant_id, %channel, error = %e, "outbound send failed");
                Err(ApiError::Internal(e.to_string()))
            }
        }
    }

    async fn revoke(&self, tenant_id: &str, channel: ChannelType) {
        let marked = {
            let mut store = self.store.lock().await;
            store.set_status(tenant_id, channel, IntegrationStatus::Revoked)
        };
        match marked {
            Ok(true) => {
                warn!(%tenant_id, %channel, "access token rejected by platform; integration revoked");
                self.audit
                    .record(tenant_id, channel, LifecycleEvent::Revoked, None, None)
                    .await;
            }
            Ok(false) => {}
            Err(e) => error!(error = %e, "failed to mark integration revoked"),
        }
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
struct WebhookVerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn verify_webhook(
    State(state): State<AppState>,
    query: Result<Query<WebhookVerifyQuery>, QueryRejection>,
) -> (StatusCode, String) {
    let Ok(Query(query)) = query else {
        return (StatusCode::FORBIDDEN, "Forbidden".to_string());
    };
    match verify_subscription(
        query.mode.as_deref(),
        query.verify_token.as_deref(),
        query.challenge.as_deref(),
        &state.cfg.meta.verify_token,
    ) {
        Some(challenge) => {
            info!("webhook subscription verified");
            (StatusCode::OK, challenge)
        }
        None => {
            warn!(mode = ?query.mode, "webhook subscription verification failed");
            (StatusCode::FORBIDDEN, "Forbidden".to_string())
        }
    }
}

async fn webhook_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> (StatusCode, &'static str) {
    match axum::body::to_bytes(body, state.cfg.meta.max_payload_bytes).await {
        Ok(bytes) => state.dispatch_event(&headers, &bytes).await,
        Err(e) => warn!(
            error = %e,
            limit = state.cfg.meta.max_payload_bytes,
            "webhook body unreadable or too large; event dropped"
        ),
    }
    (StatusCode::OK, "OK")
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    channel: Option<String>,
}

async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> Result<Response, ApiError> {
    let session = state.session(&headers)?;
    let channel = match non_empty(query.channel) {
        Some(v) => Some(parse_user_channel(&v)?),
        None => None,
    };

    let oauth_state = OAuthState::new(
        &session.tenant_id,
        &session.user_id,
        channel,
        state.cfg.oauth.state_ttl_secs,
        Utc::now(),
    );
    let signed = sign_state(&oauth_state, state.cfg.state_secret());
    let url = build_authorization_url(
        &state.cfg.meta.dialog_url,
        &state.cfg.meta.app_id,
        &state.cfg.meta.redirect_uri,
        &signed,
        channel,
    );
    info!(tenant_id = %session.tenant_id, ?channel, "starting oauth connect");
    Ok(found(&url))
}

#[derive(Debug, Default, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    query: Result<Query<CallbackQuery>, QueryRejection>,
) -> Response {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    match state.complete_oauth(query).await {
        Ok(()) => found(&state.cfg.oauth.success_redirect),
        Err(failure) => {
            warn!(error_code = failure.code(), "oauth callback failed");
            found(&error_location(&state.cfg.oauth.error_redirect, failure.code()))
        }
    }
}

async fn list_integrations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let session = state.session(&headers)?;
    let rows = {
        let store = state.store.lock().await;
        store.list_integrations(&session.tenant_id)?
    };
    Ok(Json(json!({ "integrations": rows })))
}

async fn list_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let session = state.session(&headers)?;
    let root = state.root_integration(&session.tenant_id).await?;
    let pages = state
        .graph
        .list_pages(&root.access_token)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    let accounts: Vec<SelectableAccount> = pages
        .into_iter()
        .map(|page| SelectableAccount {
            page_id: page.id,
            page_name: page.name,
            instagram_account_id: page
                .instagram_business_account
                .as_ref()
                .map(|ig| ig.id.clone()),
            instagram_username: page.instagram_business_account.and_then(|ig| ig.username),
        })
        .collect();
    Ok(Json(json!({ "accounts": accounts })))
}

async fn select_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Integration>, ApiError> {
    let session = state.session(&headers)?;
    let req: SelectAccountRequest = decode_body(&body)?;
    state.select_account(&session, req).await.map(Json)
}

async fn disconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let session = state.session(&headers)?;
    let req: DisconnectRequest = decode_body(&body)?;
    let channel = parse_user_channel(&req.platform)?;
    state.disconnect(&session, channel).await?;
    Ok(Json(json!({ "success": true })))
}

async fn get_ai_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AiConfig>, ApiError> {
    let session = state.session(&headers)?;
    let store = state.store.lock().await;
    Ok(Json(
        store
            .get_ai_config(&session.tenant_id)?
            .unwrap_or_default(),
    ))
}

async fn put_ai_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AiConfig>, ApiError> {
    let session = state.session(&headers)?;
    let config: AiConfig = decode_body(&body)?;
    let mut store = state.store.lock().await;
    store.put_ai_config(&session.tenant_id, &config)?;
    Ok(Json(config))
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SendResponse>, ApiError> {
    state.authorize_internal(&headers)?;
    let req: SendRequest = decode_body(&body)?;
    state.send(req).await.map(Json)
}

/// Decodes a JSON body after the caller has been authenticated.
fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))
}

fn parse_user_channel(value: &str) -> Result<ChannelType, ApiError> {
    match value.trim().parse::<ChannelType>() {
        Ok(channel) if ChannelType::USER_FACING.contains(&channel) => Ok(channel),
        _ => Err(ApiError::BadRequest(format!(
            "unsupported platform: {value}"
        ))),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn error_location(base: &str, code: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}error={code}")
}

fn log_graph_error(context: &str, err: &GraphError) {
    match err {
        GraphError::Api {
            message,
            kind,
            code,
            raw,
        } => warn!(%message, ?kind, ?code, error = %raw, "{context}"),
        other => warn!(error = %other, "{context}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_channels_exclude_root_and_unknown_values() {
        assert_eq!(
            parse_user_channel("instagram").unwrap(),
            ChannelType::Instagram
        );
        assert!(matches!(
            parse_user_channel("facebook_root"),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            parse_user_channel("sms"),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn error_location_appends_code_to_existing_query() {
        assert_eq!(
            error_location("/integrations", "missing_params"),
            "/integrations?error=missing_params"
        );
        assert_eq!(
            error_location("/integrations?tab=meta", "server_error"),
            "/integrations?tab=meta&error=server_error"
        );
    }

    #[test]
    fn malformed_bodies_are_bad_requests() {
        assert!(matches!(
            decode_body::<DisconnectRequest>(b""),
            Err(ApiError::BadRequest(_))
        ));
        let req: DisconnectRequest = decode_body(br#"{"platform":"whatsapp"}"#).unwrap();
        assert_eq!(req.platform, "whatsapp");
    }

    #[test]
    fn api_errors_map_to_status_codes() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::NotFound("x".to_string()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::Conflict("dup".to_string())).status(),
            StatusCode::CONFLICT
        );
    }
}
