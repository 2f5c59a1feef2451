use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use relay_contracts::{
    ChannelType, ExtraConfig, ForwardPayload, Integration, TenantContext, WebhookPlatform,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const MESSENGER_SCOPES: &[&str] = &[
    "pages_show_list",
    "pages_messaging",
    "pages_manage_metadata",
];
const INSTAGRAM_SCOPES: &[&str] = &[
    "instagram_basic",
    "instagram_manage_messages",
    "pages_show_list",
    "pages_manage_metadata",
];
const WHATSAPP_SCOPES: &[&str] = &[
    "whatsapp_business_management",
    "whatsapp_business_messaging",
    "business_management",
];

pub fn classify_object(raw: &Value) -> WebhookPlatform {
    match raw.get("object").and_then(|v| v.as_str()) {
        Some("page") => WebhookPlatform::Messenger,
        Some("instagram") => WebhookPlatform::Instagram,
        Some("whatsapp_business_account") => WebhookPlatform::Whatsapp,
        _ => WebhookPlatform::Unknown,
    }
}

/// Account id of the first entry. Later entries in a batch are not consulted.
pub fn extract_account_id(raw: &Value) -> Option<String> {
    let id = raw.get("entry")?.as_array()?.first()?.get("id")?;
    match id {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn build_forward_payload(
    raw: Value,
    platform: WebhookPlatform,
    context: Option<TenantContext>,
) -> ForwardPayload {
    ForwardPayload {
        raw_body: raw,
        platform,
        context,
    }
}

/// Returns the challenge to echo back when the handshake is valid.
pub fn verify_subscription(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    expected_token: &str,
) -> Option<String> {
    match (mode, token, challenge) {
        (Some("subscribe"), Some(token), Some(challenge))
            if constant_time_eq(token.as_bytes(), expected_token.as_bytes()) =>
        {
            Some(challenge.to_string())
        }
        _ => None,
    }
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Checks Meta's `X-Hub-Signature-256: sha256=<hex>` header against the raw body.
pub fn verify_payload_signature(app_secret: &str, header: Option<&str>, body: &[u8]) -> bool {
    let signature = header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

pub fn sign_payload_hex(app_secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthState {
    pub tenant_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelType>,
    pub nonce: String,
    pub exp: i64,
}

impl OAuthState {
    pub fn new(
        tenant_id: &str,
        user_id: &str,
        channel: Option<ChannelType>,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            channel,
            nonce: uuid::Uuid::new_v4().as_simple().to_string(),
            exp: now.timestamp().saturating_add(ttl_secs as i64),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("state is malformed")]
    Malformed,
    #[error("state signature does not match")]
    BadSignature,
    #[error("state has expired")]
    Expired,
}

/// Encodes the state as `<b64url json>.<b64url hmac>`.
pub fn sign_state(state: &OAuthState, secret: &str) -> String {
    let json = serde_json::to_vec(state).unwrap_or_default();
    let body = URL_SAFE_NO_PAD.encode(json);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{body}.{sig}")
}

pub fn verify_state(token: &str, secret: &str, now: DateTime<Utc>) -> Result<OAuthState, StateError> {
    let (body, sig) = token.split_once('.').ok_or(StateError::Malformed)?;
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|_| StateError::Malformed)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| StateError::Malformed)?;
    mac.update(body.as_bytes());
    mac.verify_slice(&sig_bytes)
        .map_err(|_| StateError::BadSignature)?;

    let json = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|_| StateError::Malformed)?;
    let state: OAuthState = serde_json::from_slice(&json).map_err(|_| StateError::Malformed)?;
    if state.tenant_id.is_empty() {
        return Err(StateError::Malformed);
    }
    if state.exp < now.timestamp() {
        return Err(StateError::Expired);
    }
    Ok(state)
}

/// Permission scopes for one channel, or the de-duplicated union of all of them.
pub fn scopes_for(channel: Option<ChannelType>) -> Vec<&'static str> {
    let sets: Vec<&[&str]> = match channel {
        Some(ChannelType::Messenger) => vec![MESSENGER_SCOPES],
        Some(ChannelType::Instagram) => vec![INSTAGRAM_SCOPES],
        Some(ChannelType::Whatsapp) => vec![WHATSAPP_SCOPES],
        Some(ChannelType::FacebookRoot) | None => {
            vec![MESSENGER_SCOPES, INSTAGRAM_SCOPES, WHATSAPP_SCOPES]
        }
    };
    let mut scopes = Vec::new();
    for scope in sets.into_iter().flatten() {
        if !scopes.contains(scope) {
            scopes.push(*scope);
        }
    }
    scopes
}

pub fn build_authorization_url(
    dialog_url: &str,
    app_id: &str,
    redirect_uri: &str,
    state: &str,
    channel: Option<ChannelType>,
) -> String {
    let scope = scopes_for(channel).join(",");
    format!(
        "{}?client_id={}&redirect_uri={}&state={}&response_type=code&scope={}",
        dialog_url,
        urlencoding::encode(app_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(&scope)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// Messenger and Instagram both send through a Facebook Page's messages edge.
    Page { page_id: String },
    Whatsapp { phone_number_id: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("integration has no access token")]
    MissingToken,
    #[error("no page id available for {0}")]
    MissingPageId(ChannelType),
    #[error("no phone number id configured for whatsapp")]
    MissingPhoneNumberId,
    #[error("channel {0} does not support sending")]
    Unsupported(ChannelType),
}

pub fn resolve_send_target(integration: &Integration) -> Result<SendTarget, TargetError> {
    if integration.access_token.trim().is_empty() {
        return Err(TargetError::MissingToken);
    }
    match integration.channel_type {
        ChannelType::Instagram => {
            let page_id = match &integration.extra_config {
                ExtraConfig::Instagram { page_id } if !page_id.is_empty() => page_id.clone(),
                _ => integration.external_account_id.clone(),
            };
            if page_id.trim().is_empty() {
                return Err(TargetError::MissingPageId(ChannelType::Instagram));
            }
            Ok(SendTarget::Page { page_id })
        }
        ChannelType::Messenger => {
            if integration.external_account_id.trim().is_empty() {
                return Err(TargetError::MissingPageId(ChannelType::Messenger));
            }
            Ok(SendTarget::Page {
                page_id: integration.external_account_id.clone(),
            })
        }
        ChannelType::Whatsapp => match &integration.extra_config {
            ExtraConfig::Whatsapp { phone_number_id } if !phone_number_id.is_empty() => {
                Ok(SendTarget::Whatsapp {
                    phone_number_id: phone_number_id.clone(),
                })
            }
            _ => Err(TargetError::MissingPhoneNumberId),
        },
        ChannelType::FacebookRoot => Err(TargetError::Unsupported(ChannelType::FacebookRoot)),
    }
}

/// Delay before the single forward retry, drawn from `0..=jitter_ms`.
pub fn retry_delay_with_jitter(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_contracts::IntegrationStatus;
    use serde_json::json;

    fn integration(channel: ChannelType, external: &str, extra: ExtraConfig) -> Integration {
        Integration {
            id: "int_1".to_string(),
            tenant_id: "org_abc".to_string(),
            channel_type: channel,
            external_account_id: external.to_string(),
            access_token: "tok".to_string(),
            status: IntegrationStatus::Active,
            extra_config: extra,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn classifies_known_objects() {
        assert_eq!(
            classify_object(&json!({"object": "page"})),
            WebhookPlatform::Messenger
        );
        assert_eq!(
            classify_object(&json!({"object": "instagram"})),
            WebhookPlatform::Instagram
        );
        assert_eq!(
            classify_object(&json!({"object": "whatsapp_business_account"})),
            WebhookPlatform::Whatsapp
        );
        assert_eq!(
            classify_object(&json!({"object": "user"})),
            WebhookPlatform::Unknown
        );
        assert_eq!(classify_object(&json!([1, 2])), WebhookPlatform::Unknown);
    }

    #[test]
    fn extracts_only_first_entry_id() {
        let raw = json!({"object": "page", "entry": [{"id": "111"}, {"id": "222"}]});
        assert_eq!(extract_account_id(&raw).as_deref(), Some("111"));
        assert_eq!(
            extract_account_id(&json!({"entry": [{"id": 17841400}]})).as_deref(),
            Some("17841400")
        );
        assert_eq!(extract_account_id(&json!({"object": "page"})), None);
        assert_eq!(extract_account_id(&json!({"entry": []})), None);
    }

    #[test]
    fn subscription_requires_subscribe_mode_and_matching_token() {
        assert_eq!(
            verify_subscription(Some("subscribe"), Some("s3cret"), Some("c-42"), "s3cret"),
            Some("c-42".to_string())
        );
        assert_eq!(
            verify_subscription(Some("subscribe"), Some("wrong"), Some("c-42"), "s3cret"),
            None
        );
        assert_eq!(
            verify_subscription(Some("unsubscribe"), Some("s3cret"), Some("c-42"), "s3cret"),
            None
        );
        assert_eq!(verify_subscription(None, None, None, "s3cret"), None);
    }

    #[test]
    fn signed_state_verifies_and_rejects_tampering() {
        let now = Utc::now();
        let state = OAuthState::new("org_a", "user_1", Some(ChannelType::Instagram), 600, now);
        let token = sign_state(&state, "k1");
        assert_eq!(verify_state(&token, "k1", now), Ok(state));
        assert_eq!(
            verify_state(&token, "other-key", now),
            Err(StateError::BadSignature)
        );

        let (_, sig) = token.split_once('.').unwrap();
        let forged_body = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({
                "tenantId": "org_victim", "userId": "u", "nonce": "n", "exp": i64::MAX
            }))
            .unwrap(),
        );
        assert_eq!(
            verify_state(&format!("{forged_body}.{sig}"), "k1", now),
            Err(StateError::BadSignature)
        );
        assert_eq!(verify_state("not-a-state", "k1", now), Err(StateError::Malformed));
    }

    #[test]
    fn signed_state_expires() {
        let issued = Utc::now();
        let state = OAuthState::new("org_a", "user_1", None, 60, issued);
        let token = sign_state(&state, "k1");
        let later = issued + chrono::Duration::seconds(61);
        assert_eq!(verify_state(&token, "k1", later), Err(StateError::Expired));
    }

    #[test]
    fn authorization_url_embeds_identity_but_not_secret() {
        let url = build_authorization_url(
            "https://www.facebook.com/v21.0/dialog/oauth",
            "app-123",
            "https://relay.example.com/auth/callback",
            "st.sig",
            Some(ChannelType::Messenger),
        );
        assert!(url.starts_with("https://www.facebook.com/v21.0/dialog/oauth?client_id=app-123"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Frelay.example.com%2Fauth%2Fcallback"));
        assert!(url.contains("state=st.sig"));
        assert!(url.contains("pages_messaging"));
        assert!(!url.contains("whatsapp_business_messaging"));
        assert!(!url.contains("client_secret"));
    }

    #[test]
    fn union_scopes_are_deduplicated() {
        let scopes = scopes_for(None);
        assert_eq!(
            scopes.iter().filter(|s| **s == "pages_show_list").count(),
            1
        );
        assert!(scopes.contains(&"instagram_manage_messages"));
        assert!(scopes.contains(&"whatsapp_business_messaging"));
    }

    #[test]
    fn payload_signature_round_trips_through_header_format() {
        let body = br#"{"object":"page"}"#;
        let header = format!("sha256={}", sign_payload_hex("app-secret", body));
        assert!(verify_payload_signature("app-secret", Some(&header), body));
        assert!(!verify_payload_signature("other", Some(&header), body));
        assert!(!verify_payload_signature("app-secret", None, body));
        assert!(!verify_payload_signature("app-secret", Some("sha256=zz"), body));
    }

    #[test]
    fn instagram_target_prefers_linked_page() {
        let linked = integration(
            ChannelType::Instagram,
            "17841400",
            ExtraConfig::Instagram {
                page_id: "page-9".to_string(),
            },
        );
        assert_eq!(
            resolve_send_target(&linked),
            Ok(SendTarget::Page {
                page_id: "page-9".to_string()
            })
        );
        let unlinked = integration(ChannelType::Instagram, "17841400", ExtraConfig::None);
        assert_eq!(
            resolve_send_target(&unlinked),
            Ok(SendTarget::Page {
                page_id: "17841400".to_string()
            })
        );
    }

    #[test]
    fn send_target_errors_are_specific() {
        let mut no_token = integration(ChannelType::Messenger, "p1", ExtraConfig::None);
        no_token.access_token.clear();
        assert_eq!(resolve_send_target(&no_token), Err(TargetError::MissingToken));

        let wa = integration(ChannelType::Whatsapp, "waba-1", ExtraConfig::None);
        assert_eq!(
            resolve_send_target(&wa),
            Err(TargetError::MissingPhoneNumberId)
        );

        let root = integration(ChannelType::FacebookRoot, "fb-user", ExtraConfig::None);
        assert_eq!(
            resolve_send_target(&root),
            Err(TargetError::Unsupported(ChannelType::FacebookRoot))
        );
    }

    #[test]
    fn retry_delay_stays_within_jitter() {
        assert_eq!(retry_delay_with_jitter(0), Duration::ZERO);
        for _ in 0..50 {
            assert!(retry_delay_with_jitter(40) <= Duration::from_millis(40));
        }
    }
}
