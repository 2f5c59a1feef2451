use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Instagram,
    Messenger,
    Whatsapp,
    FacebookRoot,
}

impl ChannelType {
    /// Channels a tenant can connect, send on, or disconnect directly.
    pub const USER_FACING: [ChannelType; 3] = [
        ChannelType::Instagram,
        ChannelType::Messenger,
        ChannelType::Whatsapp,
    ];

    /// Channels that borrow their credential from the tenant's `facebook_root` row.
    pub const PAGE_BACKED: [ChannelType; 2] = [ChannelType::Instagram, ChannelType::Messenger];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Instagram => "instagram",
            ChannelType::Messenger => "messenger",
            ChannelType::Whatsapp => "whatsapp",
            ChannelType::FacebookRoot => "facebook_root",
        }
    }

    pub fn is_page_backed(&self) -> bool {
        Self::PAGE_BACKED.contains(self)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized value: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for ChannelType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instagram" => Ok(ChannelType::Instagram),
            "messenger" => Ok(ChannelType::Messenger),
            "whatsapp" => Ok(ChannelType::Whatsapp),
            "facebook_root" => Ok(ChannelType::FacebookRoot),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Active,
    Revoked,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Active => "active",
            IntegrationStatus::Revoked => "revoked",
        }
    }
}

impl FromStr for IntegrationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(IntegrationStatus::Active),
            "revoked" => Ok(IntegrationStatus::Revoked),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Platform an inbound webhook claims to come from, derived from its `object` field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookPlatform {
    Messenger,
    Instagram,
    Whatsapp,
    Unknown,
}

impl WebhookPlatform {
    pub fn channel(&self) -> Option<ChannelType> {
        match self {
            WebhookPlatform::Messenger => Some(ChannelType::Messenger),
            WebhookPlatform::Instagram => Some(ChannelType::Instagram),
            WebhookPlatform::Whatsapp => Some(ChannelType::Whatsapp),
            WebhookPlatform::Unknown => None,
        }
    }
}

/// Channel-specific settings stored next to an integration's credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtraConfig {
    #[default]
    None,
    Instagram {
        page_id: String,
    },
    Whatsapp {
        phone_number_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Integration {
    pub id: String,
    pub tenant_id: String,
    pub channel_type: ChannelType,
    pub external_account_id: String,
    #[serde(skip_serializing, default)]
    pub access_token: String,
    pub status: IntegrationStatus,
    #[serde(default)]
    pub extra_config: ExtraConfig,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub tenant_id: String,
    pub channel_type: ChannelType,
    pub external_account_id: String,
    pub access_token: String,
    pub extra_config: ExtraConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Faq {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkingHours {
    pub timezone: String,
    #[serde(default)]
    pub schedule: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AntiSpam {
    pub max_messages_per_minute: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u32>,
}

/// Per-tenant bot behaviour. Owned by the dashboard, read by the webhook dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faqs: Vec<Faq>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_hours: Option<WorkingHours>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_spam: Option<AntiSpam>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantContext {
    pub organization_id: String,
    pub integration_type: ChannelType,
    pub ai_config: AiConfig,
}

/// Body POSTed to the automation engine for every inbound webhook event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardPayload {
    pub raw_body: Value,
    pub platform: WebhookPlatform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TenantContext>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Text(String),
    Structured { text: String },
}

impl OutboundMessage {
    pub fn text(&self) -> &str {
        match self {
            OutboundMessage::Text(text) => text,
            OutboundMessage::Structured { text } => text,
        }
    }
}

/// Request from the automation engine to the send gateway. Fields stay optional so
/// that a missing one is reported as a validation error instead of a decode failure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default, alias = "tenantId")]
    pub org_id: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub message: Option<OutboundMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisconnectRequest {
    pub platform: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectAccountRequest {
    pub platform: String,
    pub account_id: String,
    #[serde(default)]
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectableAccount {
    pub page_id: String,
    pub page_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instagram_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instagram_username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_type_rejects_unknown_values() {
        assert_eq!("whatsapp".parse::<ChannelType>(), Ok(ChannelType::Whatsapp));
        assert!("telegram".parse::<ChannelType>().is_err());
        assert!("Instagram".parse::<ChannelType>().is_err());
    }

    #[test]
    fn default_ai_config_serializes_to_inactive_shape() {
        let value = serde_json::to_value(AiConfig::default()).unwrap();
        assert_eq!(value, json!({"isActive": false}));
    }

    #[test]
    fn extra_config_is_tagged_by_channel() {
        let value = serde_json::to_value(ExtraConfig::Instagram {
            page_id: "p1".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"kind": "instagram", "page_id": "p1"}));
        let none: ExtraConfig = serde_json::from_value(json!({"kind": "none"})).unwrap();
        assert_eq!(none, ExtraConfig::None);
    }

    #[test]
    fn integration_never_serializes_access_token() {
        let integration = Integration {
            id: "int_1".to_string(),
            tenant_id: "org_a".to_string(),
            channel_type: ChannelType::Messenger,
            external_account_id: "page-1".to_string(),
            access_token: "secret".to_string(),
            status: IntegrationStatus::Active,
            extra_config: ExtraConfig::None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let text = serde_json::to_string(&integration).unwrap();
        assert!(!text.contains("secret"));
    }

    #[test]
    fn send_request_accepts_plain_and_structured_messages() {
        let plain: SendRequest = serde_json::from_value(json!({
            "platform": "messenger", "orgId": "org_a", "recipientId": "u1", "message": "hi"
        }))
        .unwrap();
        assert_eq!(plain.message.unwrap().text(), "hi");

        let structured: SendRequest = serde_json::from_value(json!({
            "platform": "instagram", "tenantId": "org_a", "recipientId": "u1",
            "message": {"text": "hello"}
        }))
        .unwrap();
        assert_eq!(structured.org_id.as_deref(), Some("org_a"));
        assert_eq!(structured.message.unwrap().text(), "hello");
    }
}
