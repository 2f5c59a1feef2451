use std::time::Duration;

use relay_config::Meta;
use relay_kernel::SendTarget;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

const GRAPH_TIMEOUT: Duration = Duration::from_secs(15);

/// Graph error code for an expired or revoked access token.
const INVALID_TOKEN_CODE: i64 = 190;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph request failed: {0}")]
    Transport(String),
    #[error("graph api error: {message}")]
    Api {
        message: String,
        kind: Option<String>,
        code: Option<i64>,
        raw: Value,
    },
    #[error("graph response could not be decoded: {0}")]
    Decode(String),
}

impl GraphError {
    pub fn is_invalid_token(&self) -> bool {
        matches!(self, GraphError::Api { code: Some(INVALID_TOKEN_CODE), .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Seconds until expiry; absent for tokens that do not expire.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphUser {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsappPhoneNumber {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstagramBusinessAccount {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphPage {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub access_token: String,
    #[serde(default)]
    pub instagram_business_account: Option<InstagramBusinessAccount>,
}

#[derive(Deserialize)]
struct DataList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

/// Thin client for the Meta OAuth and Graph endpoints.
pub struct GraphClient {
    client: Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    redirect_uri: String,
}

impl GraphClient {
    pub fn new(meta: &Meta) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(GRAPH_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            base_url: meta.graph_base_url.trim_end_matches('/').to_string(),
            app_id: meta.app_id.clone(),
            app_secret: meta.app_secret.clone(),
            redirect_uri: meta.redirect_uri.clone(),
        })
    }

    pub async fn exchange_code_for_token(&self, code: &str) -> Result<TokenResponse, GraphError> {
        let response = self
            .client
            .get(format!("{}/oauth/access_token", self.base_url))
            .query(&[
                ("client_id", self.app_id.as_str()),
                ("client_secret", self.app_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("code", code),
            ])
            .send()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;
        read_graph_json(response).await
    }

    pub async fn upgrade_to_long_lived_token(
        &self,
        short_lived_token: &str,
    ) -> Result<TokenResponse, GraphError> {
        let response = self
            .client
            .get(format!("{}/oauth/access_token", self.base_url))
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.app_id.as_str()),
                ("client_secret", self.app_secret.as_str()),
                ("fb_exchange_token", short_lived_token),
            ])
            .send()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;
        read_graph_json(response).await
    }

    pub async fn fetch_me(&self, access_token: &str) -> Result<GraphUser, GraphError> {
        let response = self
            .client
            .get(format!("{}/me", self.base_url))
            .query(&[("fields", "id")])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;
        read_graph_json(response).await
    }

    pub async fn list_pages(&self, access_token: &str) -> Result<Vec<GraphPage>, GraphError> {
        let response = self
            .client
            .get(format!("{}/me/accounts", self.base_url))
            .query(&[(
                "fields",
                "id,name,access_token,instagram_business_account{id,username}",
            )])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;
        let pages: DataList<GraphPage> = read_graph_json(response).await?;
        Ok(pages.data)
    }

    /// Phone numbers of a WhatsApp Business Account. Graph only answers when the
    /// token's user has access to that account.
    pub async fn list_phone_numbers(
        &self,
        waba_id: &str,
        access_token: &str,
    ) -> Result<Vec<WhatsappPhoneNumber>, GraphError> {
        let response = self
            .client
            .get(format!("{}/{}/phone_numbers", self.base_url, waba_id))
            .query(&[("fields", "id")])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;
        let numbers: DataList<WhatsappPhoneNumber> = read_graph_json(response).await?;
        Ok(numbers.data)
    }

    /// Subscribes the app to a page's messaging webhooks.
    pub async fn subscribe_page(&self, page_id: &str, page_token: &str) -> Result<(), GraphError> {
        let response = self
            .client
            .post(format!("{}/{}/subscribed_apps", self.base_url, page_id))
            .query(&[("subscribed_fields", "messages,messaging_postbacks")])
            .bearer_auth(page_token)
            .send()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;
        let _: Value = read_graph_json(response).await?;
        Ok(())
    }

    pub async fn send_message(
        &self,
        target: &SendTarget,
        access_token: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<Value, GraphError> {
        let (url, body) = match target {
            SendTarget::Page { page_id } => (
                format!("{}/{}/messages", self.base_url, page_id),
                json!({
                    "recipient": {"id": recipient_id},
                    "message": {"text": text},
                    "messaging_type": "RESPONSE"
                }),
            ),
            SendTarget::Whatsapp { phone_number_id } => (
                format!("{}/{}/messages", self.base_url, phone_number_id),
                json!({
                    "messaging_product": "whatsapp",
                    "to": recipient_id,
                    "type": "text",
                    "text": {"body": text}
                }),
            ),
        };
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;
        read_graph_json(response).await
    }
}

async fn read_graph_json<T: DeserializeOwned>(response: Response) -> Result<T, GraphError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| GraphError::Transport(e.to_string()))?;
    let value: Value = serde_json::from_str(&text).map_err(|e| {
        if status.is_success() {
            GraphError::Decode(e.to_string())
        } else {
            GraphError::Api {
                message: format!("http {status}"),
                kind: None,
                code: None,
                raw: Value::String(text.clone()),
            }
        }
    })?;

    if let Some(error) = value.get("error") {
        return Err(GraphError::Api {
            message: error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown graph error")
                .to_string(),
            kind: error
                .get("type")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string()),
            code: error.get("code").and_then(|v| v.as_i64()),
            raw: error.clone(),
        });
    }
    if !status.is_success() {
        return Err(GraphError::Api {
            message: format!("http {status}"),
            kind: None,
            code: None,
            raw: value,
        });
    }
    serde_json::from_value(value).map_err(|e| GraphError::Decode(e.to_string()))
}
