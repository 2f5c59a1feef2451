use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub meta: Meta,
    #[serde(default)]
    pub oauth: OAuth,
    #[serde(default)]
    pub auth: Auth,
    pub internal: Internal,
    #[serde(default)]
    pub forward: Forward,
    #[serde(default)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

/// Meta app identity and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub app_id: String,
    pub app_secret: String,
    pub redirect_uri: String,
    pub verify_token: String,
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    #[serde(default = "default_dialog_url")]
    pub dialog_url: String,
    #[serde(default)]
    pub verify_payload_signature: bool,
    /// Webhook bodies larger than this are acknowledged and dropped.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth {
    #[serde(default)]
    pub state_secret: Option<String>,
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,
    #[serde(default = "default_success_redirect")]
    pub success_redirect: String,
    #[serde(default = "default_error_redirect")]
    pub error_redirect: String,
}

impl Default for OAuth {
    fn default() -> Self {
        Self {
            state_secret: None,
            state_ttl_secs: default_state_ttl_secs(),
            success_redirect: default_success_redirect(),
            error_redirect: default_error_redirect(),
        }
    }
}

/// Headers set by the identity gateway in front of the dashboard routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            tenant_header: default_tenant_header(),
            user_header: default_user_header(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Internal {
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forward {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_forward_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_forward_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_forward_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for Forward {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_forward_timeout_ms(),
            max_attempts: default_forward_max_attempts(),
            jitter_ms: default_forward_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Audit {
    #[serde(default)]
    pub jsonl_path: Option<String>,
}

impl Config {
    /// Key used to sign OAuth state; falls back to the app secret.
    pub fn state_secret(&self) -> &str {
        match self.oauth.state_secret.as_deref() {
            Some(secret) if !secret.is_empty() => secret,
            _ => &self.meta.app_secret,
        }
    }
}

fn default_graph_base_url() -> String {
    "https://graph.facebook.com/v21.0".to_string()
}

fn default_dialog_url() -> String {
    "https://www.facebook.com/v21.0/dialog/oauth".to_string()
}

fn default_max_payload_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_state_ttl_secs() -> u64 {
    600
}

fn default_success_redirect() -> String {
    "/integrations?success=connected".to_string()
}

fn default_error_redirect() -> String {
    "/integrations".to_string()
}

fn default_tenant_header() -> String {
    "x-organization-id".to_string()
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

fn default_forward_timeout_ms() -> u64 {
    10_000
}

fn default_forward_max_attempts() -> usize {
    2
}

fn default_forward_jitter_ms() -> u64 {
    250
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    load_with_env(path, |key| std::env::var(key).ok())
}

/// Loads the file, validates it, then applies environment overrides through `lookup`.
pub fn load_with_env<F>(path: &str, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let mut cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    apply_env_overrides(&mut cfg, lookup)?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

pub fn apply_env_overrides<F>(cfg: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("LISTEN_ADDR") {
        cfg.server.listen_addr = v;
    }
    if let Some(v) = get("META_APP_ID") {
        cfg.meta.app_id = v;
    }
    if let Some(v) = get("META_APP_SECRET") {
        cfg.meta.app_secret = v;
    }
    if let Some(v) = get("META_REDIRECT_URI") {
        cfg.meta.redirect_uri = v;
    }
    if let Some(v) = get("META_VERIFY_TOKEN") {
        cfg.meta.verify_token = v;
    }
    if let Some(v) = get("OAUTH_STATE_SECRET") {
        cfg.oauth.state_secret = Some(v);
    }
    if let Some(v) = get("INTERNAL_API_SECRET") {
        cfg.internal.api_secret = v;
    }
    if let Some(v) = get("AUTOMATION_WEBHOOK_URL") {
        cfg.forward.url = Some(v);
    }
    if let Some(v) = get("DATABASE_URL") {
        cfg.store.kind = "sqlite".to_string();
        cfg.store.sqlite_path = Some(sqlite_path_from_url(&v)?);
    }
    Ok(())
}

/// Accepts `sqlite://<path>`, `sqlite:<path>` or a bare file path.
fn sqlite_path_from_url(url: &str) -> Result<String, ConfigError> {
    let url = url.trim();
    let path = if let Some(rest) = url.strip_prefix("sqlite://") {
        rest
    } else if let Some(rest) = url.strip_prefix("sqlite:") {
        rest
    } else if let Some((scheme, _)) = url.split_once("://") {
        return Err(ConfigError::UnsupportedConfig(format!(
            "DATABASE_URL scheme {scheme}:// is not supported; use sqlite://<path> or a file path"
        )));
    } else {
        url
    };
    if path.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "DATABASE_URL does not name a sqlite file".to_string(),
        ));
    }
    Ok(path.to_string())
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.meta.verify_token.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "meta.verify_token must not be empty".to_string(),
        ));
    }
    if cfg.internal.api_secret.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "internal.api_secret must not be empty".to_string(),
        ));
    }
    if cfg.state_secret().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "oauth.state_secret or meta.app_secret is required to sign OAuth state".to_string(),
        ));
    }
    if cfg.meta.max_payload_bytes == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "meta.max_payload_bytes must be >= 1".to_string(),
        ));
    }
    if cfg.oauth.state_ttl_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "oauth.state_ttl_secs must be >= 1".to_string(),
        ));
    }
    if cfg.forward.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "forward.timeout_ms must be >= 1".to_string(),
        ));
    }
    if !(1..=2).contains(&cfg.forward.max_attempts) {
        return Err(ConfigError::UnsupportedConfig(
            "forward.max_attempts must be 1 or 2".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("relay-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

meta:
  app_id: "app-123"
  app_secret: "app-secret"
  redirect_uri: "https://relay.example.com/auth/callback"
  verify_token: "verify-me"

internal:
  api_secret: "internal-secret"

forward:
  url: "https://automation.example.com/hook"
"#
        .to_string()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn fills_defaults_for_optional_sections() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_with_env(&path, no_env).expect("base config should be accepted");
        assert_eq!(cfg.forward.max_attempts, 2);
        assert_eq!(cfg.oauth.state_ttl_secs, 600);
        assert_eq!(cfg.auth.tenant_header, "x-organization-id");
        assert_eq!(cfg.state_secret(), "app-secret");
        assert!(!cfg.meta.verify_payload_signature);
        assert_eq!(cfg.meta.max_payload_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_with_env(&path, no_env).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_with_env(&path, no_env).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let path = write_temp_config(&base_yaml());
        let env: HashMap<&str, &str> = HashMap::from([
            ("META_APP_SECRET", "from-env"),
            ("INTERNAL_API_SECRET", "env-internal"),
            ("AUTOMATION_WEBHOOK_URL", "http://n8n.local/webhook"),
            ("DATABASE_URL", "sqlite://./relay.db"),
        ]);
        let cfg = load_with_env(&path, |key| env.get(key).map(|v| v.to_string()))
            .expect("config with env overrides");
        assert_eq!(cfg.meta.app_secret, "from-env");
        assert_eq!(cfg.internal.api_secret, "env-internal");
        assert_eq!(cfg.forward.url.as_deref(), Some("http://n8n.local/webhook"));
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./relay.db"));
    }

    #[test]
    fn database_url_accepts_only_sqlite_locations() {
        let path = write_temp_config(&base_yaml());
        let bare = load_with_env(&path, |key| {
            (key == "DATABASE_URL").then(|| "/var/lib/relay/relay.db".to_string())
        })
        .expect("bare path is a sqlite file");
        assert_eq!(bare.store.sqlite_path.as_deref(), Some("/var/lib/relay/relay.db"));

        let err = load_with_env(&path, |key| {
            (key == "DATABASE_URL").then(|| "postgres://relay:pw@db/relay".to_string())
        })
        .expect_err("non-sqlite scheme must be rejected");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));

        let err = load_with_env(&path, |key| {
            (key == "DATABASE_URL").then(|| "sqlite://".to_string())
        })
        .expect_err("empty sqlite path must be rejected");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_more_than_one_forward_retry() {
        let path = write_temp_config(
            &base_yaml().replace(
                "url: \"https://automation.example.com/hook\"",
                "url: \"https://automation.example.com/hook\"\n  max_attempts: 5",
            ),
        );
        let err = load_with_env(&path, no_env).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        let path = write_temp_config(&format!("{}\nbilling:\n  enabled: true\n", base_yaml()));
        let err = load_with_env(&path, no_env).expect_err("expected schema failure");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }

    #[test]
    fn rejects_empty_internal_secret() {
        let path = write_temp_config(
            &base_yaml().replace("api_secret: \"internal-secret\"", "api_secret: \"\""),
        );
        let err = load_with_env(&path, no_env).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }
}
