use std::sync::Arc;

use chrono::Utc;
use relay_contracts::ChannelType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Connected,
    ChannelSelected,
    Disconnected,
    Revoked,
}

#[derive(Serialize, Deserialize, Clone)]
struct AuditRecord {
    audit_id: String,
    tenant_id: String,
    channel: ChannelType,
    event: LifecycleEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor: Option<String>,
    ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    record_hash: String,
}

/// Append-only, hash-chained record of integration lifecycle changes.
/// Disabled when no path is configured.
pub struct AuditLog {
    file: Option<Mutex<tokio::fs::File>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

impl AuditLog {
    pub async fn open(path: Option<&str>) -> Result<Self, String> {
        let Some(path) = path.filter(|p| !p.trim().is_empty()) else {
            return Ok(Self {
                file: None,
                last_hash: Arc::new(Mutex::new(None)),
            });
        };

        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            file: Some(Mutex::new(file)),
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    pub async fn record(
        &self,
        tenant_id: &str,
        channel: ChannelType,
        event: LifecycleEvent,
        external_account_id: Option<&str>,
        actor: Option<&str>,
    ) {
        let Some(file) = &self.file else {
            return;
        };

        let mut last_hash = self.last_hash.lock().await;
        let mut rec = AuditRecord {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            tenant_id: tenant_id.to_string(),
            channel,
            event,
            external_account_id: external_account_id.map(|v| v.to_string()),
            actor: actor.filter(|v| !v.is_empty()).map(|v| v.to_string()),
            ts: Utc::now().to_rfc3339(),
            prev_hash: last_hash.clone(),
            record_hash: String::new(),
        };
        if let Ok(seed) = serde_json::to_string(&rec) {
            rec.record_hash = hash_hex(seed.as_bytes());
        }

        let line = match serde_json::to_string(&rec) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "audit record serialization failed");
                return;
            }
        };
        let mut file = file.lock().await;
        if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
            warn!(error = %e, "audit append failed");
            return;
        }
        if let Err(e) = file.flush().await {
            warn!(error = %e, "audit flush failed");
        }
        *last_hash = Some(rec.record_hash);
    }
}

fn hash_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut seeded = rec.clone();
        seeded.record_hash.clear();
        let seed = serde_json::to_string(&seeded)
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        let expected_hash = hash_hex(seed.as_bytes());
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}
