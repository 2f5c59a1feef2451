use std::collections::HashMap;

use chrono::Utc;
use relay_contracts::{
    AiConfig, ChannelType, ExtraConfig, Integration, IntegrationStatus, NewIntegration,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Conflict(String),
    #[error("store failure: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    integrations: HashMap<(String, ChannelType), Integration>,
    ai_configs: HashMap<String, AiConfig>,
}

pub struct SqliteStore {
    conn: Connection,
}

/// Credential store shared by every request handler.
pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn open(kind: &str, sqlite_path: Option<&str>) -> Result<Self, StoreError> {
        match (kind, sqlite_path) {
            ("sqlite", Some(path)) => Ok(StoreBackend::Sqlite(SqliteStore::new(path)?)),
            ("sqlite", None) => Err(StoreError::Backend(
                "store.sqlite_path is required for sqlite store".to_string(),
            )),
            _ => Ok(StoreBackend::Memory(MemoryStore::default())),
        }
    }

    /// Inserts or refreshes the tenant's row for `channel_type`. An external account
    /// that already belongs to another tenant is rejected with `Conflict`.
    pub fn upsert_integration(&mut self, new: NewIntegration) -> Result<Integration, StoreError> {
        match self {
            StoreBackend::Memory(store) => store.upsert_integration(new),
            StoreBackend::Sqlite(store) => store.upsert_integration(new),
        }
    }

    /// Channel-agnostic lookup used for webhook routing. `facebook_root` rows never match.
    pub fn find_by_external_id(
        &self,
        external_account_id: &str,
        preferred: Option<ChannelType>,
    ) -> Result<Option<Integration>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.find_by_external_id(external_account_id, preferred)),
            StoreBackend::Sqlite(store) => store.find_by_external_id(external_account_id, preferred),
        }
    }

    pub fn get_integration(
        &self,
        tenant_id: &str,
        channel: ChannelType,
    ) -> Result<Option<Integration>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.get_integration(tenant_id, channel)),
            StoreBackend::Sqlite(store) => store.get_integration(tenant_id, channel),
        }
    }

    pub fn list_integrations(&self, tenant_id: &str) -> Result<Vec<Integration>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.list_integrations(tenant_id)),
            StoreBackend::Sqlite(store) => store.list_integrations(tenant_id),
        }
    }

    pub fn delete_integration(
        &mut self,
        tenant_id: &str,
        channel: ChannelType,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.delete_integration(tenant_id, channel)),
            StoreBackend::Sqlite(store) => store.delete_integration(tenant_id, channel),
        }
    }

    pub fn count_channels(
        &self,
        tenant_id: &str,
        channels: &[ChannelType],
    ) -> Result<usize, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.count_channels(tenant_id, channels)),
            StoreBackend::Sqlite(store) => store.count_channels(tenant_id, channels),
        }
    }

    pub fn set_status(
        &mut self,
        tenant_id: &str,
        channel: ChannelType,
        status: IntegrationStatus,
    ) -> Result<bool, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.set_status(tenant_id, channel, status)),
            StoreBackend::Sqlite(store) => store.set_status(tenant_id, channel, status),
        }
    }

    pub fn get_ai_config(&self, tenant_id: &str) -> Result<Option<AiConfig>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.get_ai_config(tenant_id)),
            StoreBackend::Sqlite(store) => store.get_ai_config(tenant_id),
        }
    }

    pub fn put_ai_config(&mut self, tenant_id: &str, config: &AiConfig) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                store.put_ai_config(tenant_id, config);
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put_ai_config(tenant_id, config),
        }
    }
}

impl MemoryStore {
    fn key(tenant_id: &str, channel: ChannelType) -> (String, ChannelType) {
        (tenant_id.to_string(), channel)
    }

    fn upsert_integration(&mut self, new: NewIntegration) -> Result<Integration, StoreError> {
        if self.integrations.values().any(|i| {
            i.channel_type == new.channel_type
                && i.external_account_id == new.external_account_id
                && i.tenant_id != new.tenant_id
        }) {
            return Err(conflict(&new));
        }

        let now = Utc::now().to_rfc3339();
        let row = self
            .integrations
            .entry(Self::key(&new.tenant_id, new.channel_type))
            .and_modify(|row| {
                row.external_account_id = new.external_account_id.clone();
                row.access_token = new.access_token.clone();
                row.extra_config = new.extra_config.clone();
                row.status = IntegrationStatus::Active;
                row.updated_at = now.clone();
            })
            .or_insert_with(|| Integration {
                id: new_integration_id(),
                tenant_id: new.tenant_id.clone(),
                channel_type: new.channel_type,
                external_account_id: new.external_account_id.clone(),
                access_token: new.access_token.clone(),
                status: IntegrationStatus::Active,
                extra_config: new.extra_config.clone(),
                created_at: now.clone(),
                updated_at: now.clone(),
            });
        Ok(row.clone())
    }

    fn find_by_external_id(
        &self,
        external_account_id: &str,
        preferred: Option<ChannelType>,
    ) -> Option<Integration> {
        self.integrations
            .values()
            .filter(|i| {
                i.channel_type != ChannelType::FacebookRoot
                    && i.external_account_id == external_account_id
            })
            .max_by(|a, b| {
                let a_pref = Some(a.channel_type) == preferred;
                let b_pref = Some(b.channel_type) == preferred;
                a_pref
                    .cmp(&b_pref)
                    .then_with(|| a.updated_at.cmp(&b.updated_at))
            })
            .cloned()
    }

    fn get_integration(&self, tenant_id: &str, channel: ChannelType) -> Option<Integration> {
        self.integrations.get(&Self::key(tenant_id, channel)).cloned()
    }

    fn list_integrations(&self, tenant_id: &str) -> Vec<Integration> {
        let mut rows: Vec<Integration> = self
            .integrations
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.channel_type.as_str().cmp(b.channel_type.as_str()));
        rows
    }

    fn delete_integration(&mut self, tenant_id: &str, channel: ChannelType) -> bool {
        self.integrations
            .remove(&Self::key(tenant_id, channel))
            .is_some()
    }

    fn count_channels(&self, tenant_id: &str, channels: &[ChannelType]) -> usize {
        channels
            .iter()
            .filter(|c| self.integrations.contains_key(&Self::key(tenant_id, **c)))
            .count()
    }

    fn set_status(&mut self, tenant_id: &str, channel: ChannelType, status: IntegrationStatus) -> bool {
        match self.integrations.get_mut(&Self::key(tenant_id, channel)) {
            Some(row) => {
                row.status = status;
                row.updated_at = Utc::now().to_rfc3339();
                true
            }
            None => false,
        }
    }

    fn get_ai_config(&self, tenant_id: &str) -> Option<AiConfig> {
        self.ai_configs.get(tenant_id).cloned()
    }

    fn put_ai_config(&mut self, tenant_id: &str, config: &AiConfig) {
        self.ai_configs
            .insert(tenant_id.to_string(), config.clone());
    }
}

const INTEGRATION_COLUMNS: &str = "id, tenant_id, channel_type, external_account_id, access_token, status, extra_config, created_at, updated_at";

impl SqliteStore {
    fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS integrations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                external_account_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                status TEXT NOT NULL,
                extra_config TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, channel_type),
                UNIQUE (channel_type, external_account_id)
            );
            CREATE INDEX IF NOT EXISTS integrations_external_account
                ON integrations (external_account_id);
            CREATE TABLE IF NOT EXISTS ai_configs (
                tenant_id TEXT PRIMARY KEY,
                config_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }

    fn upsert_integration(&mut self, new: NewIntegration) -> Result<Integration, StoreError> {
        let owner: Option<String> = self
            .conn
            .query_row(
                "SELECT tenant_id FROM integrations
                 WHERE channel_type = ?1 AND external_account_id = ?2 AND tenant_id != ?3",
                params![
                    new.channel_type.as_str(),
                    new.external_account_id,
                    new.tenant_id
                ],
                |row| row.get(0),
            )
            .optional()?;
        if owner.is_some() {
            return Err(conflict(&new));
        }

        let now = Utc::now().to_rfc3339();
        let extra = serde_json::to_string(&new.extra_config)?;
        self.conn.execute(
            "
            INSERT INTO integrations
            (id, tenant_id, channel_type, external_account_id, access_token, status, extra_config, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?7)
            ON CONFLICT(tenant_id, channel_type) DO UPDATE SET
                external_account_id=excluded.external_account_id,
                access_token=excluded.access_token,
                status='active',
                extra_config=excluded.extra_config,
                updated_at=excluded.updated_at
            ",
            params![
                new_integration_id(),
                new.tenant_id,
                new.channel_type.as_str(),
                new.external_account_id,
                new.access_token,
                extra,
                now
            ],
        )?;

        self.get_integration(&new.tenant_id, new.channel_type)?
            .ok_or_else(|| StoreError::Backend("upserted integration not found".to_string()))
    }

    fn find_by_external_id(
        &self,
        external_account_id: &str,
        preferred: Option<ChannelType>,
    ) -> Result<Option<Integration>, StoreError> {
        let sql = format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations
             WHERE external_account_id = ?1 AND channel_type != 'facebook_root'
             ORDER BY CASE WHEN channel_type = ?2 THEN 0 ELSE 1 END, updated_at DESC
             LIMIT 1"
        );
        let preferred = preferred.map(|c| c.as_str()).unwrap_or("");
        Ok(self
            .conn
            .query_row(&sql, params![external_account_id, preferred], integration_from_row)
            .optional()?)
    }

    fn get_integration(
        &self,
        tenant_id: &str,
        channel: ChannelType,
    ) -> Result<Option<Integration>, StoreError> {
        let sql = format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE tenant_id = ?1 AND channel_type = ?2"
        );
        Ok(self
            .conn
            .query_row(&sql, params![tenant_id, channel.as_str()], integration_from_row)
            .optional()?)
    }

    fn list_integrations(&self, tenant_id: &str) -> Result<Vec<Integration>, StoreError> {
        let sql = format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE tenant_id = ?1 ORDER BY channel_type"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![tenant_id], integration_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete_integration(&mut self, tenant_id: &str, channel: ChannelType) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "DELETE FROM integrations WHERE tenant_id = ?1 AND channel_type = ?2",
            params![tenant_id, channel.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn count_channels(&self, tenant_id: &str, channels: &[ChannelType]) -> Result<usize, StoreError> {
        let mut count = 0;
        for channel in channels {
            let present: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM integrations WHERE tenant_id = ?1 AND channel_type = ?2",
                    params![tenant_id, channel.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if present.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn set_status(
        &mut self,
        tenant_id: &str,
        channel: ChannelType,
        status: IntegrationStatus,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE integrations SET status = ?3, updated_at = ?4
             WHERE tenant_id = ?1 AND channel_type = ?2",
            params![
                tenant_id,
                channel.as_str(),
                status.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(changed > 0)
    }

    fn get_ai_config(&self, tenant_id: &str) -> Result<Option<AiConfig>, StoreError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT config_json FROM ai_configs WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    fn put_ai_config(&mut self, tenant_id: &str, config: &AiConfig) -> Result<(), StoreError> {
        let json = serde_json::to_string(config)?;
        self.conn.execute(
            "
            INSERT INTO ai_configs (tenant_id, config_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(tenant_id) DO UPDATE SET
                config_json=excluded.config_json,
                updated_at=excluded.updated_at
            ",
            params![tenant_id, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn integration_from_row(row: &Row<'_>) -> rusqlite::Result<Integration> {
    let channel: String = row.get(2)?;
    let status: String = row.get(5)?;
    let extra: String = row.get(6)?;
    Ok(Integration {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        channel_type: channel
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        external_account_id: row.get(3)?,
        access_token: row.get(4)?,
        status: status
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        extra_config: serde_json::from_str::<ExtraConfig>(&extra)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn conflict(new: &NewIntegration) -> StoreError {
    StoreError::Conflict(format!(
        "{} account {} is already linked to another organization",
        new.channel_type, new.external_account_id
    ))
}

fn new_integration_id() -> String {
    format!("int_{}", uuid::Uuid::new_v4().as_simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        std::env::temp_dir()
            .join(format!("relay-store-{}.db", uuid::Uuid::new_v4().as_simple()))
            .to_string_lossy()
            .to_string()
    }

    fn backends() -> Vec<StoreBackend> {
        vec![
            StoreBackend::open("memory", None).unwrap(),
            StoreBackend::open("sqlite", Some(&temp_db())).unwrap(),
        ]
    }

    fn new_row(tenant: &str, channel: ChannelType, external: &str) -> NewIntegration {
        NewIntegration {
            tenant_id: tenant.to_string(),
            channel_type: channel,
            external_account_id: external.to_string(),
            access_token: format!("token-{tenant}"),
            extra_config: ExtraConfig::None,
        }
    }

    #[test]
    fn same_external_account_cannot_belong_to_two_tenants() {
        for mut store in backends() {
            store
                .upsert_integration(new_row("org_a", ChannelType::Messenger, "page-1"))
                .unwrap();
            let err = store
                .upsert_integration(new_row("org_b", ChannelType::Messenger, "page-1"))
                .expect_err("duplicate external account must be rejected");
            assert!(matches!(err, StoreError::Conflict(_)));
            let owner = store.find_by_external_id("page-1", None).unwrap().unwrap();
            assert_eq!(owner.tenant_id, "org_a");
        }
    }

    #[test]
    fn upsert_overwrites_token_without_duplicating() {
        for mut store in backends() {
            let first = store
                .upsert_integration(new_row("org_a", ChannelType::FacebookRoot, "fb-1"))
                .unwrap();
            let mut refreshed = new_row("org_a", ChannelType::FacebookRoot, "fb-1");
            refreshed.access_token = "rotated".to_string();
            let second = store.upsert_integration(refreshed).unwrap();
            assert_eq!(first.id, second.id);
            assert_eq!(second.access_token, "rotated");
            assert_eq!(store.list_integrations("org_a").unwrap().len(), 1);
        }
    }

    #[test]
    fn webhook_lookup_skips_root_and_prefers_platform_channel() {
        for mut store in backends() {
            store
                .upsert_integration(new_row("org_a", ChannelType::FacebookRoot, "shared-id"))
                .unwrap();
            assert!(store.find_by_external_id("shared-id", None).unwrap().is_none());

            store
                .upsert_integration(new_row("org_a", ChannelType::Messenger, "shared-id"))
                .unwrap();
            store
                .upsert_integration(new_row("org_a", ChannelType::Whatsapp, "shared-id"))
                .unwrap();
            let hit = store
                .find_by_external_id("shared-id", Some(ChannelType::Whatsapp))
                .unwrap()
                .unwrap();
            assert_eq!(hit.channel_type, ChannelType::Whatsapp);
        }
    }

    #[test]
    fn extra_config_and_status_persist() {
        for mut store in backends() {
            let mut row = new_row("org_a", ChannelType::Instagram, "ig-1");
            row.extra_config = ExtraConfig::Instagram {
                page_id: "page-9".to_string(),
            };
            store.upsert_integration(row).unwrap();
            assert!(store
                .set_status("org_a", ChannelType::Instagram, IntegrationStatus::Revoked)
                .unwrap());
            let loaded = store
                .get_integration("org_a", ChannelType::Instagram)
                .unwrap()
                .unwrap();
            assert_eq!(loaded.status, IntegrationStatus::Revoked);
            assert_eq!(
                loaded.extra_config,
                ExtraConfig::Instagram {
                    page_id: "page-9".to_string()
                }
            );
        }
    }

    #[test]
    fn ai_config_round_trips_per_tenant() {
        for mut store in backends() {
            assert!(store.get_ai_config("org_a").unwrap().is_none());
            let cfg = AiConfig {
                is_active: true,
                bot_name: Some("X".to_string()),
                ..AiConfig::default()
            };
            store.put_ai_config("org_a", &cfg).unwrap();
            assert_eq!(store.get_ai_config("org_a").unwrap(), Some(cfg));
            assert!(store.get_ai_config("org_b").unwrap().is_none());
        }
    }

    #[test]
    fn count_and_delete_are_scoped_to_tenant() {
        for mut store in backends() {
            store
                .upsert_integration(new_row("org_a", ChannelType::Messenger, "p-a"))
                .unwrap();
            store
                .upsert_integration(new_row("org_b", ChannelType::Instagram, "ig-b"))
                .unwrap();
            assert_eq!(
                store
                    .count_channels("org_a", &ChannelType::PAGE_BACKED)
                    .unwrap(),
                1
            );
            assert!(store
                .delete_integration("org_a", ChannelType::Messenger)
                .unwrap());
            assert!(!store
                .delete_integration("org_a", ChannelType::Messenger)
                .unwrap());
            assert_eq!(
                store
                    .count_channels("org_b", &ChannelType::PAGE_BACKED)
                    .unwrap(),
                1
            );
        }
    }
}
