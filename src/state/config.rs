use std::collections::BTreeMap;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use tracing::info;

use super::{State, StateError};
use crate::codec::Versioned;
use crate::job::ApplicationRef;
use crate::keys::Bucket;

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum ConfigScope {
    Global,
    Project(String),
    Application(ApplicationRef),
}

impl ConfigScope {
    fn key_prefix(&self) -> String {
        match self {
            ConfigScope::Global => "global/".to_string(),
            ConfigScope::Project(p) => format!("project/{}/", p.to_lowercase()),
            ConfigScope::Application(app) => format!("app/{}/", app.key()),
        }
    }

    /// Scopes whose variables apply here, least specific first.
    fn lineage(&self) -> Vec<ConfigScope> {
        match self {
            ConfigScope::Global => vec![ConfigScope::Global],
            ConfigScope::Project(p) => vec![ConfigScope::Global, ConfigScope::Project(p.clone())],
            ConfigScope::Application(app) => vec![
                ConfigScope::Global,
                ConfigScope::Project(app.project.clone()),
                ConfigScope::Application(app.clone()),
            ],
        }
    }
}

/// An application configuration variable.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ConfigVar {
    pub scope: ConfigScope,
    pub name: String,
    pub value: String,
}

impl Versioned for ConfigVar {
    const VERSION: u8 = 1;
}

impl ConfigVar {
    pub fn new(scope: ConfigScope, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scope,
            name: name.into(),
            value: value.into(),
        }
    }

    fn storage_id(&self) -> String {
        format!("{}{}", self.scope.key_prefix(), self.name)
    }
}

/// Server-wide settings written by the server itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ServerConfig {
    pub advertise_addrs: Vec<String>,
    pub platform: String,
}

impl Versioned for ServerConfig {
    const VERSION: u8 = 1;
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
struct StoredString {
    value: String,
}

impl Versioned for StoredString {
    const VERSION: u8 = 1;
}

const SERVER_SINGLETON_ID: &str = "server";

impl State {
    /// Set config variables in one transaction. An empty value deletes the variable.
    pub async fn config_set(&self, vars: Vec<ConfigVar>) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        for var in &vars {
            let id = var.storage_id();
            if var.value.is_empty() {
                txn.delete(Bucket::Config, &id);
            } else {
                txn.put(Bucket::Config, &id, var)?;
            }
        }
        txn.commit().await?;
        info!(count = vars.len(), "config variables set");
        Ok(())
    }

    /// Variables visible in `scope`: global, then project, then application, with more
    /// specific scopes overriding by name. Sorted by name.
    pub async fn config_get(&self, scope: &ConfigScope) -> Result<Vec<ConfigVar>, StateError> {
        let all = self.scan_bucket::<ConfigVar>(Bucket::Config).await?;
        let mut merged: BTreeMap<String, ConfigVar> = BTreeMap::new();
        for layer in scope.lineage() {
            let prefix = layer.key_prefix();
            for (id, var) in &all {
                if id.starts_with(&prefix) && !id[prefix.len()..].contains('/') {
                    merged.insert(var.name.to_lowercase(), var.clone());
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    pub async fn server_id_get(&self) -> Result<Option<String>, StateError> {
        Ok(self
            .get_durable::<StoredString>(Bucket::ServerId, SERVER_SINGLETON_ID)
            .await?
            .map(|s| s.value))
    }

    pub async fn server_id_set(&self, id: &str) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        txn.put(
            Bucket::ServerId,
            SERVER_SINGLETON_ID,
            &StoredString {
                value: id.to_string(),
            },
        )?;
        txn.commit().await
    }

    pub async fn server_config_get(&self) -> Result<Option<ServerConfig>, StateError> {
        self.get_durable::<ServerConfig>(Bucket::ServerConfig, SERVER_SINGLETON_ID)
            .await
    }

    pub async fn server_config_set(&self, cfg: &ServerConfig) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        txn.put(Bucket::ServerConfig, SERVER_SINGLETON_ID, cfg)?;
        txn.commit().await
    }

    pub async fn server_url_token_get(&self) -> Result<Option<String>, StateError> {
        Ok(self
            .get_durable::<StoredString>(Bucket::ServerUrlToken, SERVER_SINGLETON_ID)
            .await?
            .map(|s| s.value))
    }

    pub async fn server_url_token_set(&self, token: &str) -> Result<(), StateError> {
        let mut txn = self.txn().await;
        txn.put(
            Bucket::ServerUrlToken,
            SERVER_SINGLETON_ID,
            &StoredString {
                value: token.to_string(),
            },
        )?;
        txn.commit().await
    }
}
