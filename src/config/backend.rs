//! Backend connection parameters (spec §3, "Optional per-resource `backend`
//! block overriding the global backend selection").

use std::path::PathBuf;

/// A closed variant over the backends confr knows how to talk to (spec §9,
/// "Variant over backends"). Carries only connection parameters; the
/// runtime client objects live in [`crate::backend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Env,
    File {
        path: PathBuf,
        filter: String,
    },
    Etcd {
        nodes: Vec<String>,
    },
    Consul {
        address: String,
    },
    Vault {
        address: String,
        token: String,
        mount: String,
    },
    Ssm,
    SecretsManager,
    Acm,
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Env => "env",
            BackendConfig::File { .. } => "file",
            BackendConfig::Etcd { .. } => "etcd",
            BackendConfig::Consul { .. } => "consul",
            BackendConfig::Vault { .. } => "vault",
            BackendConfig::Ssm => "ssm",
            BackendConfig::SecretsManager => "secretsmanager",
            BackendConfig::Acm => "acm",
        }
    }

    pub fn supports_watch(&self) -> bool {
        matches!(self, BackendConfig::Etcd { .. })
    }
}

/// The `[backend]` table of a resource TOML file, deserialized then resolved
/// against the global backend via [`super::resource::TemplateResource`].
#[derive(Debug, Clone, serde::Deserialize, Default)]
pub struct BackendSection {
    pub backend: Option<String>,
    pub nodes: Option<Vec<String>>,
    pub address: Option<String>,
    pub token: Option<String>,
    pub mount: Option<String>,
    pub path: Option<PathBuf>,
    pub filter: Option<String>,
}

impl BackendSection {
    pub fn resolve(&self) -> crate::Result<Option<BackendConfig>> {
        let Some(name) = &self.backend else {
            return Ok(None);
        };
        let cfg = match name.as_str() {
            "env" => BackendConfig::Env,
            "file" => BackendConfig::File {
                path: self.path.clone().ok_or_else(|| {
                    crate::ConfrError::ConfigError("file backend requires `path`".into())
                })?,
                filter: self.filter.clone().unwrap_or_else(|| "*.yaml".to_string()),
            },
            "etcd" => BackendConfig::Etcd {
                nodes: self
                    .nodes
                    .clone()
                    .unwrap_or_else(|| vec!["http://127.0.0.1:2379".to_string()]),
            },
            "consul" => BackendConfig::Consul {
                address: self
                    .address
                    .clone()
                    .unwrap_or_else(|| "http://127.0.0.1:8500".to_string()),
            },
            "vault" => BackendConfig::Vault {
                address: self
                    .address
                    .clone()
                    .unwrap_or_else(|| "http://127.0.0.1:8200".to_string()),
                token: self.token.clone().unwrap_or_default(),
                mount: self.mount.clone().unwrap_or_else(|| "secret".to_string()),
            },
            "ssm" => BackendConfig::Ssm,
            "secretsmanager" => BackendConfig::SecretsManager,
            "acm" => BackendConfig::Acm,
            other => return Err(crate::ConfrError::UnsupportedBackend(other.to_string())),
        };
        Ok(Some(cfg))
    }
}
