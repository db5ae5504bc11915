//! Configuration loading and validation.
//!
//! Reads the YAML file that maps Vault secret paths to local socket paths.
//! The Vault token is never part of this file; see [`crate::store::vault`].

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Vault address used when neither the config nor `VAULT_ADDR` sets one.
pub const DEFAULT_VAULT_ADDR: &str = "https://127.0.0.1:8200";

/// KV version 2 mount used when the config does not name one.
pub const DEFAULT_VAULT_MOUNT: &str = "secret";

/// Configuration for the vaultsock daemon.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Vault server address. Falls back to `VAULT_ADDR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_server: Option<String>,
    /// Mount point of the KV version 2 secrets engine.
    #[serde(default = "default_vault_mount")]
    pub vault_mount: String,
    /// Vault Enterprise namespace, sent as `X-Vault-Namespace`.
    /// Falls back to `VAULT_NAMESPACE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_namespace: Option<String>,
    /// PEM file (one or more certificates) trusted for the Vault server.
    /// Falls back to `VAULT_CACERT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_ca_cert: Option<PathBuf>,
    /// Directory of PEM files trusted for the Vault server.
    /// Falls back to `VAULT_CAPATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_ca_path: Option<PathBuf>,
    /// Disable TLS certificate verification. Falls back to `VAULT_SKIP_VERIFY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_skip_verify: Option<bool>,
    /// Directory every `socket_path` is resolved against.
    #[serde(default = "default_socket_root")]
    pub socket_root: PathBuf,
    /// Seconds to wait before restarting a server that stopped.
    /// Unset means a stopped server stays stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_after_secs: Option<u64>,
    /// Secrets to expose, one socket each.
    #[serde(default)]
    pub secrets: Vec<SecretDescriptor>,
}

/// Maps one Vault secret (and optionally one of its fields) to one socket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecretDescriptor {
    /// Socket path, relative to the socket root.
    pub socket_path: PathBuf,
    /// Secret path inside the KV mount (e.g. `app/db`).
    pub vault_path: String,
    /// Field to serve. When unset the whole secret is dumped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl SecretDescriptor {
    /// Build a descriptor. An empty `field` means "serve the whole secret".
    pub fn new(
        socket_path: impl Into<PathBuf>,
        vault_path: impl Into<String>,
        field: Option<&str>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            vault_path: vault_path.into(),
            field: field.filter(|f| !f.is_empty()).map(str::to_string),
        }
    }

    /// The field to serve, if any.
    pub fn field(&self) -> Option<&str> {
        self.field.as_deref().filter(|f| !f.is_empty())
    }

    /// Resolve this descriptor's socket path under `root`.
    ///
    /// A leading `/` is stripped so the socket always lands inside `root`.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        let relative = self
            .socket_path
            .strip_prefix("/")
            .unwrap_or(&self.socket_path);
        root.join(relative)
    }
}

fn default_vault_mount() -> String {
    DEFAULT_VAULT_MOUNT.to_string()
}

/// Default socket root: `/tmp/vaultsock-{uid}`.
///
/// Kept under `/tmp` because macOS limits Unix socket paths to 104 bytes.
pub fn default_socket_root() -> PathBuf {
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/vaultsock-{uid}"))
}

/// Resolved settings for reaching the Vault server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConnection {
    /// Base address.
    pub address: String,
    /// Vault Enterprise namespace.
    pub namespace: Option<String>,
    /// PEM bundle of extra trusted roots.
    pub ca_cert: Option<PathBuf>,
    /// Directory of PEM files with extra trusted roots.
    pub ca_path: Option<PathBuf>,
    /// Accept any server certificate.
    pub skip_verify: bool,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Wrap an environment lookup so an empty value counts as unset.
fn non_empty(env: impl Fn(&str) -> Option<String>) -> impl Fn(&str) -> Option<String> {
    move |key| env(key).filter(|v| !v.is_empty())
}

/// Boolean spellings accepted by the `vault` CLI for `VAULT_SKIP_VERIFY`.
fn parse_bool(raw: &str) -> Result<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => anyhow::bail!("expected true or false"),
    }
}

impl Config {
    /// Load configuration from `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML without consulting the environment.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config = Self::parse(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        for secret in &mut config.secrets {
            if secret.field.as_deref() == Some("") {
                secret.field = None;
            }
        }
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(env_var);
    }

    fn apply_overrides_from(&mut self, env: impl Fn(&str) -> Option<String>) {
        let env = non_empty(env);
        if let Some(root) = env("VAULTSOCK_SOCKET_ROOT") {
            self.socket_root = PathBuf::from(root);
        }

        if let Some(mount) = env("VAULTSOCK_VAULT_MOUNT") {
            self.vault_mount = mount;
        }
    }

    /// Reject configurations the servers cannot run safely.
    ///
    /// Two secrets resolving to the same socket path would race each
    /// other's bind, so duplicates are an error rather than a warning.
    pub fn validate(&self) -> Result<()> {
        if self.vault_mount.trim_matches('/').is_empty() {
            anyhow::bail!("vault_mount must not be empty");
        }

        if self.secrets.is_empty() {
            log::warn!("No secrets configured; nothing will be served");
        }

        let mut seen = HashSet::new();
        for (index, secret) in self.secrets.iter().enumerate() {
            if secret.socket_path.as_os_str().is_empty() {
                anyhow::bail!("secrets[{index}]: socket_path must not be empty");
            }
            if secret
                .socket_path
                .components()
                .any(|c| matches!(c, Component::ParentDir))
            {
                anyhow::bail!(
                    "secrets[{index}]: socket_path must not contain '..': {}",
                    secret.socket_path.display()
                );
            }
            if secret.vault_path.trim_matches('/').is_empty() {
                anyhow::bail!("secrets[{index}]: vault_path must not be empty");
            }

            let resolved = self.socket_path_for(secret);
            if resolved == self.socket_root {
                anyhow::bail!("secrets[{index}]: socket_path resolves to the socket root itself");
            }
            if !seen.insert(resolved.clone()) {
                anyhow::bail!(
                    "secrets[{index}]: duplicate socket path {} (each secret needs its own socket)",
                    resolved.display()
                );
            }
        }

        Ok(())
    }

    /// Vault address: config, then `VAULT_ADDR`, then the Vault default.
    pub fn vault_address(&self) -> String {
        self.vault_address_from(env_var)
    }

    fn vault_address_from(&self, env: impl Fn(&str) -> Option<String>) -> String {
        let env = non_empty(env);
        self.vault_server
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| env("VAULT_ADDR"))
            .unwrap_or_else(|| DEFAULT_VAULT_ADDR.to_string())
    }

    /// Vault connection options, each falling back to the `VAULT_*`
    /// variable the `vault` CLI reads when the config leaves it unset.
    pub fn vault_connection(&self) -> Result<VaultConnection> {
        self.vault_connection_from(env_var)
    }

    /// [`Config::vault_connection`] with an explicit environment lookup.
    pub fn vault_connection_from(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<VaultConnection> {
        let env = non_empty(env);
        let skip_verify = match self.vault_skip_verify {
            Some(skip) => skip,
            None => match env("VAULT_SKIP_VERIFY") {
                Some(raw) => parse_bool(&raw)
                    .with_context(|| format!("Invalid VAULT_SKIP_VERIFY value: {raw}"))?,
                None => false,
            },
        };

        Ok(VaultConnection {
            address: self.vault_address_from(&env),
            namespace: self
                .vault_namespace
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| env("VAULT_NAMESPACE")),
            ca_cert: self
                .vault_ca_cert
                .clone()
                .or_else(|| env("VAULT_CACERT").map(PathBuf::from)),
            ca_path: self
                .vault_ca_path
                .clone()
                .or_else(|| env("VAULT_CAPATH").map(PathBuf::from)),
            skip_verify,
        })
    }

    /// Absolute socket path for one descriptor.
    pub fn socket_path_for(&self, secret: &SecretDescriptor) -> PathBuf {
        secret.resolve(&self.socket_root)
    }

    /// Restart delay for stopped servers, if restarts are enabled.
    pub fn restart_after(&self) -> Option<std::time::Duration> {
        self.restart_after_secs.map(std::time::Duration::from_secs)
    }
}
