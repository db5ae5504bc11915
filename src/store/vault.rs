//! HashiCorp Vault KV version 2 client.
//!
//! Reads `GET {address}/v1/{mount}/data/{path}` with the caller's token.
//! The token comes from `VAULT_TOKEN` or `~/.vault-token`, the same places
//! the `vault` CLI looks. TLS trust follows `VAULT_CACERT`, `VAULT_CAPATH`
//! and `VAULT_SKIP_VERIFY` unless the config sets them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use zeroize::Zeroizing;

use super::{KvSecret, SecretStore, StoreError, VersionMetadata};
use crate::config::{Config, VaultConnection};

/// Connection settings for [`VaultClient`].
#[derive(Clone)]
pub struct VaultSettings {
    /// Base address, e.g. `https://vault.internal:8200`.
    pub address: String,
    /// KV version 2 mount point.
    pub mount: String,
    /// Client token.
    pub token: Zeroizing<String>,
    /// Optional Vault Enterprise namespace.
    pub namespace: Option<String>,
    /// PEM bundle of extra trusted roots.
    pub ca_cert: Option<PathBuf>,
    /// Directory of PEM files with extra trusted roots.
    pub ca_path: Option<PathBuf>,
    /// Accept any server certificate.
    pub skip_verify: bool,
}

impl VaultSettings {
    /// Settings for `connection`, authenticating with `token`.
    pub fn new(connection: VaultConnection, mount: String, token: Zeroizing<String>) -> Self {
        Self {
            address: connection.address,
            mount,
            token,
            namespace: connection.namespace,
            ca_cert: connection.ca_cert,
            ca_path: connection.ca_path,
            skip_verify: connection.skip_verify,
        }
    }
}

impl std::fmt::Debug for VaultSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSettings")
            .field("address", &self.address)
            .field("mount", &self.mount)
            .field("token", &"<redacted>")
            .field("namespace", &self.namespace)
            .field("ca_cert", &self.ca_cert)
            .field("ca_path", &self.ca_path)
            .field("skip_verify", &self.skip_verify)
            .finish()
    }
}

/// Vault KV version 2 client. Cheap to share behind an `Arc`.
pub struct VaultClient {
    http: reqwest::Client,
    settings: VaultSettings,
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// `GET /v1/{mount}/data/{path}` response body.
#[derive(Debug, Deserialize)]
struct ReadResponse {
    data: Option<ReadData>,
}

#[derive(Debug, Deserialize)]
struct ReadData {
    data: Option<Map<String, Value>>,
    metadata: Option<VersionMetadata>,
}

/// Vault error body: `{"errors": ["..."]}`.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

impl VaultClient {
    /// Build a client. No request is made until the first [`SecretStore::get`].
    pub fn new(settings: VaultSettings) -> Result<Self> {
        if settings.token.is_empty() {
            anyhow::bail!("Vault token is empty");
        }
        reqwest::Url::parse(&settings.address)
            .with_context(|| format!("Invalid Vault address: {}", settings.address))?;

        // No request timeout: a hung Vault stalls only the socket waiting on it.
        let mut builder = reqwest::Client::builder();
        for cert in trusted_roots(&settings)? {
            builder = builder.add_root_certificate(cert);
        }
        if settings.skip_verify {
            log::warn!("TLS certificate verification disabled for {}", settings.address);
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .context("Failed to build Vault HTTP client")?;

        Ok(Self { http, settings })
    }

    /// Build a client from the loaded config and the ambient token.
    pub fn from_config(config: &Config) -> Result<Self> {
        let connection = config.vault_connection()?;
        let token = resolve_token()?;
        Self::new(VaultSettings::new(
            connection,
            config.vault_mount.clone(),
            token,
        ))
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/data/{}",
            self.settings.address.trim_end_matches('/'),
            self.settings.mount.trim_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn get(&self, path: &str) -> Result<KvSecret, StoreError> {
        let mut request = self
            .http
            .get(self.data_url(path))
            .header("X-Vault-Token", self.settings.token.as_str());
        if let Some(namespace) = &self.settings.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .ok()
                .filter(|e| !e.errors.is_empty())
                .map_or(body, |e| e.errors.join("; "));
            return Err(StoreError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        let body: ReadResponse = response.json().await.map_err(|e| StoreError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        let Some(read) = body.data else {
            return Err(StoreError::Decode {
                path: path.to_string(),
                message: "response has no data".to_string(),
            });
        };

        match read.data {
            Some(data) => Ok(KvSecret {
                data,
                metadata: read.metadata,
            }),
            None => Err(StoreError::Deleted {
                path: path.to_string(),
                version: read.metadata.map_or(0, |m| m.version),
            }),
        }
    }
}

/// Certificates from `ca_cert` and every regular file in `ca_path`.
fn trusted_roots(settings: &VaultSettings) -> Result<Vec<reqwest::Certificate>> {
    let mut files = Vec::new();
    if let Some(path) = &settings.ca_cert {
        files.push(path.clone());
    }
    if let Some(dir) = &settings.ca_path {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read CA directory: {}", dir.display()))?;
        let mut in_dir = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("Failed to read CA directory: {}", dir.display()))?
                .path();
            if path.is_file() {
                in_dir.push(path);
            }
        }
        in_dir.sort();
        files.extend(in_dir);
    }

    let mut certs = Vec::new();
    for path in &files {
        certs.extend(load_pem_bundle(path)?);
    }
    Ok(certs)
}

fn load_pem_bundle(path: &Path) -> Result<Vec<reqwest::Certificate>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read CA certificate: {}", path.display()))?;
    let certs = reqwest::Certificate::from_pem_bundle(&pem)
        .with_context(|| format!("Invalid CA certificate: {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

/// Find a Vault token: `VAULT_TOKEN`, then `~/.vault-token`.
pub fn resolve_token() -> Result<Zeroizing<String>> {
    if let Ok(token) = std::env::var("VAULT_TOKEN") {
        if !token.trim().is_empty() {
            return Ok(Zeroizing::new(token.trim().to_string()));
        }
    }

    if let Some(path) = token_file_path() {
        if path.exists() {
            let contents = Zeroizing::new(
                std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read token file: {}", path.display()))?,
            );
            let token = contents.trim();
            if !token.is_empty() {
                return Ok(Zeroizing::new(token.to_string()));
            }
        }
    }

    anyhow::bail!("No Vault token found: set VAULT_TOKEN or run `vault login`")
}

fn token_file_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".vault-token"))
}
