//! Builds the right adapter for a server
//!
//! The factory resolves connection parameters, decrypts stored secrets with
//! the vault and hands shell-backed adapters a handle to the shared pool.

use crate::adapter::{AdminApi, CaddyAdapter, HaproxyAdapter, NginxAdapter, ProxyAdapter, StubAdapter, TraefikAdapter};
use crate::error::AdapterError;
use crate::model::{ProxyFamily, ServerDescriptor};
use crate::pool::TransportPool;
use crate::transport::ShellParams;
use crate::vault::{mask, CredentialVault};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default SSH login when a server record names none
const DEFAULT_SSH_USER: &str = "root";

pub struct AdapterFactory {
    vault: Arc<CredentialVault>,
    pool: Arc<TransportPool>,
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl AdapterFactory {
    pub fn new(
        vault: Arc<CredentialVault>,
        pool: Arc<TransportPool>,
        http: reqwest::Client,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            vault,
            pool,
            http,
            connect_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<TransportPool> {
        &self.pool
    }

    /// Build an adapter bound to `server`. Fails only when a stored secret
    /// cannot be decrypted.
    pub fn build(&self, server: &ServerDescriptor) -> Result<Box<dyn ProxyAdapter>, AdapterError> {
        let id = server.id.clone();
        let name = server.display_name().to_string();

        debug!(server_id = %server.id, family = %server.proxy_type, "Building adapter");

        let adapter: Box<dyn ProxyAdapter> = match server.proxy_type {
            ProxyFamily::Nginx => {
                let params = ShellParams {
                    host: server.host.clone(),
                    port: server.effective_port(),
                    user: server
                        .ssh_user
                        .clone()
                        .filter(|u| !u.is_empty())
                        .unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
                    private_key: self.decrypt(server.ssh_key_enc.as_deref())?,
                };
                Box::new(NginxAdapter::new(
                    id,
                    name,
                    params,
                    Arc::clone(&self.pool),
                    self.connect_timeout,
                ))
            }
            ProxyFamily::Traefik => Box::new(TraefikAdapter::new(id, name, self.admin_api(server)?)),
            ProxyFamily::Caddy => Box::new(CaddyAdapter::new(id, name, self.admin_api(server)?)),
            ProxyFamily::HaProxy => Box::new(HaproxyAdapter::new(id, name, self.admin_api(server)?)),
            ProxyFamily::Other => Box::new(StubAdapter::new(id, server.host.clone(), server.effective_port())),
        };

        Ok(adapter)
    }

    fn admin_api(&self, server: &ServerDescriptor) -> Result<AdminApi, AdapterError> {
        Ok(AdminApi::new(
            self.http.clone(),
            server.api_base_url(),
            self.decrypt(server.api_token_enc.as_deref())?,
        ))
    }

    /// Masked form of the stored API token for display. `None` when no token
    /// is stored or it no longer decrypts.
    pub fn api_token_mask(&self, server: &ServerDescriptor) -> Option<String> {
        match self.decrypt(server.api_token_enc.as_deref()) {
            Ok(token) => token.map(|t| mask(t.expose_secret())),
            Err(e) => {
                debug!(server_id = %server.id, error = %e, "Stored API token does not decrypt");
                None
            }
        }
    }

    fn decrypt(&self, ciphertext: Option<&str>) -> Result<Option<SecretString>, AdapterError> {
        match ciphertext.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => Ok(Some(self.vault.decrypt(c)?)),
            None => Ok(None),
        }
    }
}
