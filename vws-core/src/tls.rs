//! rustls configuration shared by client sockets.

use std::sync::{Arc, OnceLock};

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;

use crate::error::{Error, Result};

static DEFAULT_CLIENT: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Client config trusting the webpki root set, built once per process.
pub fn default_client_config() -> Arc<ClientConfig> {
    DEFAULT_CLIENT
        .get_or_init(|| {
            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

/// TLS server name for `host` (DNS name or IP literal).
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::InvalidArgument(format!("invalid hostname for TLS: {host}")))
}
