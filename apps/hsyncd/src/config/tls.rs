use std::path::PathBuf;
use std::sync::Arc;

use rustls_pki_types::CertificateDer;
use serde::Deserialize;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// TLS dialing knobs: whether `ssl:`-tagged peers are usable at all, and an optional
/// extra CA bundle for private indexing servers that don't chain to a public root.
#[derive(Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub extra_ca_file: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            extra_ca_file: None,
        }
    }
}

impl TlsConfig {
    /// Build a connector for `Protocol::Tls` peers, or `None` if TLS is disabled.
    /// The root store starts from the bundled Mozilla roots (`webpki-roots`) and is
    /// extended with `extra_ca_file`'s PEM certificates, if given.
    pub fn to_connector(&self) -> eyre::Result<Option<Arc<TlsConnector>>> {
        if !self.enabled {
            return Ok(None);
        }

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &self.extra_ca_file {
            let file = std::fs::File::open(path)
                .map_err(|e| eyre::eyre!("failed to open {}: {e}", path.display()))?;
            let mut reader = std::io::BufReader::new(file);
            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
                .collect::<Result<_, _>>()
                .map_err(|e| eyre::eyre!("failed to parse {}: {e}", path.display()))?;
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|e| eyre::eyre!("invalid certificate in {}: {e}", path.display()))?;
            }
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Some(Arc::new(TlsConnector::from(Arc::new(config)))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_builds_no_connector() {
        let config = TlsConfig {
            enabled: false,
            extra_ca_file: None,
        };
        assert!(config.to_connector().unwrap().is_none());
    }

    #[test]
    fn default_config_builds_a_connector_from_bundled_roots() {
        let config = TlsConfig::default();
        assert!(config.to_connector().unwrap().is_some());
    }
}
