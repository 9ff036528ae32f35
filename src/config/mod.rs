//! Configuration management
//!
//! One JSON file (`config.json`) inside a configuration directory
//! (defaulting to `$XDG_CONFIG_HOME/kexuedns`) holds the listen
//! addresses, an optional CA bundle path, and the default resolver.
//! Missing fields fall back to documented defaults, and a missing file
//! is not an error; `init()` writes a fresh default file for
//! `--config-init`.
//!
//! Loading also assembles the TLS trust anchors: the CA file when
//! configured (absolute or relative to the config directory), otherwise
//! the bundled webpki roots.

pub mod myip;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::dns::client::ResolverExport;

/// Name of the config file inside the config directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Default plain listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1";
/// Default plain listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 5553;
/// Default DoT listen port (RFC 7858).
pub const DEFAULT_DOT_PORT: u16 = 853;
/// Default DoH listen port.
pub const DEFAULT_DOH_PORT: u16 = 443;

/// Configuration errors surfaced at load/init time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Filesystem access failed.
    #[error("config I/O error on {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file does not parse.
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// The file involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The CA bundle contains no usable certificates.
    #[error("invalid CA file: {0}")]
    CaInvalid(PathBuf),

    /// `init()` refuses to overwrite an existing file.
    #[error("config file already exists: {0}")]
    AlreadyExists(PathBuf),
}

/// A TLS-terminating listen endpoint in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsListenFile {
    /// Listen address; empty disables the endpoint.
    #[serde(default)]
    pub addr: String,
    /// Listen port; 0 selects the protocol default.
    #[serde(default)]
    pub port: u16,
    /// Path to the PEM certificate chain.
    #[serde(default)]
    pub cert_file: String,
    /// Path to the PEM private key.
    #[serde(default)]
    pub key_file: String,
}

/// The persisted configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Plain (UDP+TCP) listen address.
    #[serde(default)]
    pub listen_addr: String,
    /// Plain listen port.
    #[serde(default)]
    pub listen_port: u16,
    /// DoT endpoint; absent disables DoT.
    #[serde(default)]
    pub listen_dot: Option<TlsListenFile>,
    /// DoH endpoint; absent disables DoH.
    #[serde(default)]
    pub listen_doh: Option<TlsListenFile>,
    /// File with trusted CA certificates (e.g.
    /// `/etc/ssl/certs/ca-certificates.crt`). Empty selects the bundled
    /// webpki roots.
    #[serde(default)]
    pub ca_file: String,
    /// The default resolver.
    #[serde(default)]
    pub resolver: Option<ResolverExport>,
}

impl ConfigFile {
    fn set_defaults(&mut self) {
        if self.listen_addr.is_empty() {
            self.listen_addr = DEFAULT_LISTEN_ADDR.to_string();
        }
        if self.listen_port == 0 {
            self.listen_port = DEFAULT_LISTEN_PORT;
        }
        if let Some(dot) = &mut self.listen_dot {
            if dot.port == 0 {
                dot.port = DEFAULT_DOT_PORT;
            }
        }
        if let Some(doh) = &mut self.listen_doh {
            if doh.port == 0 {
                doh.port = DEFAULT_DOH_PORT;
            }
        }
    }
}

/// Loaded configuration: the file content plus derived state.
pub struct Config {
    /// The (defaulted) file content.
    pub file: ConfigFile,
    /// Trust anchors for TLS-based resolvers.
    pub roots: Arc<rustls::RootCertStore>,
    /// The configuration directory.
    pub dir: PathBuf,
}

impl Config {
    /// Resolve a possibly-relative path against the config directory.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        resolve_path(path, &self.dir)
    }
}

fn resolve_path(path: &str, dir: &Path) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        dir.join(p)
    }
}

/// Write a default config file into `dir`, creating the directory.
///
/// # Errors
///
/// Fails when the file already exists or the directory cannot be
/// created or written.
pub fn init(dir: &Path) -> Result<(), ConfigError> {
    let path = dir.join(CONFIG_FILENAME);
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path));
    }

    std::fs::create_dir_all(dir).map_err(|e| ConfigError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut file = ConfigFile::default();
    file.set_defaults();
    let mut data = serde_json::to_vec_pretty(&file).expect("default config serializes");
    data.push(b'\n');
    std::fs::write(&path, data).map_err(|e| ConfigError::Io {
        path: path.clone(),
        source: e,
    })?;

    info!(path = %path.display(), "created config file");
    Ok(())
}

/// Load the configuration from `dir`.
///
/// A missing config file selects the defaults; an unreadable or invalid
/// one is an error.
///
/// # Errors
///
/// Fails on unreadable/invalid config or CA files.
pub fn load(dir: &Path) -> Result<Config, ConfigError> {
    let path = dir.join(CONFIG_FILENAME);

    let mut file = match std::fs::read(&path) {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            source: e,
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file doesn't exist; using defaults");
            ConfigFile::default()
        }
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.clone(),
                source: e,
            });
        }
    };

    file.set_defaults();
    debug!(?file, "config file content");

    let roots = if file.ca_file.is_empty() {
        let mut store = rustls::RootCertStore::empty();
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        info!("using bundled webpki trust anchors");
        store
    } else {
        let ca_path = resolve_path(&file.ca_file, dir);
        load_ca_file(&ca_path)?
    };

    info!(dir = %dir.display(), "loaded config");
    Ok(Config {
        file,
        roots: Arc::new(roots),
        dir: dir.to_path_buf(),
    })
}

fn load_ca_file(path: &Path) -> Result<rustls::RootCertStore, ConfigError> {
    let data = std::fs::read(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut store = rustls::RootCertStore::empty();
    let mut added = 0usize;
    for cert in rustls_pemfile::certs(&mut data.as_slice()) {
        let cert = cert.map_err(|_| ConfigError::CaInvalid(path.to_path_buf()))?;
        if store.add(cert).is_ok() {
            added += 1;
        }
    }
    if added == 0 {
        return Err(ConfigError::CaInvalid(path.to_path_buf()));
    }

    info!(path = %path.display(), count = added, "loaded CA certs");
    Ok(store)
}

/// Build-time version information, served by `GET /version`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VersionInfo {
    /// Crate version.
    pub version: &'static str,
    /// Build date, when stamped into the build.
    pub date: &'static str,
}

/// The version info of this build.
#[must_use]
pub fn version() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        date: option_env!("KEXUEDNS_BUILD_DATE").unwrap_or("unknown"),
    }
}
