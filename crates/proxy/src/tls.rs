//! TLS certificate bundle with hot reload.
//!
//! The SNI callback reads the current `CertifiedKey` out of a mutable
//! cell; a file watcher rebuilds the key when the certificate file's
//! mtime advances, with a `busy` flag keeping reloads from overlapping.
//! Handshakes in flight keep whatever key they resolved.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use notify::{RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, info, warn};

/// Quiet window after a certificate file event before reloading.
const RELOAD_QUIET_MS: u64 = 500;

/// Certificate + key pair backing one HTTPS listener.
pub struct CertBundle {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: RwLock<Arc<CertifiedKey>>,
    mtime: Mutex<SystemTime>,
    busy: AtomicBool,
    _watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBundle")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish()
    }
}

impl CertBundle {
    /// Load the bundle. Failure here is fatal to the owning proxy.
    pub fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<Self>> {
        let key = load_certified_key(cert_path, key_path)?;
        let mtime = std::fs::metadata(cert_path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        info!(cert = %cert_path.display(), "certificate bundle loaded");
        Ok(Arc::new(Self {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            current: RwLock::new(Arc::new(key)),
            mtime: Mutex::new(mtime),
            busy: AtomicBool::new(false),
            _watcher: Mutex::new(None),
        }))
    }

    /// A rustls server config whose SNI resolver reads this bundle's cell.
    pub fn server_config(self: &Arc<Self>) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::clone(self) as Arc<dyn ResolvesServerCert>);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Rebuild the key if the certificate file changed. One reload runs at
    /// a time; callers racing it are turned away with `false`.
    pub fn reload_if_changed(&self) -> anyhow::Result<bool> {
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("certificate reload already in flight");
            return Ok(false);
        }
        let outcome = self.reload_inner();
        self.busy.store(false, Ordering::SeqCst);
        outcome
    }

    fn reload_inner(&self) -> anyhow::Result<bool> {
        let mtime = std::fs::metadata(&self.cert_path)
            .and_then(|m| m.modified())
            .with_context(|| format!("stat {}", self.cert_path.display()))?;
        if mtime == *self.mtime.lock() {
            return Ok(false);
        }
        let key = load_certified_key(&self.cert_path, &self.key_path)?;
        *self.current.write() = Arc::new(key);
        *self.mtime.lock() = mtime;
        info!(cert = %self.cert_path.display(), "certificate bundle reloaded");
        Ok(true)
    }

    /// Watch the certificate file and reload after a quiet window.
    pub fn spawn_watch(self: &Arc<Self>) -> notify::Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            })?;
        watcher.watch(&self.cert_path, RecursiveMode::NonRecursive)?;
        *self._watcher.lock() = Some(watcher);

        let bundle = Arc::clone(self);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                while let Ok(Some(_)) =
                    tokio::time::timeout(Duration::from_millis(RELOAD_QUIET_MS), rx.recv()).await
                {}
                match bundle.reload_if_changed() {
                    Ok(true) => {}
                    Ok(false) => debug!("certificate unchanged"),
                    Err(e) => warn!(error = %e, "certificate reload failed"),
                }
            }
        });
        Ok(())
    }
}

impl ResolvesServerCert for CertBundle {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.current.read()))
    }
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> anyhow::Result<CertifiedKey> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path).with_context(|| format!("open {}", cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", cert_path.display());
    }

    let mut key_reader = BufReader::new(
        File::open(key_path).with_context(|| format!("open {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("parse {}", key_path.display()))?
        .with_context(|| format!("no private key in {}", key_path.display()))?;

    let signing = any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("unsupported key in {}: {e}", key_path.display()))?;
    Ok(CertifiedKey::new(certs, signing))
}
