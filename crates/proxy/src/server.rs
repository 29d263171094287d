//! Front-end listeners.
//!
//! One [`ProxyServer`] per configured proxy: a plain HTTP listener
//! forwards as-is; an HTTPS listener terminates TLS with the bundle's SNI
//! resolver and forwards plain. Host misses from public addresses are
//! counted and the connection is closed without a response.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use haven_common::REGISTRY;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::forward::{Forwarder, ProxyBody};
use crate::host::{is_private_ip, HostTable};
use crate::tls::CertBundle;

/// Returned to hyper to drop a connection for an unmatched host.
#[derive(Debug, thiserror::Error)]
#[error("host not served here")]
struct HostRejected;

pub struct ProxyServer {
    port: u16,
    verbose: bool,
    table: Arc<HostTable>,
    bundle: Option<Arc<CertBundle>>,
    forwarder: Arc<Forwarder>,
}

impl ProxyServer {
    pub fn new(
        port: u16,
        verbose: bool,
        table: Arc<HostTable>,
        bundle: Option<Arc<CertBundle>>,
    ) -> Self {
        Self {
            port,
            verbose,
            table,
            bundle,
            forwarder: Arc::new(Forwarder::new()),
        }
    }

    /// Accept until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let acceptor = self.bundle.as_ref().map(|b| {
            b.spawn_watch()
                .map_err(|e| warn!(error = %e, "certificate watch unavailable"))
                .ok();
            TlsAcceptor::from(b.server_config())
        });
        info!(
            %addr,
            tls = acceptor.is_some(),
            "proxy listening"
        );

        let server = Arc::new(self);
        loop {
            tokio::select! {
                biased;

                _ = tokio::signal::ctrl_c() => {
                    info!(%addr, "proxy stopping");
                    return Ok(());
                }

                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let server = Arc::clone(&server);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    server.serve_connection(TokioIo::new(tls_stream), remote, true).await;
                                }
                                Err(e) => debug!(peer = %remote, error = %e, "tls handshake failed"),
                            },
                            None => {
                                server.serve_connection(TokioIo::new(stream), remote, false).await;
                            }
                        }
                    });
                }
            }
        }
    }

    async fn serve_connection<I>(self: &Arc<Self>, io: I, remote: SocketAddr, tls: bool)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let server = Arc::clone(self);
        let svc = service_fn(move |req| {
            let server = Arc::clone(&server);
            async move { server.route(req, remote, tls).await }
        });
        // Upgrade-capable serving keeps WebSocket passthrough working.
        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, svc)
            .await
        {
            debug!(peer = %remote, "connection ended: {e}");
        }
    }

    /// Host-header routing. A hit counts `served` and forwards; a miss
    /// from a public address (or any miss when verbose) counts `probes`
    /// and the per-IP blacklist, then the connection closes.
    async fn route(
        &self,
        req: hyper::Request<Incoming>,
        remote: SocketAddr,
        tls: bool,
    ) -> Result<hyper::Response<ProxyBody>, HostRejected> {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let Some(backend) = self.table.lookup(&host) else {
            let ip = remote.ip();
            if !is_private_ip(&ip) || self.verbose {
                REGISTRY.bump_stat("probes");
                REGISTRY.bump_blacklist(&ip.to_string());
                warn!(%host, peer = %remote, "unserved host probed");
            }
            return Err(HostRejected);
        };

        REGISTRY.bump_stat("served");
        let response = self
            .forwarder
            .forward(req, backend, &remote.ip().to_string(), tls)
            .await;
        Ok(response)
    }
}
