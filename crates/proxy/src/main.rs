//! Haven entry point.
//!
//! Loads the configuration, opens the shared databases, builds and starts
//! every site app, then brings up the front-end proxies. A site or proxy
//! that fails to start is logged and skipped; the rest of the process
//! carries on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use haven_config::HavenConfig;
use haven_proxy::{Backend, CertBundle, HostTable, ProxyServer};
use haven_site::app::{HandlerRegistry, SharedContext};
use haven_site::SiteApp;
use haven_store::Store;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "haven", about = "Multi-tenant HTTP/HTTPS hosting runtime")]
struct Args {
    /// Configuration file path.
    #[arg(short, long, env = "HAVEN_CONFIG")]
    config: PathBuf,
}

fn main() -> Result<()> {
    haven_common::init_tracing();
    let args = Args::parse();

    info!(config = %args.config.display(), "loading configuration");
    let config = HavenConfig::load(&args.config)?;

    let runtime = tokio::runtime::Runtime::new().context("build runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: HavenConfig) -> Result<()> {
    // Shared databases are load-bearing for every site; failing one here
    // is fatal to the process.
    let mut databases = HashMap::new();
    for (name, db_cfg) in &config.databases {
        let store = Store::open(&db_cfg.path)
            .with_context(|| format!("open shared database `{name}`"))?;
        info!(db = %name, path = %db_cfg.path.display(), "shared database open");
        databases.insert(name.clone(), store);
    }

    let shared = SharedContext {
        databases,
        headers: config.headers.clone(),
        token: config.token.clone(),
        limits: config.limits.clone(),
        mail: config.mail.clone(),
        sms: config.sms.clone(),
    };
    let registry = HandlerRegistry::default();

    let mut tasks = tokio::task::JoinSet::new();

    // Site failures terminate the owning site; other sites continue.
    let mut started = Vec::new();
    for site_cfg in &config.sites {
        match SiteApp::build(site_cfg, &shared, &registry) {
            Ok(app) => {
                started.push(site_cfg.clone());
                let name = site_cfg.name.clone();
                tasks.spawn(async move {
                    if let Err(e) = app.serve().await {
                        error!(site = %name, error = %e, "site terminated");
                    }
                });
            }
            Err(e) => {
                error!(site = %site_cfg.name, error = %e, "site failed to start");
            }
        }
    }
    if started.is_empty() {
        anyhow::bail!("no site started");
    }

    for proxy_cfg in &config.proxies {
        let mut table = HostTable::new();
        for site_cfg in &started {
            if !proxy_cfg.sites.is_empty() && !proxy_cfg.sites.contains(&site_cfg.name) {
                continue;
            }
            let backend = Backend {
                host: "127.0.0.1".into(),
                port: site_cfg.port,
            };
            table.insert(&site_cfg.host, backend.clone());
            for alias in &site_cfg.aliases {
                table.insert(alias, backend.clone());
            }
        }
        if table.is_empty() {
            error!(port = proxy_cfg.port, "proxy has no sites, skipped");
            continue;
        }

        let bundle = match &proxy_cfg.tls {
            Some(tls) => match CertBundle::load(&tls.cert, &tls.key) {
                Ok(bundle) => Some(bundle),
                Err(e) => {
                    error!(port = proxy_cfg.port, error = %e, "proxy failed to start");
                    continue;
                }
            },
            None => None,
        };

        let server = ProxyServer::new(
            proxy_cfg.port,
            proxy_cfg.verbose,
            Arc::new(table),
            bundle,
        );
        let port = proxy_cfg.port;
        tasks.spawn(async move {
            if let Err(e) = server.run().await {
                error!(port, error = %e, "proxy terminated");
            }
        });
    }

    info!("haven up");
    while tasks.join_next().await.is_some() {}
    info!("haven stopped");
    Ok(())
}
