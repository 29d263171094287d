//! Site app: one logical backend serving a set of hostnames.
//!
//! Construction merges shared and site databases and headers, builds the
//! route table in the canonical order (analytics → cors → account/login →
//! configured handlers → default content) and runs an HTTP listener whose
//! every request goes through the pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use haven_auth::TokenService;
use haven_common::HttpError;
use haven_config::{HandlerConfig, LimitsConfig, MailConfig, SiteConfig, SmsConfig, TokenConfig};
use haven_store::Store;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use regex::Regex;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::api::ApiWare;
use crate::cache::FileCache;
use crate::native::{AccountWare, AnalyticsWare, ContentWare, CorsWare, LoginWare};
use crate::outbound::{NoMailer, NoTexter, SendGrid, Twilio};
use crate::pipeline::{self, Middleware, RespBody};
use crate::router::Route;
use crate::scope::SiteScope;

/// State shared across every site of the process.
pub struct SharedContext {
    pub databases: HashMap<String, Arc<Store>>,
    pub headers: HashMap<String, String>,
    pub token: TokenConfig,
    pub limits: LimitsConfig,
    pub mail: Option<MailConfig>,
    pub sms: Option<SmsConfig>,
}

/// Factory producing a middleware from its handler config.
pub type HandlerFactory =
    Arc<dyn Fn(&HandlerConfig, &SiteScope) -> anyhow::Result<Arc<dyn Middleware>> + Send + Sync>;

/// Registry mapping handler codes to factories. `content` and `api` are
/// built in; embedders may add their own codes.
#[derive(Clone)]
pub struct HandlerRegistry {
    map: HashMap<String, HandlerFactory>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            map: HashMap::new(),
        };
        registry.register("content", |cfg, scope| {
            let root = cfg
                .root
                .clone()
                .or_else(|| scope.content_root.clone())
                .context("content handler without a root")?;
            Ok(Arc::new(ContentWare::new(
                root,
                &scope.content_cfg,
                cfg.get_auth.clone(),
                cfg.post_auth.clone(),
            )) as Arc<dyn Middleware>)
        });
        registry.register("api", |cfg, _scope| {
            Ok(Arc::new(ApiWare {
                database: cfg.database.clone().unwrap_or_else(|| "site".into()),
            }) as Arc<dyn Middleware>)
        });
        registry
    }
}

impl HandlerRegistry {
    pub fn register<F>(&mut self, code: &str, factory: F)
    where
        F: Fn(&HandlerConfig, &SiteScope) -> anyhow::Result<Arc<dyn Middleware>>
            + Send
            + Sync
            + 'static,
    {
        self.map.insert(code.to_string(), Arc::new(factory));
    }

    fn create(
        &self,
        cfg: &HandlerConfig,
        scope: &SiteScope,
    ) -> anyhow::Result<Arc<dyn Middleware>> {
        let factory = self
            .map
            .get(&cfg.code)
            .with_context(|| format!("unknown handler code `{}`", cfg.code))?;
        factory(cfg, scope)
    }
}

/// One site: its scope, its routes, its listener address.
pub struct SiteApp {
    pub scope: Arc<SiteScope>,
    pub routes: Arc<Vec<Route>>,
    addr: SocketAddr,
}

impl SiteApp {
    /// Build a site from config. Must run inside the tokio runtime (site
    /// databases spawn their persist and watch tasks here). Any failure is
    /// fatal to this site only.
    pub fn build(
        cfg: &SiteConfig,
        shared: &SharedContext,
        registry: &HandlerRegistry,
    ) -> anyhow::Result<Self> {
        let tokens = TokenService::new(
            shared.token.secret.as_deref(),
            shared.token.exp_secs,
            shared.token.renewal,
        );
        let mut scope = SiteScope::new(cfg.name.clone(), shared.limits.clone(), tokens);
        scope.rounds = shared.token.rounds;
        scope.content_root = cfg.root.clone();
        scope.content_cfg = cfg.content.clone();
        scope.cache = Arc::new(FileCache::new(
            shared.token.secret.as_deref(),
            cfg.content.cache_max,
            cfg.content.cache_limit,
        ));

        // Shared databases first, site databases layered over them.
        scope.databases = shared.databases.clone();
        for (name, db_cfg) in &cfg.databases {
            let store = Store::open(&db_cfg.path)
                .with_context(|| format!("open site database `{name}`"))?;
            scope.databases.insert(name.clone(), store);
        }

        // Site headers win over shared headers.
        let mut headers = shared.headers.clone();
        headers.extend(cfg.headers.clone());
        scope.headers = headers.into_iter().collect();

        for rule in &cfg.rewrite {
            let re = Regex::new(&rule.pattern)
                .with_context(|| format!("bad rewrite pattern `{}`", rule.pattern))?;
            scope.rewrites.push((re, rule.replace.clone()));
        }
        if let Some(rule) = &cfg.redirect {
            let re = Regex::new(&rule.pattern)
                .with_context(|| format!("bad redirect pattern `{}`", rule.pattern))?;
            scope.redirect = Some((re, rule.replace.clone()));
        }

        scope.mailer = match &shared.mail {
            Some(mail) => Arc::new(SendGrid::new(mail)),
            None => Arc::new(NoMailer),
        };
        scope.texter = match &shared.sms {
            Some(sms) => {
                scope.sms_callback = sms.callback.clone();
                Arc::new(Twilio::new(sms))
            }
            None => Arc::new(NoTexter),
        };

        let routes = build_routes(cfg, &scope, registry)?;
        info!(site = %cfg.name, routes = routes.len(), "site built");

        Ok(Self {
            scope: Arc::new(scope),
            routes: Arc::new(routes),
            addr: SocketAddr::from(([0, 0, 0, 0], cfg.port)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept connections until shutdown, draining in-flight requests.
    pub async fn serve(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("bind {}", self.addr))?;
        info!(site = %self.scope.name, addr = %self.addr, "site listening");

        let mut tasks = tokio::task::JoinSet::new();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(site = %self.scope.name, in_flight = tasks.len(), "draining connections");
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let scope = Arc::clone(&self.scope);
                    let routes = Arc::clone(&self.routes);
                    tasks.spawn(async move {
                        let io = TokioIo::new(stream);
                        let svc = service_fn(move |req| {
                            let scope = Arc::clone(&scope);
                            let routes = Arc::clone(&routes);
                            async move { dispatch(scope, routes, req, remote).await }
                        });
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            warn!(peer = %remote, "connection error: {e}");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}
        info!(site = %self.scope.name, "site stopped");
        Ok(())
    }
}

/// Run the pipeline under the per-request timeout.
async fn dispatch(
    scope: Arc<SiteScope>,
    routes: Arc<Vec<Route>>,
    req: hyper::Request<hyper::body::Incoming>,
    remote: SocketAddr,
) -> Result<hyper::Response<RespBody>, std::convert::Infallible> {
    let budget = Duration::from_secs(scope.limits.timeout_secs.max(1));
    let response =
        match tokio::time::timeout(budget, pipeline::run(&scope, &routes, req, remote)).await {
            Ok(response) => response,
            Err(_) => {
                error!(site = %scope.name, "request timed out");
                let envelope = HttpError::internal("request timed out").envelope();
                let bytes = envelope.to_string().into_bytes();
                hyper::Response::builder()
                    .status(500)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .header(http::header::CONTENT_LENGTH, bytes.len())
                    .body(pipeline::full_body(bytes))
                    .expect("static response builds")
            }
        };
    Ok(response)
}

/// Route table in the canonical order.
fn build_routes(
    cfg: &SiteConfig,
    scope: &SiteScope,
    registry: &HandlerRegistry,
) -> anyhow::Result<Vec<Route>> {
    let mut routes: Vec<Route> = Vec::new();
    let mut push = |route: Result<Route, crate::router::RoutePatternError>| -> anyhow::Result<()> {
        routes.push(route?);
        Ok(())
    };

    push(Route::new("any", "/*", Arc::new(AnalyticsWare)))?;
    if let Some(cors) = &cfg.cors {
        push(Route::new("any", "/*", Arc::new(CorsWare::new(cors))))?;
    }
    if cfg.auth {
        push(Route::new(
            "any",
            "/user/:action/:user?/:opt?",
            Arc::new(AccountWare),
        ))?;
        push(Route::new("any", "/login", Arc::new(LoginWare)))?;
        push(Route::new("any", "/logout", Arc::new(LoginWare)))?;
    }
    for handler in &cfg.handlers {
        let ware = registry.create(handler, scope)?;
        push(Route::new(handler.method.clone(), &handler.route, ware))?;
    }
    if let Some(root) = &cfg.root {
        let ware = ContentWare::new(root.clone(), &cfg.content, None, None);
        push(Route::new("any", "/*", Arc::new(ware)))?;
    }
    Ok(routes)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
