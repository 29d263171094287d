//! Haven site runtime.
//!
//! Everything one site needs to turn an accepted connection into a
//! response:
//!
//! - **Pipeline**: context, ordered routing, middleware chain, response
//!   serialization, error funnel
//! - **Body parsing**: JSON with embedded data URLs, multipart,
//!   urlencoded, text, octet, with streaming uploads and hard
//!   ceilings
//! - **Static content**: safe path resolution, conditional GET,
//!   negotiated gzip, a fingerprinted file cache
//! - **Native middlewares**: analytics, CORS, login, account management
//! - **Recipe API**: the `$`/`@`/`!` dispatcher over the JSON store
//! - **Outbound**: SendGrid and Twilio collaborators

pub mod api;
pub mod app;
pub mod body;
pub mod cache;
pub mod context;
pub mod native;
pub mod outbound;
pub mod pipeline;
pub mod router;
pub mod scope;

pub use api::ApiWare;
pub use app::{HandlerRegistry, SharedContext, SiteApp};
pub use body::ParsedBody;
pub use cache::{CacheEntry, FileCache};
pub use context::{AuthKind, RequestCtx};
pub use native::{AccountWare, AnalyticsWare, ContentWare, CorsWare, LoginWare};
pub use outbound::{MailMessage, Mailer, Texter};
pub use pipeline::{Middleware, Outcome, RespBody};
pub use router::Route;
pub use scope::SiteScope;
