//! Static content middleware.
//!
//! GET resolves a safe path under the content root and serves it through
//! the file cache with conditional-GET and negotiated gzip; POST accepts
//! multipart uploads into the tree. Symlinks and missing files fall
//! through to the next route.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use haven_common::HttpError;
use haven_config::ContentConfig;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::context::RequestCtx;
use crate::pipeline::{
    stream_file, stream_file_gzip, ContentBody, ContentResponse, Middleware, Outcome,
};
use crate::scope::SiteScope;

pub struct ContentWare {
    root: PathBuf,
    get_auth: Option<Vec<String>>,
    post_auth: Option<Vec<String>>,
    cache_header: String,
    compress: HashSet<String>,
    index: String,
    indexing: bool,
}

impl ContentWare {
    pub fn new(
        root: PathBuf,
        cfg: &ContentConfig,
        get_auth: Option<Vec<String>>,
        post_auth: Option<Vec<String>>,
    ) -> Self {
        Self {
            root,
            get_auth,
            post_auth,
            cache_header: cfg.cache_header.clone(),
            compress: cfg.compress.iter().cloned().collect(),
            index: cfg.index.clone(),
            indexing: cfg.indexing,
        }
    }

    fn gate(&self, ctx: &RequestCtx, auth: &Option<Vec<String>>) -> Result<(), HttpError> {
        let Some(groups) = auth else {
            return Ok(());
        };
        if !ctx.authenticated() {
            return Err(HttpError::unauthorized("Authentication required"));
        }
        if !ctx.authorize(groups) {
            return Err(HttpError::forbidden("not permitted"));
        }
        Ok(())
    }

    fn compressible(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.compress.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Middleware for ContentWare {
    async fn handle(&self, ctx: &mut RequestCtx, scope: &SiteScope) -> Result<Outcome, HttpError> {
        match ctx.method {
            http::Method::GET | http::Method::HEAD => self.serve(ctx, scope).await,
            http::Method::POST => self.upload(ctx).await,
            _ => Err(HttpError::MethodNotAllowed),
        }
    }
}

impl ContentWare {
    async fn serve(&self, ctx: &mut RequestCtx, scope: &SiteScope) -> Result<Outcome, HttpError> {
        self.gate(ctx, &self.get_auth)?;

        let rel = ctx
            .param("splat")
            .map(str::to_string)
            .unwrap_or_else(|| ctx.url.pathname.trim_start_matches('/').to_string());
        let mut abs = resolve_safe(&self.root, &rel)?;

        let Ok(meta) = tokio::fs::symlink_metadata(&abs).await else {
            return Ok(Outcome::Next);
        };
        if meta.file_type().is_symlink() {
            debug!(path = %abs.display(), "symlink skipped");
            return Ok(Outcome::Next);
        }

        if meta.is_dir() {
            let index = abs.join(&self.index);
            if tokio::fs::metadata(&index).await.is_ok() {
                abs = index;
            } else if self.indexing {
                return self.listing(&abs).await;
            } else {
                return Err(HttpError::forbidden("directory listing disabled"));
            }
        }

        let entry = scope
            .cache
            .fetch(&abs, &ctx.url.pathname, self.compressible(&abs))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => HttpError::not_found(ctx.url.pathname.clone()),
                _ => HttpError::internal(format!("content read: {e}")),
            })?;

        // Conditional GET first: an unchanged fingerprint costs no body.
        if entry.not_modified(
            ctx.header("if-none-match"),
            ctx.header("if-modified-since"),
        ) {
            return Ok(Outcome::Content(ContentResponse {
                status: 304,
                headers: vec![("ETag".into(), entry.etag_strong())],
                body: ContentBody::Bytes(bytes::Bytes::new()),
            }));
        }

        let gzip_ok = ctx
            .header("accept-encoding")
            .map(|ae| ae.split(',').any(|e| e.trim().starts_with("gzip")))
            .unwrap_or(false);

        let mut headers = vec![
            ("Content-Type".to_string(), entry.mime.clone()),
            ("Cache-Control".to_string(), self.cache_header.clone()),
            ("Last-Modified".to_string(), entry.last_modified()),
        ];

        let body = if let Some(raw) = &entry.raw {
            // Buffered plan: exact Content-Length from pre-computed bytes.
            match (&entry.gzip, gzip_ok) {
                (Some(gz), true) => {
                    headers.push(("Content-Encoding".into(), "gzip".into()));
                    headers.push(("Vary".into(), "Accept-Encoding".into()));
                    headers.push(("ETag".into(), entry.etag_gzip()));
                    ContentBody::Bytes(gz.clone())
                }
                _ => {
                    headers.push(("ETag".into(), entry.etag_strong()));
                    ContentBody::Bytes(raw.clone())
                }
            }
        } else {
            // Streaming plan for entries over the cache ceiling.
            let file = tokio::fs::File::open(&abs)
                .await
                .map_err(|e| HttpError::internal(format!("content open: {e}")))?;
            if gzip_ok && self.compressible(&abs) {
                headers.push(("Content-Encoding".into(), "gzip".into()));
                headers.push(("Vary".into(), "Accept-Encoding".into()));
                headers.push(("ETag".into(), entry.etag_gzip()));
                ContentBody::Stream(stream_file_gzip(file, abs.clone()))
            } else {
                headers.push(("Content-Length".into(), entry.size.to_string()));
                headers.push(("ETag".into(), entry.etag_strong()));
                ContentBody::Stream(stream_file(file, abs.clone()))
            }
        };

        Ok(Outcome::Content(ContentResponse {
            status: 200,
            headers,
            body,
        }))
    }

    async fn listing(&self, dir: &Path) -> Result<Outcome, HttpError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| HttpError::internal(format!("listing: {e}")))?;
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            let mut name = entry.file_name().to_string_lossy().to_string();
            if is_dir {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        let rel = dir.strip_prefix(&self.root).unwrap_or(dir).display();
        let mut html = format!("<!DOCTYPE html>\n<html><head><title>Index of /{rel}</title></head><body>\n<h1>Index of /{rel}</h1>\n<ul>\n");
        for name in names {
            html.push_str(&format!("<li><a href=\"{name}\">{name}</a></li>\n"));
        }
        html.push_str("</ul></body></html>\n");

        Ok(Outcome::Content(ContentResponse {
            status: 200,
            headers: vec![("Content-Type".into(), "text/html; charset=utf-8".into())],
            body: ContentBody::Bytes(html.into()),
        }))
    }

    async fn upload(&self, ctx: &mut RequestCtx) -> Result<Outcome, HttpError> {
        self.gate(ctx, &self.post_auth)?;

        let (fields, files) = match &ctx.body {
            crate::body::ParsedBody::Upload { fields, files } => (fields.clone(), files.clone()),
            _ => return Err(HttpError::bad_request("multipart upload body required")),
        };

        let folder = fields
            .get("folder")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let force = matches!(
            fields.get("force").and_then(Value::as_str),
            Some("true") | Some("1")
        );
        let backup = fields
            .get("backup")
            .and_then(Value::as_str)
            .filter(|b| !b.is_empty());

        let rel_dir = format!(
            "{}/{}",
            ctx.url.pathname.trim_start_matches('/'),
            folder
        );
        let dir = resolve_safe(&self.root, &rel_dir)?;

        let mut report = Vec::new();
        for file in &files {
            let dest = resolve_safe(&dir, &file.filename)?;
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| HttpError::internal(format!("upload dir: {e}")))?;
            }

            if tokio::fs::metadata(&dest).await.is_ok() {
                if let Some(backup) = backup {
                    let sibling = dest
                        .parent()
                        .unwrap_or(&self.root)
                        .join(backup);
                    tokio::fs::copy(&dest, &sibling)
                        .await
                        .map_err(|e| HttpError::internal(format!("backup: {e}")))?;
                    info!(from = %dest.display(), to = %sibling.display(), "existing file backed up");
                } else if !force {
                    warn!(path = %dest.display(), "upload skipped, file exists");
                    report.push(json!({"name": file.filename, "status": "skipped"}));
                    continue;
                }
            }

            move_file(&file.temp_file, &dest).await?;
            info!(path = %dest.display(), bytes = file.size, "file uploaded");
            report.push(json!({"name": file.filename, "status": "ok", "size": file.size}));
        }

        Ok(Outcome::Json(Value::Array(report)))
    }
}

/// Rename, falling back to copy+remove across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<(), HttpError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| HttpError::internal(format!("upload move: {e}")))?;
    let _ = tokio::fs::remove_file(from).await;
    Ok(())
}

/// Join `rel` under `root`, refusing any traversal out of the root.
pub fn resolve_safe(root: &Path, rel: &str) -> Result<PathBuf, HttpError> {
    let rel = rel.trim_start_matches('/');
    let mut out = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(HttpError::forbidden("path escapes content root"));
            }
            _ => return Err(HttpError::forbidden("absolute path refused")),
        }
    }
    if !out.starts_with(root) {
        return Err(HttpError::forbidden("path escapes content root"));
    }
    Ok(out)
}
