//! Route table: Express-style patterns compiled once to matchers.
//!
//! Routes are evaluated in insertion order. A route matches when its verb
//! accepts the request method and its compiled matcher accepts the path;
//! the matcher yields the extracted named params. Middleware may decline a
//! matched route by returning `Outcome::Next`, delegating to the next
//! match.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::pipeline::Middleware;

/// One entry of a site's route table.
pub struct Route {
    pub method: String,
    pub pattern: String,
    matcher: Matcher,
    pub handler: Arc<dyn Middleware>,
}

impl Route {
    /// Compile `pattern` once. Supported syntax: literal segments,
    /// `:name`, `:name(regex)`, an optional-segment `?` suffix, and a
    /// trailing `*` splat captured as `splat`.
    pub fn new(
        method: impl Into<String>,
        pattern: &str,
        handler: Arc<dyn Middleware>,
    ) -> Result<Self, RoutePatternError> {
        Ok(Self {
            method: method.into().to_lowercase(),
            pattern: pattern.to_string(),
            matcher: Matcher::compile(pattern)?,
            handler,
        })
    }

    /// Whether this route's verb accepts `method`. `any` accepts all and
    /// `get` also accepts `head`.
    pub fn verb_match(&self, method: &http::Method) -> bool {
        match self.method.as_str() {
            "any" => true,
            "get" => matches!(*method, http::Method::GET | http::Method::HEAD),
            verb => method.as_str().eq_ignore_ascii_case(verb),
        }
    }

    /// Path match, yielding extracted params.
    pub fn path_match(&self, path: &str) -> Option<HashMap<String, String>> {
        self.matcher.matches(path)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid route pattern `{pattern}`: {reason}")]
pub struct RoutePatternError {
    pattern: String,
    reason: String,
}

struct Matcher {
    re: Regex,
    /// Generated group name → param name, avoiding collisions with groups
    /// inside user-supplied segment regexes.
    names: Vec<(String, String)>,
}

impl Matcher {
    fn compile(pattern: &str) -> Result<Self, RoutePatternError> {
        let bad = |reason: String| RoutePatternError {
            pattern: pattern.to_string(),
            reason,
        };

        let mut src = String::from("^");
        let mut names = Vec::new();
        for (i, segment) in pattern.split('/').filter(|s| !s.is_empty()).enumerate() {
            let (segment, optional) = match segment.strip_suffix('?') {
                Some(s) => (s, true),
                None => (segment, false),
            };
            let group = format!("hp{i}");

            let piece = if segment == "*" {
                names.push((group.clone(), "splat".to_string()));
                format!("/(?P<{group}>.*)")
            } else if let Some(rest) = segment.strip_prefix(':') {
                let (name, inner) = match rest.split_once('(') {
                    Some((name, re)) => {
                        let re = re
                            .strip_suffix(')')
                            .ok_or_else(|| bad(format!("unclosed regex in `{segment}`")))?;
                        (name, re.to_string())
                    }
                    None => (rest, "[^/]+".to_string()),
                };
                names.push((group.clone(), name.to_string()));
                format!("/(?P<{group}>{inner})")
            } else {
                format!("/{}", regex::escape(segment))
            };

            if optional {
                src.push_str(&format!("(?:{piece})?"));
            } else {
                src.push_str(&piece);
            }
        }
        if src == "^" {
            src.push('/');
        }
        src.push_str("/?$");

        let re = Regex::new(&src).map_err(|e| bad(e.to_string()))?;
        Ok(Self { re, names })
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.re.captures(path)?;
        let mut params = HashMap::new();
        for (group, name) in &self.names {
            if let Some(m) = caps.name(group) {
                params.insert(name.clone(), m.as_str().to_string());
            }
        }
        Some(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Middleware, Outcome};
    use crate::context::RequestCtx;
    use crate::scope::SiteScope;
    use haven_common::HttpError;

    struct Nop;

    #[async_trait::async_trait]
    impl Middleware for Nop {
        async fn handle(
            &self,
            _ctx: &mut RequestCtx,
            _scope: &SiteScope,
        ) -> Result<Outcome, HttpError> {
            Ok(Outcome::Next)
        }
    }

    fn route(method: &str, pattern: &str) -> Route {
        Route::new(method, pattern, Arc::new(Nop)).unwrap()
    }

    #[test]
    fn literal_patterns_match_exactly() {
        let r = route("get", "/login");
        assert!(r.path_match("/login").is_some());
        assert!(r.path_match("/login/").is_some());
        assert!(r.path_match("/login/x").is_none());
        assert!(r.path_match("/logout").is_none());
    }

    #[test]
    fn named_params_are_extracted() {
        let r = route("any", "/user/:action/:user?/:opt?");
        let params = r.path_match("/user/code/alice").unwrap();
        assert_eq!(params["action"], "code");
        assert_eq!(params["user"], "alice");
        assert!(params.get("opt").is_none());

        let params = r.path_match("/user/code/alice/mail").unwrap();
        assert_eq!(params["opt"], "mail");

        let params = r.path_match("/user/names").unwrap();
        assert_eq!(params["action"], "names");
        assert!(params.get("user").is_none());
    }

    #[test]
    fn segment_regexes_constrain_matches() {
        let r = route("get", "/files/:name([a-z0-9]+\\.txt)");
        assert!(r.path_match("/files/notes.txt").is_some());
        assert!(r.path_match("/files/Notes.TXT").is_none());
    }

    #[test]
    fn splat_captures_the_rest() {
        let r = route("any", "/*");
        let params = r.path_match("/a/b/c.html").unwrap();
        assert_eq!(params["splat"], "a/b/c.html");
        assert!(r.path_match("/").is_some());
    }

    #[test]
    fn verb_matching() {
        let r = route("get", "/x");
        assert!(r.verb_match(&http::Method::GET));
        assert!(r.verb_match(&http::Method::HEAD));
        assert!(!r.verb_match(&http::Method::POST));

        let r = route("any", "/x");
        assert!(r.verb_match(&http::Method::DELETE));

        let r = route("post", "/x");
        assert!(r.verb_match(&http::Method::POST));
        assert!(!r.verb_match(&http::Method::HEAD));
    }
}
