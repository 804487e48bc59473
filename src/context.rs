//! Per-request GraphQL context.
//!
//! Every GraphQL request gets a [`Context`] in its data. The default context
//! carries the raw `cookie` header; a consumer-supplied [`ContextFn`] can add
//! fields, and its fields win on key collision.

use axum::http::{header, HeaderMap};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Consumer hook producing extra context fields from the request headers.
pub type ContextFn = Arc<dyn Fn(&HeaderMap) -> Map<String, Value> + Send + Sync>;

/// Context passed to resolvers
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Request headers
    pub headers: HeaderMap,

    /// Merged context fields
    pub values: Map<String, Value>,
}

impl Context {
    /// Default context: headers plus the `cookie` field.
    pub fn from_headers(headers: HeaderMap) -> Self {
        let mut values = Map::new();
        let cookie = headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null);
        values.insert("cookie".to_string(), cookie);
        Self { headers, values }
    }

    /// Raw cookie header, if any
    pub fn cookie(&self) -> Option<&str> {
        self.values.get("cookie").and_then(Value::as_str)
    }

    /// Insert context data
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Get context data
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Builds the context for each request: default fields, then consumer fields.
#[derive(Clone, Default)]
pub struct ContextBuilder {
    custom: Option<ContextFn>,
}

impl ContextBuilder {
    pub fn new(custom: Option<ContextFn>) -> Self {
        Self { custom }
    }

    pub fn build(&self, headers: HeaderMap) -> Context {
        let mut ctx = Context::from_headers(headers);
        if let Some(custom) = &self.custom {
            let extra = custom(&ctx.headers);
            ctx.values.extend(extra);
        }
        ctx
    }
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_cookie() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("session=abc"));
        headers
    }

    #[test]
    fn default_context_has_cookie() {
        let ctx = ContextBuilder::default().build(headers_with_cookie());
        assert_eq!(ctx.cookie(), Some("session=abc"));

        let ctx = ContextBuilder::default().build(HeaderMap::new());
        assert_eq!(ctx.get("cookie"), Some(&Value::Null));
    }

    #[test]
    fn consumer_fields_win_on_collision() {
        let custom: ContextFn = Arc::new(|headers: &HeaderMap| {
            let mut map = Map::new();
            map.insert("cookie".into(), Value::String("overridden".into()));
            map.insert(
                "hasAuth".into(),
                Value::Bool(headers.contains_key(header::AUTHORIZATION)),
            );
            map
        });

        let ctx = ContextBuilder::new(Some(custom)).build(headers_with_cookie());
        assert_eq!(ctx.cookie(), Some("overridden"));
        assert_eq!(ctx.get("hasAuth"), Some(&Value::Bool(false)));
    }
}
