//! Middleware registry and the built-in middlewares.
//!
//! Middlewares are grouped in five buckets that the server mounts at fixed
//! points of the composition sequence:
//!
//! - `global`: wraps the whole application
//! - `before_apollo`: wraps the GraphQL routes
//! - `before_apollo_dev`: wraps the GraphQL routes, development tiers only
//! - `after_apollo`: post-processes every response (404 classification, error view)
//! - `dev`: like `after_apollo`, development tiers only
//!
//! Request-phase buckets run in registration order, the first registered
//! middleware seeing the request first. Response-phase buckets (`after_apollo`,
//! `dev`) see the response in registration order, the first registered
//! middleware seeing it first.

use crate::views::ErrorView;
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, HeaderName, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use cookie::Cookie;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Middleware trait for processing requests
///
/// A middleware either answers the request itself or hands it to `next`.
///
/// # Example
///
/// ```rust
/// use axum::{extract::Request, middleware::Next, response::Response};
/// use graphql_scaffold::middleware::Middleware;
///
/// struct Tag;
///
/// #[async_trait::async_trait]
/// impl Middleware for Tag {
///     async fn handle(&self, req: Request, next: Next) -> Response {
///         let mut res = next.run(req).await;
///         res.headers_mut().insert("x-tag", "1".parse().unwrap());
///         res
///     }
/// }
/// ```
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, req: Request, next: Next) -> Response;

    /// Name used in logs
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Shared middleware handle
pub type SharedMiddleware = Arc<dyn Middleware>;

/// Adapter turning an async closure into a [`Middleware`].
pub struct FnMiddleware<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Response> + Send + 'static,
{
    async fn handle(&self, req: Request, next: Next) -> Response {
        (self.f)(req, next).await
    }
}

/// Wrap an async closure as a shared middleware.
pub fn middleware_fn<F, Fut>(f: F) -> SharedMiddleware
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(FnMiddleware { f })
}

/// The five middleware buckets.
#[derive(Clone, Default)]
pub struct Middlewares {
    pub global: Vec<SharedMiddleware>,
    pub before_apollo: Vec<SharedMiddleware>,
    pub before_apollo_dev: Vec<SharedMiddleware>,
    pub after_apollo: Vec<SharedMiddleware>,
    pub dev: Vec<SharedMiddleware>,
}

impl Middlewares {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in buckets: 404 classification and error rendering.
    pub fn builtin(view: Arc<ErrorView>) -> Self {
        Self {
            after_apollo: vec![
                Arc::new(NotFound) as SharedMiddleware,
                Arc::new(ErrorRenderer::sanitized(view.clone())),
            ],
            dev: vec![Arc::new(ErrorRenderer::verbose(view))],
            ..Self::default()
        }
    }

    pub fn with_global<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.global.push(Arc::new(middleware));
        self
    }

    pub fn with_before_apollo<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.before_apollo.push(Arc::new(middleware));
        self
    }

    pub fn with_before_apollo_dev<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.before_apollo_dev.push(Arc::new(middleware));
        self
    }

    pub fn with_after_apollo<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.after_apollo.push(Arc::new(middleware));
        self
    }

    pub fn with_dev<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.dev.push(Arc::new(middleware));
        self
    }
}

impl fmt::Debug for Middlewares {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |bucket: &[SharedMiddleware]| -> Vec<&'static str> {
            bucket.iter().map(|m| m.name()).collect()
        };
        f.debug_struct("Middlewares")
            .field("global", &names(&self.global))
            .field("before_apollo", &names(&self.before_apollo))
            .field("before_apollo_dev", &names(&self.before_apollo_dev))
            .field("after_apollo", &names(&self.after_apollo))
            .field("dev", &names(&self.dev))
            .finish()
    }
}

/// Consumer middlewares first, built-ins second.
pub fn chain(consumer: &[SharedMiddleware], builtin: &[SharedMiddleware]) -> Vec<SharedMiddleware> {
    consumer.iter().chain(builtin).cloned().collect()
}

/// Wrap `router` so `chain[0]` sees the request first.
pub fn layer_request_chain<S>(mut router: Router<S>, chain: &[SharedMiddleware]) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    for middleware in chain.iter().rev() {
        router = wrap(router, middleware.clone());
    }
    router
}

/// Wrap `router` so `chain[0]` sees the response first.
pub fn layer_response_chain<S>(mut router: Router<S>, chain: &[SharedMiddleware]) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    for middleware in chain {
        router = wrap(router, middleware.clone());
    }
    router
}

fn wrap<S>(router: Router<S>, middleware: SharedMiddleware) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(from_fn(move |req: Request, next: Next| {
        let middleware = middleware.clone();
        async move { middleware.handle(req, next).await }
    }))
}

/// A request-level failure, rendered by the `after_apollo` error renderer.
///
/// Handlers can return `Result<_, RequestFailure>`; the failure travels in the
/// response extensions until a renderer turns it into an error view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    pub status: StatusCode,
    pub message: String,
    pub detail: Option<String>,
}

impl RequestFailure {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
        }
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not Found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.message)
    }
}

impl std::error::Error for RequestFailure {}

impl IntoResponse for RequestFailure {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.message.clone()).into_response();
        response.extensions_mut().insert(self);
        response
    }
}

impl From<crate::Error> for RequestFailure {
    fn from(err: crate::Error) -> Self {
        RequestFailure::internal(err.to_string()).with_detail(format!("{err:?}"))
    }
}

/// Marks a response produced because no route (or no method) matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unmatched;

/// Fallback handler for unmatched paths and methods.
///
/// The bare 404 it returns is marked with [`Unmatched`] so [`NotFound`] can
/// tell it apart from a 404 a handler chose to return.
pub async fn unmatched() -> Response {
    let mut response = StatusCode::NOT_FOUND.into_response();
    response.extensions_mut().insert(Unmatched);
    response
}

/// Classifies [`Unmatched`] responses as not-found [`RequestFailure`]s.
///
/// Any other response, including a handler-issued 404, passes through as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFound;

#[async_trait]
impl Middleware for NotFound {
    async fn handle(&self, req: Request, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let response = next.run(req).await;
        if response.extensions().get::<Unmatched>().is_some() {
            tracing::debug!(%method, %path, "no route matched");
            return RequestFailure::not_found().into_response();
        }
        response
    }
}

/// Renders responses carrying a [`RequestFailure`] through the error view.
///
/// The failure stays attached so a later renderer can render it again.
#[derive(Debug, Clone)]
pub struct ErrorRenderer {
    view: Arc<ErrorView>,
    verbose: bool,
}

impl ErrorRenderer {
    /// Message only.
    pub fn sanitized(view: Arc<ErrorView>) -> Self {
        Self {
            view,
            verbose: false,
        }
    }

    /// Message plus diagnostic detail.
    pub fn verbose(view: Arc<ErrorView>) -> Self {
        Self {
            view,
            verbose: true,
        }
    }
}

#[async_trait]
impl Middleware for ErrorRenderer {
    async fn handle(&self, req: Request, next: Next) -> Response {
        let response = next.run(req).await;
        let Some(failure) = response.extensions().get::<RequestFailure>().cloned() else {
            return response;
        };

        if failure.status.is_server_error() {
            tracing::error!(status = %failure.status, message = %failure.message, "request failed");
        }

        let mut rendered = self.view.render(&failure, self.verbose);
        rendered.extensions_mut().insert(failure);
        rendered
    }

    fn name(&self) -> &'static str {
        if self.verbose {
            "DevErrorRenderer"
        } else {
            "ErrorRenderer"
        }
    }
}

/// Parsed request cookies, available as a request extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCookies(pub BTreeMap<String, String>);

impl RequestCookies {
    /// Parse a `cookie` header; percent-encoded values are decoded and
    /// malformed pairs are skipped.
    pub fn parse(header: &str) -> Self {
        let cookies = Cookie::split_parse_encoded(header)
            .filter_map(|cookie| match cookie {
                Ok(cookie) => Some((
                    cookie.name().to_string(),
                    cookie.value_trimmed().to_string(),
                )),
                Err(e) => {
                    tracing::debug!(error = %e, "skipping malformed cookie");
                    None
                }
            })
            .collect();
        Self(cookies)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Parses the `cookie` header into [`RequestCookies`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CookieParser;

#[async_trait]
impl Middleware for CookieParser {
    async fn handle(&self, mut req: Request, next: Next) -> Response {
        let cookies = req
            .headers()
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(RequestCookies::parse)
            .fold(RequestCookies::default(), |mut acc, parsed| {
                acc.0.extend(parsed.0);
                acc
            });
        req.extensions_mut().insert(cookies);
        next.run(req).await
    }
}

/// Removes the `x-powered-by` fingerprinting header from responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct HidePoweredBy;

#[async_trait]
impl Middleware for HidePoweredBy {
    async fn handle(&self, req: Request, next: Next) -> Response {
        let mut response = next.run(req).await;
        response
            .headers_mut()
            .remove(HeaderName::from_static("x-powered-by"));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        routing::get,
    };
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for Record {
        async fn handle(&self, req: Request, next: Next) -> Response {
            self.log.lock().unwrap().push(self.name);
            next.run(req).await
        }
    }

    fn record(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> SharedMiddleware {
        Arc::new(Record {
            name,
            log: log.clone(),
        })
    }

    async fn send(router: Router, uri: &str) -> Response {
        router
            .oneshot(http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn consumer_middlewares_run_before_builtins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let consumer = vec![record("C1", &log), record("C2", &log)];
        let builtin = vec![record("B1", &log), record("B2", &log)];

        let mounted = chain(&consumer, &builtin);
        let names: Vec<_> = mounted.iter().map(|m| m.name()).collect();
        assert_eq!(names.len(), 4);

        let router = layer_request_chain(Router::new().route("/", get(|| async { "ok" })), &mounted);
        let response = send(router, "/").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*log.lock().unwrap(), vec!["C1", "C2", "B1", "B2"]);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let gate = middleware_fn(|_req: Request, _next: Next| async {
            StatusCode::UNAUTHORIZED.into_response()
        });
        let router =
            layer_request_chain(Router::new().route("/", get(|| async { "ok" })), &[gate]);

        let response = send(router, "/").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unmatched_route_renders_not_found() {
        let view = Arc::new(ErrorView::builtin());
        let builtin = Middlewares::builtin(view);
        let router = Router::new()
            .route("/", get(|| async { "ok" }))
            .fallback(unmatched);
        let router = layer_response_chain(router, &builtin.after_apollo);

        let response = send(router, "/missing").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let failure = response.extensions().get::<RequestFailure>().cloned();
        assert_eq!(failure, Some(RequestFailure::not_found()));

        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("Not Found"));
    }

    #[tokio::test]
    async fn handler_issued_not_found_passes_through() {
        let view = Arc::new(ErrorView::builtin());
        let builtin = Middlewares::builtin(view);
        let router = Router::new()
            .route(
                "/user",
                get(|| async { (StatusCode::NOT_FOUND, "user 42 does not exist") }),
            )
            .fallback(unmatched);
        let router = layer_response_chain(router, &builtin.after_apollo);

        let response = send(router, "/user").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.extensions().get::<RequestFailure>().is_none());

        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        assert_eq!(&body[..], b"user 42 does not exist");
    }

    #[tokio::test]
    async fn handler_failures_are_sanitized_unless_dev() {
        let view = Arc::new(ErrorView::builtin());
        let builtin = Middlewares::builtin(view);
        let routes = || {
            Router::new().route(
                "/boom",
                get(|| async {
                    Err::<&'static str, _>(
                        RequestFailure::internal("kaboom").with_detail("stack: resolver.rs:42"),
                    )
                }),
            )
        };

        let production = layer_response_chain(routes(), &builtin.after_apollo);
        let response = send(production, "/boom").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("kaboom"));
        assert!(!body.contains("resolver.rs:42"));

        let after: Vec<_> = chain(&builtin.after_apollo, &builtin.dev);
        let development = layer_response_chain(routes(), &after);
        let response = send(development, "/boom").await;
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("resolver.rs:42"));
    }

    #[tokio::test]
    async fn cookie_parser_exposes_cookies() {
        let router = Router::new().route(
            "/",
            get(|axum::Extension(cookies): axum::Extension<RequestCookies>| async move {
                cookies.get("session").unwrap_or("none").to_string()
            }),
        );
        let router = layer_request_chain(router, &[Arc::new(CookieParser) as SharedMiddleware]);

        let response = router
            .oneshot(
                http::Request::builder()
                    .uri("/")
                    .header(header::COOKIE, "theme=dark; session=abc%20123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"abc 123");
    }

    #[tokio::test]
    async fn powered_by_header_is_removed() {
        let leaky = middleware_fn(|req: Request, next: Next| async move {
            let mut res = next.run(req).await;
            res.headers_mut()
                .insert("x-powered-by", "Express".parse().unwrap());
            res
        });
        let router = Router::new().route("/", get(|| async { "ok" }));
        let router = layer_request_chain(router, &[Arc::new(HidePoweredBy) as SharedMiddleware, leaky]);

        let response = send(router, "/").await;
        assert!(response.headers().get("x-powered-by").is_none());
    }

    #[test]
    fn cookie_header_parsing() {
        let cookies = RequestCookies::parse("a=1; b=\"two\"; =skip; c");
        assert_eq!(cookies.get("a"), Some("1"));
        assert_eq!(cookies.get("b"), Some("two"));
        assert_eq!(cookies.0.len(), 2);
    }

    #[test]
    fn cookie_values_are_percent_decoded() {
        let cookies = RequestCookies::parse("token=a%20b%3Bc;  lang=fr");
        assert_eq!(cookies.get("token"), Some("a b;c"));
        assert_eq!(cookies.get("lang"), Some("fr"));
        assert!(cookies.get("missing").is_none());
    }
}
