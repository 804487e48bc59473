//! CORS policy built from the `cors` config section.

use crate::config::CorsConfig;
use crate::middleware::{layer_request_chain, Middleware, SharedMiddleware};
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

/// Origin allow-list, accepted methods and preflight status.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    origins: Arc<Vec<HeaderValue>>,
    methods: Vec<Method>,
    options_success_status: StatusCode,
}

impl CorsPolicy {
    /// `None` when CORS is disabled.
    pub fn from_config(config: &CorsConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        if config.preflight_continue {
            tracing::warn!(
                "cors.preflightContinue is not supported, preflight requests are answered by the CORS layer"
            );
        }

        let origins = config
            .origin
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();

        let methods = config
            .methods
            .iter()
            .filter_map(|method| {
                let name = method.trim().to_ascii_uppercase();
                match Method::from_bytes(name.as_bytes()) {
                    Ok(method) => Some(method),
                    Err(_) => {
                        tracing::warn!(%method, "ignoring invalid CORS method");
                        None
                    }
                }
            })
            .collect();

        let options_success_status = StatusCode::from_u16(config.options_success_status)
            .unwrap_or_else(|_| {
                tracing::warn!(
                    status = config.options_success_status,
                    "invalid cors.optionsSuccessStatus, using 204"
                );
                StatusCode::NO_CONTENT
            });

        Some(Self {
            origins: Arc::new(origins),
            methods,
            options_success_status,
        })
    }

    /// Requests without an `Origin` header are always allowed.
    pub fn is_allowed(&self, origin: Option<&HeaderValue>) -> bool {
        match origin {
            None => true,
            Some(origin) => self.origins.contains(origin),
        }
    }

    pub fn layer(&self) -> CorsLayer {
        let origins = self.origins.clone();
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
                origins.contains(origin)
            }))
            .allow_methods(AllowMethods::list(self.methods.iter().cloned()))
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
    }

    /// Wrap `router` with the CORS layer and the preflight status override.
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let status: SharedMiddleware = Arc::new(PreflightStatus {
            status: self.options_success_status,
        });
        layer_request_chain(router.layer(self.layer()), &[status])
    }
}

/// Rewrites the status of successful preflight responses.
#[derive(Debug, Clone, Copy)]
struct PreflightStatus {
    status: StatusCode,
}

#[async_trait]
impl Middleware for PreflightStatus {
    async fn handle(&self, req: Request, next: Next) -> Response {
        let preflight = req.method() == Method::OPTIONS
            && req
                .headers()
                .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);
        let mut response = next.run(req).await;
        if preflight && response.status().is_success() {
            *response.status_mut() = self.status;
        }
        response
    }
}
