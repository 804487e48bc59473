//! Auxiliary REST routes: the type definitions download and consumer routes.

use crate::middleware::unmatched;
use crate::typedefs::TypeDefinitions;
use axum::{
    extract::State,
    handler::Handler,
    http::header,
    response::IntoResponse,
    routing::{get, MethodRouter},
    Router,
};
use std::collections::HashSet;

/// Path of the type definitions download.
pub const TYPES_PATH: &str = "/types";

const TYPES_FILENAME: &str = "graphql.d.ts";

/// A consumer GET route mounted under the REST path.
pub struct CustomRoute {
    path: String,
    handler: MethodRouter,
}

impl CustomRoute {
    /// `path` is normalized to start with `/`.
    pub fn new<H, T>(path: impl AsRef<str>, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        Self {
            path: normalize_route_path(path.as_ref()),
            handler: get(handler),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for CustomRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomRoute").field("path", &self.path).finish()
    }
}

/// Prefix `path` with `/` unless it already starts with one.
pub fn normalize_route_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Router mounted at the configured REST path.
#[derive(Debug, Default)]
pub struct RestRouter {
    type_definitions: TypeDefinitions,
    routes: Vec<CustomRoute>,
}

impl RestRouter {
    pub fn new(type_definitions: TypeDefinitions) -> Self {
        Self {
            type_definitions,
            routes: Vec::new(),
        }
    }

    pub fn register_custom_routes<I>(&mut self, routes: I)
    where
        I: IntoIterator<Item = CustomRoute>,
    {
        self.routes.extend(routes);
    }

    pub fn into_router(self) -> Router {
        let mut router = Router::new()
            .route(TYPES_PATH, get(download_types))
            .with_state(self.type_definitions);

        let mut mounted: HashSet<String> = HashSet::from([TYPES_PATH.to_string()]);
        for route in self.routes {
            if !mounted.insert(route.path.clone()) {
                tracing::warn!(path = %route.path, "REST route already registered, skipping");
                continue;
            }
            tracing::debug!(path = %route.path, "custom REST route registered");
            router = router.route(&route.path, route.handler);
        }
        router.method_not_allowed_fallback(unmatched)
    }
}

async fn download_types(State(definitions): State<TypeDefinitions>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{TYPES_FILENAME}\""),
            ),
        ],
        definitions.get(),
    )
}
