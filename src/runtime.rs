//! Query layer mount: HTTP and WebSocket integration of the GraphQL schema.

use crate::config::Configuration;
use crate::context::{ContextBuilder, ContextFn};
use crate::cors::CorsPolicy;
use crate::error::Result;
use crate::middleware::{
    chain, layer_request_chain, unmatched, HidePoweredBy, Middlewares, RequestFailure,
    SharedMiddleware,
};
use crate::pubsub::PubSub;
use crate::schema::{builtin_resolvers, DynamicSchema, Resolver, SchemaBuilder, ValidationRules};
use async_graphql::http::{
    parse_query_string, playground_source, GraphQLPlaygroundConfig, ALL_WEBSOCKET_PROTOCOLS,
};
use async_graphql::ServerError;
use async_graphql_axum::{GraphQLProtocol, GraphQLRequest, GraphQLResponse, GraphQLWebSocket};
use axum::{
    extract::{RawQuery, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Extension key holding diagnostic detail, stripped outside development.
pub const DETAIL_EXTENSION: &str = "detail";

/// Hook applied to every GraphQL response before it is sent.
pub type FormatResponseFn =
    Arc<dyn Fn(async_graphql::Response) -> async_graphql::Response + Send + Sync>;

/// Hook applied to every GraphQL error before it is sent.
pub type FormatErrorFn = Arc<dyn Fn(ServerError) -> ServerError + Send + Sync>;

/// Consumer-supplied pieces of the query layer.
#[derive(Default)]
pub struct QueryLayerOptions {
    pub resolvers: Vec<Resolver>,
    pub middlewares: Middlewares,
    pub context: Option<ContextFn>,
    pub format_response: Option<FormatResponseFn>,
    pub format_error: Option<FormatErrorFn>,
    pub validation: ValidationRules,
}

/// Result of [`QueryLayer::mount`].
pub struct MountedQueryLayer {
    /// GraphQL routes with their request-phase middlewares and CORS applied
    pub router: Router,
    pub schema: DynamicSchema,
    /// Middlewares the caller wraps around the whole application
    pub global: Vec<SharedMiddleware>,
}

/// Mounts the GraphQL schema at a path.
pub struct QueryLayer {
    path: String,
    development: bool,
    cors: Option<CorsPolicy>,
    configuration: Option<Arc<Configuration>>,
    pubsub: PubSub,
}

impl QueryLayer {
    pub fn new(path: impl Into<String>, development: bool) -> Self {
        Self {
            path: path.into(),
            development,
            cors: None,
            configuration: None,
            pubsub: PubSub::new(),
        }
    }

    pub fn with_cors(mut self, cors: Option<CorsPolicy>) -> Self {
        self.cors = cors;
        self
    }

    pub fn with_configuration(mut self, configuration: Arc<Configuration>) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn with_pubsub(mut self, pubsub: PubSub) -> Self {
        self.pubsub = pubsub;
        self
    }

    /// Build the schema and the routes serving it.
    pub fn mount(self, options: QueryLayerOptions) -> Result<MountedQueryLayer> {
        let QueryLayerOptions {
            resolvers,
            middlewares,
            context,
            format_response,
            format_error,
            validation,
        } = options;

        let mut global: Vec<SharedMiddleware> = vec![Arc::new(HidePoweredBy)];
        global.extend(middlewares.global.iter().cloned());

        let mut schema = SchemaBuilder::new()
            .with_resolvers(builtin_resolvers())
            .with_resolvers(resolvers)
            .development(self.development)
            .with_validation_rules(validation)
            .with_pubsub(self.pubsub.clone());
        if let Some(configuration) = self.configuration {
            schema = schema.with_configuration(configuration);
        }
        let schema = schema.build()?;

        let builtin = Middlewares::default();
        let before = chain(&middlewares.before_apollo, &builtin.before_apollo);
        let before_dev = chain(&middlewares.before_apollo_dev, &builtin.before_apollo_dev);

        let handler = Arc::new(QueryHandler {
            schema: schema.clone(),
            context: ContextBuilder::new(context),
            format_response,
            format_error,
            development: self.development,
            path: self.path.clone(),
        });

        let mut router = Router::new().route(
            &self.path,
            post(handle_graphql_post).get(handle_graphql_get),
        );
        if schema.has_subscriptions() {
            router = router.route(&ws_path(&self.path), get(handle_graphql_ws));
        }
        let mut router = router
            .with_state(handler)
            .method_not_allowed_fallback(unmatched);

        if self.development {
            router = layer_request_chain(router, &before_dev);
        }
        router = layer_request_chain(router, &before);

        if let Some(cors) = &self.cors {
            router = cors.apply(router);
        }

        tracing::debug!(
            path = %self.path,
            development = self.development,
            subscriptions = schema.has_subscriptions(),
            "query layer mounted"
        );

        Ok(MountedQueryLayer {
            router,
            schema,
            global,
        })
    }
}

fn ws_path(path: &str) -> String {
    format!("{}/ws", path.trim_end_matches('/'))
}

/// Per-request execution state shared by the route handlers.
struct QueryHandler {
    schema: DynamicSchema,
    context: ContextBuilder,
    format_response: Option<FormatResponseFn>,
    format_error: Option<FormatErrorFn>,
    development: bool,
    path: String,
}

impl QueryHandler {
    async fn execute(
        &self,
        headers: HeaderMap,
        request: async_graphql::Request,
    ) -> async_graphql::Response {
        let ctx = self.context.build(headers);
        let mut response = self.schema.execute(request.data(ctx)).await;

        if !self.development {
            for error in &mut response.errors {
                if let Some(extensions) = error.extensions.as_mut() {
                    extensions.unset(DETAIL_EXTENSION);
                }
            }
        }

        if let Some(format_error) = &self.format_error {
            response.errors = response.errors.into_iter().map(|e| format_error(e)).collect();
        }
        match &self.format_response {
            Some(format_response) => format_response(response),
            None => response,
        }
    }

    fn playground(&self) -> Html<String> {
        Html(playground_source(
            GraphQLPlaygroundConfig::new(&self.path).subscription_endpoint(&ws_path(&self.path)),
        ))
    }
}

/// Handler for POST requests (JSON body or multipart upload)
async fn handle_graphql_post(
    State(handler): State<Arc<QueryHandler>>,
    headers: HeaderMap,
    request: GraphQLRequest,
) -> GraphQLResponse {
    handler.execute(headers, request.into_inner()).await.into()
}

/// GET with an absent or empty `query` serves the playground in development.
async fn handle_graphql_get(
    State(handler): State<Arc<QueryHandler>>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Response {
    let request = match parse_query_string(&raw.unwrap_or_default()) {
        Ok(request) => request,
        Err(e) => {
            return RequestFailure::new(StatusCode::BAD_REQUEST, "Invalid GraphQL request")
                .with_detail(e.to_string())
                .into_response()
        }
    };

    if request.query.is_empty() {
        if handler.development {
            return handler.playground().into_response();
        }
        return RequestFailure::not_found().into_response();
    }

    let response: GraphQLResponse = handler.execute(headers, request).await.into();
    response.into_response()
}

async fn handle_graphql_ws(
    State(handler): State<Arc<QueryHandler>>,
    headers: HeaderMap,
    protocol: GraphQLProtocol,
    upgrade: WebSocketUpgrade,
) -> Response {
    let mut data = async_graphql::Data::default();
    data.insert(handler.context.build(headers));
    let executor = handler.schema.executor();

    upgrade
        .protocols(ALL_WEBSOCKET_PROTOCOLS)
        .on_upgrade(move |stream| {
            GraphQLWebSocket::new(stream, executor, protocol)
                .with_data(data)
                .serve()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::middleware::middleware_fn;
    use crate::schema::RootField;
    use async_graphql::dynamic::{FieldFuture, TypeRef};
    use async_graphql::{ErrorExtensions, Value as GqlValue};
    use axum::{
        body::{to_bytes, Body},
        extract::Request,
        http::{header, Method},
        middleware::Next,
    };
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn whoami() -> Resolver {
        Resolver::new("whoami")
            .query(RootField::new("whoami", TypeRef::named(TypeRef::STRING), |ctx| {
                FieldFuture::new(async move {
                    let context = ctx.data::<Context>()?;
                    let user = context.get("user").and_then(|v| v.as_str()).map(str::to_string);
                    Ok(user.map(GqlValue::from))
                })
            }))
            .query(RootField::new("cookie", TypeRef::named(TypeRef::STRING), |ctx| {
                FieldFuture::new(async move {
                    let context = ctx.data::<Context>()?;
                    Ok(context.cookie().map(|c| GqlValue::from(c.to_string())))
                })
            }))
            .query(RootField::new("fail", TypeRef::named(TypeRef::STRING), |_| {
                FieldFuture::new(async {
                    Err::<Option<GqlValue>, _>(
                        async_graphql::Error::new("boom")
                            .extend_with(|_, e| e.set(DETAIL_EXTENSION, "stack trace")),
                    )
                })
            }))
    }

    fn mount(development: bool, options: QueryLayerOptions) -> MountedQueryLayer {
        QueryLayer::new("/graphql", development)
            .mount(options)
            .expect("query layer mounts")
    }

    async fn post_query(router: Router, query: &str, cookie: Option<&str>) -> serde_json::Value {
        let mut request = http::Request::builder()
            .method(Method::POST)
            .uri("/graphql")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        let body = serde_json::json!({ "query": query }).to_string();
        let response = router
            .oneshot(request.body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn consumer_context_is_merged() {
        let context: ContextFn = Arc::new(|_headers: &HeaderMap| {
            let mut map = serde_json::Map::new();
            map.insert("user".into(), serde_json::Value::String("ada".into()));
            map
        });
        let mounted = mount(
            false,
            QueryLayerOptions {
                resolvers: vec![whoami()],
                context: Some(context),
                ..Default::default()
            },
        );

        let body = post_query(mounted.router, "{ whoami cookie }", Some("sid=42")).await;
        assert_eq!(body["data"]["whoami"], "ada");
        assert_eq!(body["data"]["cookie"], "sid=42");
    }

    #[tokio::test]
    async fn error_detail_only_in_development() {
        let production = mount(
            false,
            QueryLayerOptions {
                resolvers: vec![whoami()],
                ..Default::default()
            },
        );
        let body = post_query(production.router, "{ fail }", None).await;
        assert_eq!(body["errors"][0]["message"], "boom");
        assert!(body["errors"][0]["extensions"].get(DETAIL_EXTENSION).is_none());

        let development = mount(
            true,
            QueryLayerOptions {
                resolvers: vec![whoami()],
                ..Default::default()
            },
        );
        let body = post_query(development.router, "{ fail }", None).await;
        assert_eq!(body["errors"][0]["extensions"][DETAIL_EXTENSION], "stack trace");
    }

    #[tokio::test]
    async fn format_hooks_are_applied() {
        let format_error: FormatErrorFn = Arc::new(|mut err: ServerError| {
            err.message = format!("formatted: {}", err.message);
            err
        });
        let format_response: FormatResponseFn = Arc::new(|mut response: async_graphql::Response| {
            response
                .http_headers
                .insert("x-formatted", axum::http::HeaderValue::from_static("1"));
            response
        });
        let mounted = mount(
            false,
            QueryLayerOptions {
                resolvers: vec![whoami()],
                format_error: Some(format_error),
                format_response: Some(format_response),
                ..Default::default()
            },
        );

        let response = mounted
            .router
            .oneshot(
                http::Request::builder()
                    .method(Method::POST)
                    .uri("/graphql")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"query":"{ fail }"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers().get("x-formatted").unwrap(), "1");
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["errors"][0]["message"], "formatted: boom");
    }

    #[tokio::test]
    async fn playground_served_on_get_in_development() {
        let mounted = mount(
            true,
            QueryLayerOptions {
                resolvers: vec![whoami()],
                ..Default::default()
            },
        );
        let response = mounted
            .router
            .oneshot(http::Request::builder().uri("/graphql").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("GraphQL Playground"));
    }

    #[tokio::test]
    async fn playground_hidden_outside_development() {
        let mounted = mount(
            false,
            QueryLayerOptions {
                resolvers: vec![whoami()],
                ..Default::default()
            },
        );
        let response = mounted
            .router
            .clone()
            .oneshot(http::Request::builder().uri("/graphql").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.extensions().get::<RequestFailure>().is_some());

        let response = mounted
            .router
            .oneshot(
                http::Request::builder()
                    .uri("/graphql?query=%7B%20cookie%20%7D")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_query_string_is_parsed_before_routing() {
        let mounted = mount(
            true,
            QueryLayerOptions {
                resolvers: vec![whoami()],
                ..Default::default()
            },
        );
        let get = |uri: &'static str| {
            mounted
                .router
                .clone()
                .oneshot(http::Request::builder().uri(uri).body(Body::empty()).unwrap())
        };

        // other parameters without a query still open the playground
        let response = get("/graphql?operationName=Whoami&queryId=7").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("GraphQL Playground"));

        let response = get("/graphql?query=%7B%20cookie%20%7D&variables=%7Bnope")
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.extensions().get::<RequestFailure>().is_some());
    }

    #[tokio::test]
    async fn before_apollo_chains_respect_development() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tag = |name: &'static str| {
            let log = log.clone();
            middleware_fn(move |req: Request, next: Next| {
                log.lock().unwrap().push(name);
                async move { next.run(req).await }
            })
        };
        let middlewares = || Middlewares {
            before_apollo: vec![tag("before")],
            before_apollo_dev: vec![tag("dev")],
            ..Default::default()
        };

        let production = mount(
            false,
            QueryLayerOptions {
                resolvers: vec![whoami()],
                middlewares: middlewares(),
                ..Default::default()
            },
        );
        post_query(production.router, "{ cookie }", None).await;
        assert_eq!(*log.lock().unwrap(), vec!["before"]);

        log.lock().unwrap().clear();
        let development = mount(
            true,
            QueryLayerOptions {
                resolvers: vec![whoami()],
                middlewares: middlewares(),
                ..Default::default()
            },
        );
        post_query(development.router, "{ cookie }", None).await;
        assert_eq!(*log.lock().unwrap(), vec!["before", "dev"]);
    }

    #[test]
    fn global_chain_starts_with_header_scrubber() {
        let mounted = mount(
            false,
            QueryLayerOptions {
                resolvers: vec![whoami()],
                middlewares: Middlewares::new().with_global(HidePoweredBy),
                ..Default::default()
            },
        );
        assert_eq!(mounted.global.len(), 2);
        assert!(!mounted.schema.has_subscriptions());
    }
}
