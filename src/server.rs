//! Server lifecycle: composition, listening, PID lock and shutdown.
//!
//! [`Server::start`] runs the fixed composition sequence:
//!
//! 1. load the configuration (once)
//! 2. build the CORS policy
//! 3. mount the query layer, emit `ApolloReady`
//! 4. generate the client type definitions, mount the REST routes
//! 5. apply the generic transport middlewares and the response chains
//! 6. run the pre-init hook, emit `WebInterfaceReady`
//! 7. bind, acquire the PID lock, run the post-init hooks, emit `GraphQLListening`
//!
//! The returned [`RunningServer`] stops on [`RunningServer::shutdown`], Ctrl-C
//! or SIGTERM, emitting `Exit` and removing the lock file.

use crate::config::{BaseConfig, Configuration, Environment};
use crate::context::ContextFn;
use crate::cors::CorsPolicy;
use crate::error::{Error, Result};
use crate::events::{ServerEvent, ServerEvents};
use crate::lock::{PidLock, DEFAULT_LOCK_PATH};
use crate::middleware::{
    chain, layer_request_chain, layer_response_chain, unmatched, CookieParser, Middlewares,
    RequestFailure, SharedMiddleware,
};
use crate::pubsub::PubSub;
use crate::rest::{normalize_route_path, CustomRoute, RestRouter, TYPES_PATH};
use crate::runtime::{FormatErrorFn, FormatResponseFn, QueryLayer, QueryLayerOptions};
use crate::schema::{Resolver, ValidationRules};
use crate::typedefs::TypeDefinitions;
use crate::views::ErrorView;
use axum::extract::DefaultBodyLimit;
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::any::Any;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

/// Request body limit, sized for multipart uploads.
const UPLOAD_BODY_LIMIT: usize = 32 * 1024 * 1024;

const DEMO_QUERY: &str = "query demo {
  info {
    startedAt
    name
    version
    uptime
  }
}";

/// Lifecycle hook receiving the loaded configuration.
pub type Hook = Arc<dyn Fn(&Configuration) + Send + Sync>;

/// Consumer hooks around the listen step.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Runs after composition, before binding
    pub pre_init: Option<Hook>,
    /// Runs once the listener is bound
    pub post_init: Option<Hook>,
}

impl Hooks {
    pub fn pre_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Configuration) + Send + Sync + 'static,
    {
        self.pre_init = Some(Arc::new(hook));
        self
    }

    pub fn post_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Configuration) + Send + Sync + 'static,
    {
        self.post_init = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_init", &self.pre_init.is_some())
            .field("post_init", &self.post_init.is_some())
            .finish()
    }
}

/// Everything the consumer plugs into the server.
#[derive(Default)]
pub struct ServerOptions {
    pub resolvers: Vec<Resolver>,
    pub middlewares: Middlewares,
    pub context: Option<ContextFn>,
    pub format_response: Option<FormatResponseFn>,
    pub format_error: Option<FormatErrorFn>,
    pub validation: ValidationRules,
    pub rest_routes: Vec<CustomRoute>,
    pub hooks: Hooks,
}

/// Server lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Configuring,
    Starting,
    Listening,
    Exiting,
}

enum ConfigSource {
    Base {
        base: BaseConfig,
        custom: serde_json::Value,
    },
    Loaded(Arc<Configuration>),
}

impl ConfigSource {
    fn load(self) -> Result<Arc<Configuration>> {
        match self {
            ConfigSource::Loaded(configuration) => Ok(configuration),
            ConfigSource::Base { base, custom } => Ok(Arc::new(Configuration::load(base, custom)?)),
        }
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    base: Option<BaseConfig>,
    custom: serde_json::Value,
    configuration: Option<Arc<Configuration>>,
    options: ServerOptions,
    lock_path: PathBuf,
    pubsub: PubSub,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            base: None,
            custom: serde_json::Value::Null,
            configuration: None,
            options: ServerOptions::default(),
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            pubsub: PubSub::new(),
        }
    }

    /// Base config, loaded with the process environment on `start()`.
    pub fn with_base_config(mut self, base: BaseConfig) -> Self {
        self.base = Some(base);
        self
    }

    /// Free-form consumer settings exposed as `Configuration::custom`.
    pub fn with_custom_config(mut self, custom: serde_json::Value) -> Self {
        self.custom = custom;
        self
    }

    /// An already loaded configuration; takes precedence over the base config.
    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = Some(Arc::new(configuration));
        self
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn add_resolver(mut self, resolver: Resolver) -> Self {
        self.options.resolvers.push(resolver);
        self
    }

    pub fn with_middlewares(mut self, middlewares: Middlewares) -> Self {
        self.options.middlewares = middlewares;
        self
    }

    pub fn with_context<F>(mut self, context: F) -> Self
    where
        F: Fn(&axum::http::HeaderMap) -> serde_json::Map<String, serde_json::Value>
            + Send
            + Sync
            + 'static,
    {
        self.options.context = Some(Arc::new(context));
        self
    }

    pub fn with_format_response(mut self, hook: FormatResponseFn) -> Self {
        self.options.format_response = Some(hook);
        self
    }

    pub fn with_format_error(mut self, hook: FormatErrorFn) -> Self {
        self.options.format_error = Some(hook);
        self
    }

    pub fn with_validation_rules(mut self, rules: ValidationRules) -> Self {
        self.options.validation = rules;
        self
    }

    pub fn add_rest_route(mut self, route: CustomRoute) -> Self {
        self.options.rest_routes.push(route);
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.options.hooks = hooks;
        self
    }

    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }

    pub fn with_pubsub(mut self, pubsub: PubSub) -> Self {
        self.pubsub = pubsub;
        self
    }

    pub fn build(self) -> Result<Server> {
        let source = match (self.configuration, self.base) {
            (Some(configuration), _) => ConfigSource::Loaded(configuration),
            (None, Some(base)) => ConfigSource::Base {
                base,
                custom: self.custom,
            },
            (None, None) => {
                return Err(Error::InvalidConfig(
                    "a base configuration or a loaded configuration is required".to_string(),
                ))
            }
        };

        let (state, _) = watch::channel(ServerState::Created);
        Ok(Server {
            source,
            options: self.options,
            lock_path: self.lock_path,
            pubsub: self.pubsub,
            events: ServerEvents::new(),
            state: Arc::new(state),
            type_definitions: TypeDefinitions::new(),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A composed, not yet started server.
pub struct Server {
    source: ConfigSource,
    options: ServerOptions,
    lock_path: PathBuf,
    pubsub: PubSub,
    events: ServerEvents,
    state: Arc<watch::Sender<ServerState>>,
    type_definitions: TypeDefinitions,
}

struct Composed {
    router: Router,
    configuration: Arc<Configuration>,
    hooks: Hooks,
    lock_path: PathBuf,
    events: ServerEvents,
    state: Arc<watch::Sender<ServerState>>,
    type_definitions: TypeDefinitions,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Lifecycle events; subscribe before `start()` to observe all of them.
    pub fn events(&self) -> &ServerEvents {
        &self.events
    }

    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    pub fn type_definitions(&self) -> &TypeDefinitions {
        &self.type_definitions
    }

    /// Compose the application without binding a listener.
    pub fn into_router(self) -> Result<Router> {
        Ok(self.compose()?.router)
    }

    /// Compose, bind and start serving.
    pub async fn start(self) -> Result<RunningServer> {
        let Composed {
            router,
            configuration,
            hooks,
            lock_path,
            events,
            state,
            type_definitions,
        } = self.compose()?;

        if let Some(pre_init) = &hooks.pre_init {
            pre_init(&configuration);
        }
        events.emit(ServerEvent::WebInterfaceReady);

        let addr = configuration.bind_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let err = bind_error(&configuration, &addr, e);
                events.emit(ServerEvent::Error(err.to_string()));
                return Err(err);
            }
        };
        let local_addr = listener.local_addr()?;

        let lock = match PidLock::acquire(&lock_path) {
            Ok(lock) => lock,
            Err(e) => {
                events.emit(ServerEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        state.send_replace(ServerState::Listening);
        tracing::debug!(%local_addr, "listening");

        let exit = Arc::new(ExitGuard {
            events: events.clone(),
            state: state.clone(),
            lock: Mutex::new(Some(lock)),
        });

        let (trigger, requested) = watch::channel(false);
        let guard = exit.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_signal(requested).await;
                    guard.exit();
                })
                .await
        });

        if let Some(post_init) = &hooks.post_init {
            post_init(&configuration);
        }
        builtin_post_init(&configuration, &type_definitions);
        say_welcome(&configuration, local_addr);
        events.emit(ServerEvent::GraphQLListening);

        Ok(RunningServer {
            local_addr,
            trigger,
            task,
            exit,
        })
    }

    /// Start and serve until shutdown.
    ///
    /// Address-in-use and permission errors are reported and terminate the
    /// process with status 1.
    pub async fn run(self) -> Result<()> {
        let running = match self.start().await {
            Ok(running) => running,
            Err(e) if e.is_recognized_bind_error() => {
                tracing::error!("{e}");
                std::process::exit(1);
            }
            Err(e) => return Err(e),
        };
        running.wait().await
    }

    fn compose(self) -> Result<Composed> {
        let Server {
            source,
            options,
            lock_path,
            pubsub,
            events,
            state,
            type_definitions,
        } = self;

        state.send_replace(ServerState::Configuring);
        let configuration = source.load()?;

        state.send_replace(ServerState::Starting);
        let development = configuration.is_development();
        let cors = CorsPolicy::from_config(configuration.cors());

        let ServerOptions {
            resolvers,
            middlewares,
            context,
            format_response,
            format_error,
            validation,
            rest_routes,
            hooks,
        } = options;

        let view = Arc::new(ErrorView::load(
            configuration.views_path(),
            configuration.views_engine(),
        ));
        let builtin = Middlewares::builtin(view);
        let mut response_chain = chain(&middlewares.after_apollo, &builtin.after_apollo);
        if development {
            response_chain.extend(chain(&middlewares.dev, &builtin.dev));
        }

        let mounted = QueryLayer::new(configuration.graphql_path(), development)
            .with_cors(cors.clone())
            .with_configuration(configuration.clone())
            .with_pubsub(pubsub)
            .mount(QueryLayerOptions {
                resolvers,
                middlewares,
                context,
                format_response,
                format_error,
                validation,
            })?;
        events.emit(ServerEvent::ApolloReady);

        // the blob is written before the REST router exists
        type_definitions.refresh(configuration.app_name(), &mounted.schema.sdl());

        let mut rest = RestRouter::new(type_definitions.clone());
        rest.register_custom_routes(rest_routes);
        let mut rest_router = rest.into_router();
        if let Some(cors) = &cors {
            rest_router = cors.apply(rest_router);
        }

        let app = Router::new().merge(mounted.router);
        let app = mount_rest(
            app,
            configuration.rest_path(),
            configuration.graphql_path(),
            rest_router,
        )?
        .fallback(unmatched);

        let app = app
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT));
        let app = layer_request_chain(app, &[Arc::new(CookieParser) as SharedMiddleware]);
        let app = layer_response_chain(app, &response_chain);
        let app = app
            .layer(CompressionLayer::new())
            .layer(TraceLayer::new_for_http());
        let router = layer_request_chain(app, &mounted.global);

        Ok(Composed {
            router,
            configuration,
            hooks,
            lock_path,
            events,
            state,
            type_definitions,
        })
    }
}

/// A bound, serving server.
pub struct RunningServer {
    local_addr: SocketAddr,
    trigger: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
    exit: Arc<ExitGuard>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn events(&self) -> &ServerEvents {
        &self.exit.events
    }

    /// Ask the server to stop; [`RunningServer::wait`] resolves once it has.
    pub fn shutdown(&self) {
        self.trigger.send_replace(true);
    }

    /// Wait for the server to stop.
    pub async fn wait(self) -> Result<()> {
        let result = match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.exit.events.emit(ServerEvent::Error(e.to_string()));
                Err(Error::Io(e))
            }
            Err(e) => Err(Error::Internal(format!("server task failed: {e}"))),
        };
        self.exit.exit();
        result
    }

    /// Shutdown and wait.
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.wait().await
    }
}

/// Shared exit path: state, `Exit` event, lock removal.
struct ExitGuard {
    events: ServerEvents,
    state: Arc<watch::Sender<ServerState>>,
    lock: Mutex<Option<PidLock>>,
}

impl ExitGuard {
    fn exit(&self) {
        self.state.send_replace(ServerState::Exiting);
        self.events.emit(ServerEvent::Exit);
        let lock = self.lock.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut lock) = lock {
            lock.release();
        }
    }
}

async fn shutdown_signal(mut requested: watch::Receiver<bool>) {
    let requested = async move {
        while !*requested.borrow_and_update() {
            if requested.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = requested => tracing::info!("shutdown requested"),
        _ = ctrl_c => tracing::info!("interrupt received, shutting down"),
        _ = terminate => tracing::info!("terminate signal received, shutting down"),
    }
}

fn bind_error(configuration: &Configuration, addr: &str, e: std::io::Error) -> Error {
    let bind = format!("Port {}", configuration.server_port());
    match e.kind() {
        ErrorKind::AddrInUse => Error::AddressInUse(bind),
        ErrorKind::PermissionDenied => Error::PermissionDenied(bind),
        _ => Error::Bind {
            addr: addr.to_string(),
            source: e,
        },
    }
}

fn mount_rest(app: Router, rest_path: &str, graphql_path: &str, rest: Router) -> Result<Router> {
    let path = rest_path.trim_end_matches('/');
    if path.is_empty() {
        return Ok(app.merge(rest));
    }

    let path = normalize_route_path(path);
    if path == graphql_path.trim_end_matches('/') {
        return Err(Error::InvalidConfig(format!(
            "rest.path and graphql.path are both `{path}`"
        )));
    }
    Ok(app.nest(&path, rest))
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    tracing::error!(%detail, "request handler panicked");
    RequestFailure::internal("Internal Server Error")
        .with_detail(detail)
        .into_response()
}

fn builtin_post_init(configuration: &Configuration, type_definitions: &TypeDefinitions) {
    let size = type_definitions.get().len();
    if size == 0 {
        tracing::warn!("client type definitions are empty");
    } else {
        tracing::debug!(
            bytes = size,
            path = %format!("{}{}", configuration.rest_path().trim_end_matches('/'), TYPES_PATH),
            "client type definitions ready"
        );
    }
}

fn say_welcome(configuration: &Configuration, local_addr: SocketAddr) {
    tracing::info!("=> Service up and running <=");
    tracing::info!(
        "Listening on http://{}:{}",
        configuration.server_addr(),
        local_addr.port()
    );
    tracing::info!("The Service ID is {}", configuration.server_key());

    if configuration.env() == Environment::Development {
        tracing::info!(
            "If you want to quickly try the server, go to http://{}:{}{} and try the following query:\n{}",
            configuration.server_addr(),
            local_addr.port(),
            configuration.graphql_path(),
            DEMO_QUERY
        );
    }
}
