//! # graphql-scaffold
//!
//! A reusable scaffold for GraphQL over HTTP services: configuration loading,
//! per-environment remote endpoints, a REST connector for calling them, a
//! bucketed middleware registry and a lifecycle orchestrator with events and a
//! PID lock.
//!
//! ## Features
//!
//! - **Configuration**: base config file layered with `ADDR`, `PORT`, `NODE_ENV` and `NODE_ENV_ID`
//! - **Remotes**: flat or per-environment endpoints resolved by [`EndpointResolver`]
//! - **REST connector**: [`RestConnector`] with typed responses and file downloads
//! - **Middleware buckets**: `global`, `before_apollo`, `before_apollo_dev`, `after_apollo`, `dev`
//! - **Dynamic schema**: consumer [`Resolver`]s merged with the built-in `info` query
//! - **Subscriptions**: in-process [`PubSub`] and a WebSocket endpoint
//! - **Client typings**: TypeScript definitions of the schema served at `{rest}/types`
//!
//! ## Main Components
//!
//! - [`Server`]: composes and runs everything.
//! - [`ServerBuilder`]: collects the configuration and consumer options.
//! - [`Configuration`]: the loaded, read-only process configuration.
//! - [`QueryLayer`]: mounts the GraphQL endpoint on its own.
//!
//! ## Example
//!
//! ```rust,no_run
//! use graphql_scaffold::{BaseConfig, CustomRoute, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::builder()
//!         .with_base_config(BaseConfig::from_file("serviceconfig.json")?)
//!         .add_rest_route(CustomRoute::new("hello", || async { "Hello World!" }))
//!         .build()?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod context;
pub mod cors;
pub mod error;
pub mod events;
pub mod lock;
pub mod middleware;
pub mod pubsub;
pub mod remotes;
pub mod rest;
pub mod runtime;
pub mod schema;
pub mod server;
pub mod typedefs;
pub mod views;

pub use crate::config::{BaseConfig, Configuration, CorsConfig, EnvOverrides, Environment};
pub use connector::{Download, FromResponse, FullResponse, Json, RequestOptions, RestConnector};
pub use context::{Context, ContextBuilder, ContextFn};
pub use cors::CorsPolicy;
pub use error::{Error, GraphQLError, Result};
pub use events::{ServerEvent, ServerEvents};
pub use lock::{PidLock, DEFAULT_LOCK_PATH};
pub use middleware::{
    middleware_fn, unmatched, Middleware, Middlewares, RequestCookies, RequestFailure,
    SharedMiddleware, Unmatched,
};
pub use pubsub::{notifications_resolver, Notification, PubSub};
pub use remotes::{EndpointResolver, Remote, Remotes};
pub use rest::CustomRoute;
pub use runtime::{FormatErrorFn, FormatResponseFn, QueryLayer, QueryLayerOptions};
pub use schema::{
    value_field, DynamicSchema, Resolver, RootField, RootSubscriptionField, SchemaBuilder,
    ValidationRules,
};
pub use server::{Hook, Hooks, RunningServer, Server, ServerBuilder, ServerOptions, ServerState};
pub use typedefs::TypeDefinitions;
pub use views::ErrorView;

// Re-export commonly used types from dependencies
pub use async_graphql;
pub use axum;
pub use tokio;
