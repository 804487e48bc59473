use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use graphql_scaffold::async_graphql;
use graphql_scaffold::async_graphql::dynamic::{FieldFuture, Object, TypeRef};
use graphql_scaffold::async_graphql::{Name, ServerError, Value as GqlValue};
use graphql_scaffold::{
    middleware_fn, notifications_resolver, BaseConfig, CustomRoute, Hooks, Middlewares,
    Notification, PubSub, Resolver, RootField, Server, ServerEvent,
};
use serde_json::{json, Map};
use tracing::{info, warn};

const CONFIG_PATH: &str = "demos/perf/serviceconfig.json";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let pubsub = PubSub::new();
    tokio::spawn(publish_ticks(pubsub.clone()));

    let middlewares = Middlewares {
        before_apollo: vec![middleware_fn(|req, next| async move {
            tracing::debug!(uri = %req.uri(), "before the query layer");
            next.run(req).await
        })],
        before_apollo_dev: vec![middleware_fn(|req, next| async move {
            tracing::debug!(uri = %req.uri(), "before the query layer (development only)");
            next.run(req).await
        })],
        ..Default::default()
    };

    let server = Server::builder()
        .with_base_config(BaseConfig::from_file(CONFIG_PATH)?)
        .with_pubsub(pubsub)
        .add_resolver(performances_resolver())
        .add_resolver(notifications_resolver())
        .with_middlewares(middlewares)
        .with_context(|_headers| {
            let mut values = Map::new();
            let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
            values.insert("requestHash".to_string(), json!(format!("{now:x}")));
            values
        })
        .with_format_response(Arc::new(|mut response: async_graphql::Response| {
            response.extensions.insert(
                "executedAt".to_string(),
                GqlValue::from(chrono::Utc::now().timestamp_millis() as f64),
            );
            response
        }))
        .with_format_error(Arc::new(|mut error: ServerError| {
            error
                .extensions
                .get_or_insert_with(Default::default)
                .set("failedAt", chrono::Utc::now().timestamp_millis() as f64);
            error
        }))
        .with_hooks(
            Hooks::default()
                .pre_init(|_| info!("[Hook] The server is starting."))
                .post_init(|_| info!("[Hook] The server has been started.")),
        )
        .add_rest_route(CustomRoute::new("hello", || async { "Hello :-)" }))
        .build()?;

    let mut events = server.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::ApolloReady => info!("[Event] The query layer is ready"),
                ServerEvent::WebInterfaceReady => info!("[Event] The web interface is ready"),
                ServerEvent::GraphQLListening => info!("[Event] GraphQL is ready"),
                ServerEvent::Error(message) => warn!("[Event] {message}"),
                ServerEvent::Exit => info!("[Event] Bye!"),
            }
        }
    });

    server.run().await?;
    Ok(())
}

fn performances_resolver() -> Resolver {
    let performances = Object::new("Performances")
        .description("Some performances information about the server")
        .field(graphql_scaffold::value_field(
            "memory",
            TypeRef::named_nn(TypeRef::STRING),
        ));

    let query = RootField::new("performances", TypeRef::named_nn("Performances"), |_| {
        FieldFuture::new(async move {
            let mut map = async_graphql::indexmap::IndexMap::new();
            map.insert(Name::new("memory"), GqlValue::from(memory_summary()));
            Ok(Some(GqlValue::Object(map)))
        })
    })
    .description("Returns performances information about the server");

    Resolver::new("performances")
        .query(query)
        .register(performances)
}

fn memory_summary() -> String {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return "unavailable".to_string();
    };
    let read = |key: &str| {
        meminfo
            .lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("?")
            .to_string()
    };
    format!("Tot: {} kB, Free: {} kB", read("MemTotal:"), read("MemFree:"))
}

async fn publish_ticks(pubsub: PubSub) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    let mut tick = 0u64;
    loop {
        interval.tick().await;
        tick += 1;
        Notification::new(tick.to_string(), Some(format!("tick {tick}"))).publish(&pubsub);
    }
}
