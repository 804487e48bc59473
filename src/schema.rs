//! GraphQL schema building from resolver descriptors.
//!
//! A [`Resolver`] is a named bundle of root fields (queries, mutations,
//! subscriptions) and the types they return, expressed with the
//! `async-graphql` dynamic API. [`SchemaBuilder`] merges the built-in
//! resolvers with the consumer ones into a single dynamic schema.

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::pubsub::PubSub;
use async_graphql::dynamic::{
    Field, FieldFuture, InputValue, Object, ResolverContext, Schema as AsyncSchema, Subscription,
    SubscriptionField, SubscriptionFieldFuture, Type, TypeRef,
};
use async_graphql::{Name, Value as GqlValue};
use std::collections::HashSet;
use std::sync::Arc;

const QUERY_ROOT: &str = "Query";
const MUTATION_ROOT: &str = "Mutation";
const SUBSCRIPTION_ROOT: &str = "Subscription";

/// Dynamic schema wrapper
#[derive(Clone)]
pub struct DynamicSchema {
    inner: AsyncSchema,
    has_subscriptions: bool,
}

impl DynamicSchema {
    /// Execute a GraphQL request
    pub async fn execute(&self, request: async_graphql::Request) -> async_graphql::Response {
        self.inner.execute(request).await
    }

    /// Access the executor (used for HTTP/WS integration)
    pub fn executor(&self) -> AsyncSchema {
        self.inner.clone()
    }

    /// Schema definition language of the built schema
    pub fn sdl(&self) -> String {
        self.inner.sdl()
    }

    pub fn has_subscriptions(&self) -> bool {
        self.has_subscriptions
    }
}

/// A `Query` or `Mutation` root field.
///
/// The name is kept next to the engine field so collisions between resolvers
/// are reported before the roots are assembled.
pub struct RootField {
    name: String,
    field: Field,
}

impl RootField {
    pub fn new<N, T, F>(name: N, ty: T, resolve: F) -> Self
    where
        N: Into<String>,
        T: Into<TypeRef>,
        F: for<'a> Fn(ResolverContext<'a>) -> FieldFuture<'a> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            field: Field::new(name.clone(), ty, resolve),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.field = self.field.description(description);
        self
    }

    pub fn argument(mut self, argument: InputValue) -> Self {
        self.field = self.field.argument(argument);
        self
    }
}

/// A `Subscription` root field.
pub struct RootSubscriptionField {
    name: String,
    field: SubscriptionField,
}

impl RootSubscriptionField {
    pub fn new<N, T, F>(name: N, ty: T, resolve: F) -> Self
    where
        N: Into<String>,
        T: Into<TypeRef>,
        F: for<'a> Fn(ResolverContext<'a>) -> SubscriptionFieldFuture<'a> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            field: SubscriptionField::new(name.clone(), ty, resolve),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.field = self.field.description(description);
        self
    }

    pub fn argument(mut self, argument: InputValue) -> Self {
        self.field = self.field.argument(argument);
        self
    }
}

/// A named set of root fields and supporting types.
///
/// # Example
///
/// ```rust
/// use async_graphql::dynamic::{FieldFuture, TypeRef};
/// use async_graphql::Value;
/// use graphql_scaffold::schema::{Resolver, RootField};
///
/// let ping = Resolver::new("ping").query(RootField::new(
///     "ping",
///     TypeRef::named_nn(TypeRef::STRING),
///     |_| FieldFuture::new(async { Ok(Some(Value::from("pong"))) }),
/// ));
/// assert!(ping.has_queries());
/// ```
pub struct Resolver {
    name: String,
    queries: Vec<RootField>,
    mutations: Vec<RootField>,
    subscriptions: Vec<RootSubscriptionField>,
    types: Vec<Type>,
}

impl Resolver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queries: Vec::new(),
            mutations: Vec::new(),
            subscriptions: Vec::new(),
            types: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a field to the `Query` root.
    pub fn query(mut self, field: RootField) -> Self {
        self.queries.push(field);
        self
    }

    /// Add a field to the `Mutation` root.
    pub fn mutation(mut self, field: RootField) -> Self {
        self.mutations.push(field);
        self
    }

    /// Add a field to the `Subscription` root.
    pub fn subscription(mut self, field: RootSubscriptionField) -> Self {
        self.subscriptions.push(field);
        self
    }

    /// Register a supporting type (object, enum, input object, ...).
    pub fn register(mut self, ty: impl Into<Type>) -> Self {
        self.types.push(ty.into());
        self
    }

    pub fn has_queries(&self) -> bool {
        !self.queries.is_empty()
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("name", &self.name)
            .field("queries", &self.queries.len())
            .field("mutations", &self.mutations.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("types", &self.types.len())
            .finish()
    }
}

/// Query validation limits applied by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationRules {
    pub max_depth: Option<usize>,
    pub max_complexity: Option<usize>,
    pub max_recursive_depth: Option<usize>,
}

/// Schema builder
pub struct SchemaBuilder {
    resolvers: Vec<Resolver>,
    development: bool,
    validation: ValidationRules,
    configuration: Option<Arc<Configuration>>,
    pubsub: Option<PubSub>,
}

impl SchemaBuilder {
    /// Create a new schema builder
    pub fn new() -> Self {
        Self {
            resolvers: Vec::new(),
            development: false,
            validation: ValidationRules::default(),
            configuration: None,
            pubsub: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn with_resolvers<I>(mut self, resolvers: I) -> Self
    where
        I: IntoIterator<Item = Resolver>,
    {
        self.resolvers.extend(resolvers);
        self
    }

    /// Development mode keeps introspection enabled.
    pub fn development(mut self, development: bool) -> Self {
        self.development = development;
        self
    }

    pub fn with_validation_rules(mut self, rules: ValidationRules) -> Self {
        self.validation = rules;
        self
    }

    /// Make the configuration available to resolvers as `Arc<Configuration>`.
    pub fn with_configuration(mut self, configuration: Arc<Configuration>) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Make the broker available to resolvers as `PubSub`.
    pub fn with_pubsub(mut self, pubsub: PubSub) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Build the GraphQL schema from the registered resolvers.
    pub fn build(self) -> Result<DynamicSchema> {
        let mut query_root = Object::new(QUERY_ROOT);
        let mut mutation_root: Option<Object> = None;
        let mut subscription_root: Option<Subscription> = None;
        let mut types = Vec::new();

        let mut query_names = HashSet::new();
        let mut mutation_names = HashSet::new();
        let mut subscription_names = HashSet::new();

        for resolver in self.resolvers {
            let owner = resolver.name;

            for RootField { name, field } in resolver.queries {
                ensure_unique(&mut query_names, &name, QUERY_ROOT, &owner)?;
                query_root = query_root.field(field);
            }

            for RootField { name, field } in resolver.mutations {
                ensure_unique(&mut mutation_names, &name, MUTATION_ROOT, &owner)?;
                let mutation = mutation_root
                    .take()
                    .unwrap_or_else(|| Object::new(MUTATION_ROOT));
                mutation_root = Some(mutation.field(field));
            }

            for RootSubscriptionField { name, field } in resolver.subscriptions {
                ensure_unique(&mut subscription_names, &name, SUBSCRIPTION_ROOT, &owner)?;
                let subscription = subscription_root
                    .take()
                    .unwrap_or_else(|| Subscription::new(SUBSCRIPTION_ROOT));
                subscription_root = Some(subscription.field(field));
            }

            types.extend(resolver.types);
        }

        if query_names.is_empty() {
            return Err(Error::EmptySchema);
        }

        let has_subscriptions = subscription_root.is_some();
        let mut schema_builder = AsyncSchema::build(
            QUERY_ROOT,
            mutation_root.as_ref().map(|_| MUTATION_ROOT),
            subscription_root.as_ref().map(|_| SUBSCRIPTION_ROOT),
        );

        schema_builder = schema_builder.enable_uploading();

        if !self.development {
            schema_builder = schema_builder.disable_introspection();
        }
        if let Some(depth) = self.validation.max_depth {
            schema_builder = schema_builder.limit_depth(depth);
        }
        if let Some(complexity) = self.validation.max_complexity {
            schema_builder = schema_builder.limit_complexity(complexity);
        }
        if let Some(depth) = self.validation.max_recursive_depth {
            schema_builder = schema_builder.limit_recursive_depth(depth);
        }

        if let Some(configuration) = self.configuration {
            schema_builder = schema_builder.data(configuration);
        }
        if let Some(pubsub) = self.pubsub {
            schema_builder = schema_builder.data(pubsub);
        }

        schema_builder = schema_builder.register(query_root);
        if let Some(mutation) = mutation_root {
            schema_builder = schema_builder.register(mutation);
        }
        if let Some(subscription) = subscription_root {
            schema_builder = schema_builder.register(subscription);
        }
        for ty in types {
            schema_builder = schema_builder.register(ty);
        }

        let schema = schema_builder
            .finish()
            .map_err(|e| Error::Schema(format!("failed to build schema: {e}")))?;

        Ok(DynamicSchema {
            inner: schema,
            has_subscriptions,
        })
    }
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_unique(seen: &mut HashSet<String>, name: &str, root: &str, owner: &str) -> Result<()> {
    if !seen.insert(name.to_string()) {
        return Err(Error::Schema(format!(
            "resolver `{owner}` redefines {root}.{name}"
        )));
    }
    Ok(())
}

/// A field resolving `key` from a parent object value.
pub fn value_field(name: impl Into<String>, ty: impl Into<TypeRef>) -> Field {
    let name = name.into();
    let key = name.clone();
    Field::new(name, ty, move |ctx| {
        let key = key.clone();
        FieldFuture::new(async move {
            if let Some(GqlValue::Object(map)) = ctx.parent_value.as_value() {
                if let Some(val) = map.get(&Name::new(key)) {
                    return Ok(Some(val.clone()));
                }
            }
            Ok(Some(GqlValue::Null))
        })
    })
}

/// Built-in resolvers mounted on every schema.
pub fn builtin_resolvers() -> Vec<Resolver> {
    vec![debug_resolver()]
}

/// `info` query with server identity and uptime.
pub fn debug_resolver() -> Resolver {
    let debug_info = Object::new("DebugInfo")
        .description("Some debug information about the server")
        .field(value_field("startedAt", TypeRef::named_nn(TypeRef::FLOAT)))
        .field(value_field("version", TypeRef::named_nn(TypeRef::STRING)))
        .field(value_field("name", TypeRef::named_nn(TypeRef::STRING)))
        .field(value_field("uptime", TypeRef::named_nn(TypeRef::FLOAT)));

    let info = RootField::new("info", TypeRef::named_nn("DebugInfo"), |ctx| {
        FieldFuture::new(async move {
            let conf = ctx.data::<Arc<Configuration>>()?;
            let started_at = conf.started_at().timestamp_millis();
            let uptime = chrono::Utc::now().timestamp_millis() - started_at;

            let mut map = async_graphql::indexmap::IndexMap::new();
            map.insert(Name::new("startedAt"), GqlValue::from(started_at as f64));
            map.insert(Name::new("version"), GqlValue::from(conf.app_version()));
            map.insert(Name::new("name"), GqlValue::from(conf.app_name()));
            map.insert(Name::new("uptime"), GqlValue::from(uptime.max(0) as f64));
            Ok(Some(GqlValue::Object(map)))
        })
    })
    .description("Returns debug information from the server");

    Resolver::new("debug").query(info).register(debug_info)
}
