//! Remote endpoint resolution.
//!
//! Each entry under `remotes` is either a literal URL or a table keyed by
//! `"{env}-{envId}"` with an optional `"default"` fallback.

use crate::config::Environment;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Key used when no environment-specific entry matches.
pub const DEFAULT_REMOTE_KEY: &str = "default";

/// A single remote service entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Remote {
    /// Same URL for every environment
    Url(String),
    /// URL per `"{env}-{envId}"` key, plus `"default"`
    PerEnvironment(HashMap<String, String>),
}

/// Logical service name to remote entry.
pub type Remotes = BTreeMap<String, Remote>;

/// Resolves logical service names against the current environment tier.
#[derive(Debug, Clone, Copy)]
pub struct EndpointResolver<'a> {
    remotes: &'a Remotes,
    env: Environment,
    env_id: u32,
}

impl<'a> EndpointResolver<'a> {
    pub fn new(remotes: &'a Remotes, env: Environment, env_id: u32) -> Self {
        Self {
            remotes,
            env,
            env_id,
        }
    }

    /// The lookup key for per-environment tables, e.g. `production-1`.
    pub fn environment_key(&self) -> String {
        format!("{}-{}", self.env, self.env_id)
    }

    /// Resolve `name` to a concrete URL.
    pub fn resolve(&self, name: &str) -> Result<&'a str> {
        let remote = self
            .remotes
            .get(name)
            .ok_or_else(|| Error::UnknownService(name.to_string()))?;

        match remote {
            Remote::Url(url) => Ok(url.as_str()),
            Remote::PerEnvironment(urls) => {
                let key = self.environment_key();
                urls.get(&key)
                    .or_else(|| urls.get(DEFAULT_REMOTE_KEY))
                    .map(String::as_str)
                    .ok_or(Error::UnresolvedEnvironment {
                        name: name.to_string(),
                        key,
                    })
            }
        }
    }
}
