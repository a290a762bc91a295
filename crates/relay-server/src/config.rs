//! Server configuration.
//!
//! Settings come from `RELAY_*` environment variables, optionally overridden
//! by command-line flags.
//!
//! # Environment Variables
//!
//! - `RELAY_BIND`: listen address. Default: `0.0.0.0:3000`
//! - `RELAY_DEPLOYMENT`: deployment identifier for presence. Default: `relay`
//! - `RELAY_ROLE`: `front` or `compute`. Default: `front`
//! - `RELAY_INSTANCE_ID`: instance id within the role. Default: random UUID
//! - `RELAY_SESSION_COOKIE`: session cookie name. Default: `relay.session.id`
//! - `RELAY_CALL_TIMEOUT_SECS`: RPC handler timeout. Default: `30`
//! - `RELAY_ROUTE_TIMEOUT_SECS`: route chain timeout. Default: `30`
//! - `RELAY_OUTBOUND_BUFFER`: queued frames per connection. Default: `256`
//! - `RELAY_PRESENCE_DB`: libSQL file shared between instances (in-memory store when unset)
//! - `RELAY_SESSION_DB`: libSQL file holding the `sessions` table written by
//!   the host's login flow (in-memory directory when unset)
//! - `RELAY_LOG_JSON`: `true` for JSON logs

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use relay_core::presence::{InstanceId, InstanceRole};
use relay_core::ServiceConfig;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

/// Command-line overrides.
#[derive(Debug, Default, Parser)]
#[command(name = "relay-server", version, about = "Real-time connection layer over WebSockets")]
pub struct Cli {
    /// Address to listen on
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Deployment identifier
    #[arg(long)]
    pub deployment: Option<String>,

    /// Path of the shared presence database
    #[arg(long)]
    pub presence_db: Option<String>,

    /// Path of the shared sessions database
    #[arg(long)]
    pub session_db: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub deployment: String,
    pub role: InstanceRole,
    pub instance_id: String,
    pub session_cookie: String,
    pub call_timeout: Duration,
    pub route_timeout: Duration,
    pub outbound_buffer: usize,
    pub presence_db: Option<String>,
    pub session_db: Option<String>,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            deployment: "relay".to_string(),
            role: InstanceRole::Front,
            instance_id: uuid::Uuid::new_v4().to_string(),
            session_cookie: "relay.session.id".to_string(),
            call_timeout: Duration::from_secs(30),
            route_timeout: Duration::from_secs(30),
            outbound_buffer: 256,
            presence_db: None,
            session_db: None,
            log_json: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("RELAY_BIND") {
            config.bind_addr = parse("RELAY_BIND", &value)?;
        }
        if let Some(value) = lookup("RELAY_DEPLOYMENT") {
            config.deployment = value;
        }
        if let Some(value) = lookup("RELAY_ROLE") {
            config.role = InstanceRole::from_str(&value).map_err(|_| ConfigError::InvalidValue {
                var: "RELAY_ROLE",
                value,
            })?;
        }
        if let Some(value) = lookup("RELAY_INSTANCE_ID") {
            config.instance_id = value;
        }
        if let Some(value) = lookup("RELAY_SESSION_COOKIE") {
            config.session_cookie = value;
        }
        if let Some(value) = lookup("RELAY_CALL_TIMEOUT_SECS") {
            config.call_timeout = Duration::from_secs(parse("RELAY_CALL_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = lookup("RELAY_ROUTE_TIMEOUT_SECS") {
            config.route_timeout = Duration::from_secs(parse("RELAY_ROUTE_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = lookup("RELAY_OUTBOUND_BUFFER") {
            config.outbound_buffer = parse::<usize>("RELAY_OUTBOUND_BUFFER", &value)?.max(1);
        }
        config.presence_db = lookup("RELAY_PRESENCE_DB").filter(|v| !v.is_empty());
        config.session_db = lookup("RELAY_SESSION_DB").filter(|v| !v.is_empty());
        if let Some(value) = lookup("RELAY_LOG_JSON") {
            config.log_json = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Apply command-line overrides on top of the environment.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bind) = cli.bind {
            self.bind_addr = bind;
        }
        if let Some(deployment) = &cli.deployment {
            self.deployment = deployment.clone();
        }
        if let Some(path) = &cli.presence_db {
            self.presence_db = Some(path.clone());
        }
        if let Some(path) = &cli.session_db {
            self.session_db = Some(path.clone());
        }
        self.log_json |= cli.log_json;
    }

    pub fn instance(&self) -> InstanceId {
        InstanceId::new(self.role, &self.instance_id)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig::new(self.deployment.clone(), self.instance())
            .with_handler_timeout(self.call_timeout)
            .with_chain_timeout(self.route_timeout)
    }

    pub fn log_config(&self) {
        info!("Listening address: {}", self.bind_addr);
        info!("Deployment: {}", self.deployment);
        info!("Instance: {}", self.instance());
        info!("Session cookie: {}", self.session_cookie);
        info!(
            "Timeouts: call {:?}, route {:?}",
            self.call_timeout, self.route_timeout
        );
        match &self.presence_db {
            Some(path) => info!("Presence store: libSQL at {}", path),
            None => info!("Presence store: in-memory (single instance)"),
        }
        match &self.session_db {
            Some(path) => info!("Sessions: libSQL at {}", path),
            None => info!("Sessions: in-memory (populated by the embedding host)"),
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            deployment: "test".to_string(),
            instance_id: "0".to_string(),
            ..Self::default()
        }
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}
