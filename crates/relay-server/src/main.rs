use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::bridge::RouteTable;
use relay_core::collaborators::IdentityProvider;
use relay_core::presence::{InMemoryPresenceStore, PresenceStore};
use relay_core::SocketService;
use tracing::info;

mod builtin;
mod config;
mod db;
mod server;
mod session;
mod telemetry;

use config::{Cli, ServerConfig};
use server::{AppState, WsTransport};
use session::{InMemorySessionDirectory, SessionDirectory};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ServerConfig::from_env()?;
    config.apply_cli(&cli);

    if config.log_json {
        telemetry::init().map_err(|e| anyhow::anyhow!(e))?;
    } else {
        telemetry::init_local().map_err(|e| anyhow::anyhow!(e))?;
    }

    info!("Relay Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("License: AGPL-3.0");
    config.log_config();

    let presence_store: Arc<dyn PresenceStore> = match &config.presence_db {
        Some(path) => {
            let database = db::Database::open_local("presence", path)
                .await
                .context("opening presence database")?;
            Arc::new(db::LibsqlPresenceStore::new(&database).await?)
        }
        None => Arc::new(InMemoryPresenceStore::new()),
    };

    let (sessions, identity): (Arc<dyn SessionDirectory>, Arc<dyn IdentityProvider>) =
        match &config.session_db {
            Some(path) => {
                let database = db::Database::open_local("sessions", path)
                    .await
                    .context("opening sessions database")?;
                let directory = Arc::new(db::LibsqlSessionDirectory::new(&database).await?);
                (directory.clone(), directory)
            }
            None => {
                let directory = Arc::new(InMemorySessionDirectory::new());
                (directory.clone(), directory)
            }
        };
    let routes = Arc::new(RouteTable::new());
    let instance = config.instance();
    builtin::register_routes(&routes, &config.deployment, instance.as_str());

    let transport = WsTransport::new();
    let service = Arc::new(
        SocketService::builder(config.service_config())
            .presence_store(presence_store)
            .identity(identity)
            .route_resolver(routes)
            .build(transport.clone()),
    );
    builtin::register_calls(service.calls());
    service.start()?;

    let state = Arc::new(AppState::new(service.clone(), transport, sessions, config));
    let served = server::start(state).await;

    service.stop().await;
    telemetry::shutdown();
    served
}
