// radarb - Weather and traffic dashboard backend for Lakewood, Ohio
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::{Parser, ValueEnum};
use prometheus_client::registry::Registry;
use radarb::client::{Endpoints, UpstreamClient};
use radarb::dusk_log::{log_dusk, DuskLog, FirestoreDuskLog, MemoryDuskLog};
use radarb::gcp::MetadataTokenSource;
use radarb::http::RequestContext;
use radarb::location::{HOME, TIME_ZONE};
use radarb::metrics::ProxyMetrics;
use radarb::radar::{RadarConfig, DEFAULT_ALLOWED_HOST, DEFAULT_CACHE_SECS};
use radarb::secrets::{SecretCache, SecretManagerSource, SecretSource, StaticSecrets, DEFAULT_PROJECT};
use reqwest::Client;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::{Instrument, Level};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9783);
const DEFAULT_TIMEOUT_MILLIS: u64 = 10_000;
const DEFAULT_DUSK_REFRESH_SECS: u64 = 86_400;
const DEFAULT_FIRESTORE_PROJECT: &str = "radarb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SecretsBackend {
    /// `RADARB_SECRET_*` environment variables
    Env,
    /// Google Cloud Secret Manager
    Gcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DuskStore {
    /// Kept in memory, lost on restart
    Memory,
    /// Google Cloud Firestore
    Firestore,
}

#[derive(Debug, Parser)]
#[clap(name = "radarb", version = clap::crate_version!())]
struct RadarbApplication {
    /// Address to bind to. By default, radarb will bind to public address since the
    /// dashboard is served to browsers on other hosts.
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Timeout for requests to upstream APIs, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Where API keys are read from.
    #[clap(long, value_enum, default_value_t = SecretsBackend::Gcp)]
    secrets: SecretsBackend,

    /// Google Cloud project that owns the secrets.
    #[clap(long, env = "RADARB_SECRETS_PROJECT", default_value_t = DEFAULT_PROJECT.into())]
    secrets_project: String,

    /// Google Cloud project of the Firestore database holding the dusk log.
    #[clap(long, env = "RADARB_FIRESTORE_PROJECT", default_value_t = DEFAULT_FIRESTORE_PROJECT.into())]
    firestore_project: String,

    /// Where the daily dusk log is kept.
    #[clap(long, value_enum, default_value_t = DuskStore::Firestore)]
    dusk_store: DuskStore,

    /// Log the end of civil twilight at this interval, in seconds.
    #[clap(long, default_value_t = DEFAULT_DUSK_REFRESH_SECS)]
    dusk_refresh_secs: u64,

    /// Hosts that radar images may be proxied from, comma separated.
    #[clap(long, value_delimiter = ',', default_value = DEFAULT_ALLOWED_HOST)]
    radar_allowed_hosts: Vec<String>,

    /// Value of max-age sent with proxied radar images, in seconds.
    #[clap(long, default_value_t = DEFAULT_CACHE_SECS)]
    radar_cache_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = RadarbApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let mut registry = Registry::default();
    let metrics = ProxyMetrics::new(&mut registry);
    let client = UpstreamClient::new(http_client, metrics.clone());
    let endpoints = Endpoints::default();
    let tokens = Arc::new(MetadataTokenSource::new(client.clone(), &endpoints.metadata_token));

    let source: Arc<dyn SecretSource> = match opts.secrets {
        SecretsBackend::Env => {
            let secrets = StaticSecrets::from_env(&opts.secrets_project);
            tracing::info!(message = "using secrets from environment", count = secrets.len());
            Arc::new(secrets)
        }
        SecretsBackend::Gcp => Arc::new(SecretManagerSource::new(
            client.clone(),
            &endpoints.secret_manager,
            tokens.clone(),
        )),
    };
    let secrets = Arc::new(SecretCache::new(source, &opts.secrets_project));

    let dusk_log: Arc<dyn DuskLog> = match opts.dusk_store {
        DuskStore::Memory => Arc::new(MemoryDuskLog::new()),
        DuskStore::Firestore => Arc::new(FirestoreDuskLog::new(
            client.clone(),
            &endpoints.firestore,
            &opts.firestore_project,
            tokens,
        )),
    };

    let radar = RadarConfig::new(&opts.radar_allowed_hosts, opts.radar_cache_secs);
    let context = Arc::new(RequestContext::new(
        registry,
        client,
        secrets,
        &endpoints,
        radar,
        dusk_log,
    ));

    let dusk_context = context.clone();
    let dusk_store = opts.dusk_store;
    let mut interval = tokio::time::interval(Duration::from_secs(opts.dusk_refresh_secs));

    tokio::spawn(async move {
        tracing::info!(message = "dusk logging started", dusk_store = ?dusk_store);

        loop {
            let _ = interval.tick().await;
            log_dusk(
                dusk_context.twilight(),
                dusk_context.dusk_log(),
                &metrics,
                HOME,
                TIME_ZONE,
            )
            .instrument(tracing::span!(Level::DEBUG, "dusk_log"))
            .await;
        }
    });

    let app = radarb::http::router(context);
    let server = axum::Server::try_bind(&opts.bind)
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
            process::exit(1)
        })
        .serve(app.into_make_service());

    tracing::info!(message = "server started", address = %server.local_addr());
    server
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
