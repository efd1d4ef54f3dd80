/*
 * Loam Mail Server
 *
 * Copyright (c) 2023 Tibor Djurica Potpara
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

mod db;
mod error;
mod executor;
mod listener;
mod smtp;
mod store;
mod tls;

use crate::{
    db::{DbConfig, DbPool, MySqlConnectionManager},
    error::{Error, Result},
    executor::{io::IoExecutor, worker::WorkerPool},
    listener::Listener,
    smtp::{
        fsm::StateMachine,
        server::{SmtpServer, SmtpSessionManager, StopMode},
        Configuration,
    },
    store::MailStore,
    tls::TlsProvider,
};

#[derive(Parser, Debug)]
#[clap(about, version, author)]
struct Args {
    /// SMTP bind address (implicit TLS)
    #[clap(long, default_value = "[::]:465")]
    smtp_bind: SocketAddr,

    /// Hostname used in the greeting and EHLO response
    #[clap(long, default_value = "localhost")]
    hostname: String,

    /// TLS certificate path
    #[clap(long)]
    tls_cert: PathBuf,

    /// TLS key path
    #[clap(long)]
    tls_key: PathBuf,

    /// How often to reload TLS certificates (in seconds)
    #[clap(long, default_value = "600")]
    tls_reload_interval: u64,

    /// Maximum DATA payload size in bytes
    #[clap(long, default_value = "10485760")]
    max_message_size: usize,

    /// Maximum recipients per transaction
    #[clap(long, default_value = "100")]
    max_recipients: usize,

    /// Maximum concurrent sessions
    #[clap(long, default_value = "1000")]
    max_connections: usize,

    /// I/O executor threads (defaults to the CPU count)
    #[clap(long)]
    io_threads: Option<usize>,

    /// Worker executor threads (defaults to the CPU count)
    #[clap(long)]
    worker_threads: Option<usize>,

    /// TLS handshake deadline (in seconds)
    #[clap(long, default_value = "300")]
    connection_timeout: u64,

    /// Idle client deadline (in seconds)
    #[clap(long, default_value = "60")]
    read_timeout: u64,

    /// Response write deadline (in seconds)
    #[clap(long, default_value = "60")]
    write_timeout: u64,

    /// Accept MAIL FROM without prior authentication
    #[clap(long)]
    allow_unauthenticated: bool,

    /// Failed AUTH exchanges tolerated before disconnecting
    #[clap(long, default_value = "3")]
    max_auth_attempts: usize,

    /// Database host
    #[clap(long, default_value = "localhost")]
    db_host: String,

    /// Database port
    #[clap(long, default_value = "3306")]
    db_port: u16,

    /// Database user
    #[clap(long, default_value = "loam")]
    db_user: String,

    /// Database password
    #[clap(long, default_value = "")]
    db_password: String,

    /// Database name
    #[clap(long, default_value = "loam")]
    db_database: String,

    /// Connections opened at startup
    #[clap(long, default_value = "5")]
    db_initial_pool_size: usize,

    /// Connection pool ceiling
    #[clap(long, default_value = "10")]
    db_max_pool_size: usize,

    /// Pool acquire deadline (in seconds)
    #[clap(long, default_value = "5")]
    db_connection_timeout: u64,

    /// Idle connection eviction age (in seconds)
    #[clap(long, default_value = "60")]
    db_idle_timeout: u64,

    /// Check configuration and exit
    #[clap(long)]
    check: bool,

    /// Enable the Prometheus metrics exporter
    #[clap(long)]
    prometheus: bool,
}

fn start(args: Args) -> Result<()> {
    let io_threads = args
        .io_threads
        .filter(|count| *count > 0)
        .unwrap_or_else(num_cpus::get);
    let worker_threads = args
        .worker_threads
        .filter(|count| *count > 0)
        .unwrap_or_else(num_cpus::get);

    let configuration = Arc::new(Configuration {
        hostname: args.hostname.clone(),
        greeting: "Loam SMTP Server".to_string(),
        max_message_size: args.max_message_size,
        max_recipients: args.max_recipients,
        require_auth: !args.allow_unauthenticated,
        max_auth_attempts: args.max_auth_attempts,
        connection_timeout: Duration::from_secs(args.connection_timeout),
        read_timeout: Duration::from_secs(args.read_timeout),
        write_timeout: Duration::from_secs(args.write_timeout),
    });

    let db_config = DbConfig {
        host: args.db_host.clone(),
        port: args.db_port,
        user: args.db_user.clone(),
        password: args.db_password.clone(),
        database: args.db_database.clone(),
        initial_pool_size: args.db_initial_pool_size,
        max_pool_size: args.db_max_pool_size,
        connection_timeout: Duration::from_secs(args.db_connection_timeout),
        idle_timeout: Duration::from_secs(args.db_idle_timeout),
    };

    let tls = Arc::new(TlsProvider::create_from_paths(
        args.tls_cert.clone(),
        args.tls_key.clone(),
    )?);

    if args.check {
        return Ok(());
    }

    let pool = DbPool::start(
        MySqlConnectionManager::new(&db_config),
        db_config.initial_pool_size,
        db_config.max_pool_size,
        db_config.connection_timeout,
        db_config.idle_timeout,
    );
    let store = Arc::new(MailStore::new(pool.clone()));
    store.create_tables()?;

    let workers = Arc::new(WorkerPool::start(worker_threads));

    let io = IoExecutor::start(io_threads)?;
    let result = io.block_on(run(
        args,
        configuration,
        tls,
        store,
        workers.clone(),
    ));

    workers.stop(true);
    pool.close();

    result
}

async fn run(
    args: Args,
    configuration: Arc<Configuration>,
    tls: Arc<TlsProvider>,
    store: Arc<MailStore>,
    workers: Arc<WorkerPool>,
) -> Result<()> {
    if args.prometheus {
        PrometheusBuilder::new().install().map_err(|e| {
            Error::InvalidConfiguration(format!("Failed to install Prometheus exporter: {e}"))
        })?;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(tls.clone().run_reload_loop(
        Duration::from_secs(args.tls_reload_interval),
        shutdown_rx,
    ));

    let manager = SmtpSessionManager {
        fsm: Arc::new(StateMachine::new(configuration.clone())),
        backend: store,
        workers,
        configuration: configuration.clone(),
    };

    let server = SmtpServer {
        id: args.hostname,
        listener: Listener::new(args.smtp_bind, args.max_connections),
        tls,
        configuration,
        max_connections: args.max_connections,
    };
    let handle = server.spawn(manager)?;

    wait_for_shutdown_signal().await?;

    handle.stop(StopMode::Pausing);
    shutdown_tx.send(true).ok();
    tokio::time::sleep(Duration::from_secs(1)).await;

    Ok(())
}

/// Block until SIGTERM or SIGINT arrives.
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    let signal = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    };
    tracing::info!(event = "shutdown", signal = signal, "Shutdown signal received");

    Ok(())
}

fn main() {
    let args = Args::parse();

    let stdout = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("LOG_LEVEL"))
        .finish();

    tracing::subscriber::set_global_default(stdout).unwrap();

    match start(args) {
        Ok(()) => {}
        Err(err) => {
            tracing::error!(
                error = ?err,
                "Error during execution"
            );
            std::process::exit(1);
        }
    }
}
