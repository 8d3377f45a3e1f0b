//! CLI for mentorbridge
//!
//! Subcommands:
//! - `gateway`: run the WebSocket gateway
//! - `worker`: run AI worker consumers
//! - `topology`: declare the broker topology and exit
//!
//! `--in-memory` swaps RabbitMQ for the in-process broker. Since nothing
//! outside the process can reach that broker, `gateway --in-memory` also runs
//! the AI workers itself.

use std::error::Error;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use mentorbridge::auth::JwtAuthenticator;
use mentorbridge::broker::{AmqpBroker, MemoryBroker, MessageBroker, Topology, ensure_topology};
use mentorbridge::community::HttpMembership;
use mentorbridge::config::{Settings, load_config};
use mentorbridge::llm::HttpLanguageModel;
use mentorbridge::persistence::SledAiLog;
use mentorbridge::transport::{Gateway, start_websocket_server};
use mentorbridge::utils::error::BrokerError;
use mentorbridge::utils::logging;
use mentorbridge::worker::AiWorker;

#[derive(Parser)]
#[command(name = "mentorbridge")]
enum Command {
    /// Run the WebSocket gateway
    Gateway {
        /// Use the in-process broker instead of RabbitMQ
        #[arg(long)]
        in_memory: bool,
    },
    /// Run AI worker consumers
    Worker {
        /// Use the in-process broker instead of RabbitMQ
        #[arg(long)]
        in_memory: bool,
    },
    /// Declare exchanges, queue and bindings, then exit
    Topology,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.logging.level);

    let result = match cmd {
        Command::Gateway { in_memory } => run_gateway(settings, in_memory).await,
        Command::Worker { in_memory } => run_worker(settings, in_memory).await,
        Command::Topology => run_topology(settings).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn connect_broker(
    settings: &Settings,
    in_memory: bool,
) -> Result<Arc<dyn MessageBroker>, BrokerError> {
    if in_memory {
        let broker = MemoryBroker::new();
        ensure_topology(&broker, &Topology::from_settings(&settings.broker)).await?;
        info!("using in-memory broker");
        return Ok(Arc::new(broker));
    }
    Ok(Arc::new(AmqpBroker::connect(&settings.broker).await?))
}

fn spawn_workers(
    settings: &Settings,
    broker: Arc<dyn MessageBroker>,
    topology: Arc<Topology>,
    workers: &mut JoinSet<Result<(), BrokerError>>,
) -> Result<Arc<SledAiLog>, Box<dyn Error>> {
    let model = Arc::new(HttpLanguageModel::new(&settings.model)?);
    let log = Arc::new(SledAiLog::open(&settings.worker.log_db_path)?);

    let count = settings.worker.concurrency.max(1);
    for _ in 0..count {
        let worker = AiWorker::new(broker.clone(), topology.clone(), model.clone(), log.clone())
            .with_prefetch(settings.broker.prefetch)
            .with_backoff(settings.broker.backoff());
        workers.spawn(async move { worker.run().await });
    }
    info!(count, queue = %topology.ai_question_queue, "AI workers started");
    Ok(log)
}

async fn run_gateway(settings: Settings, in_memory: bool) -> Result<(), Box<dyn Error>> {
    let broker = connect_broker(&settings, in_memory).await?;
    let topology = Arc::new(Topology::from_settings(&settings.broker));

    let mut workers = JoinSet::new();
    if in_memory {
        spawn_workers(&settings, broker.clone(), topology.clone(), &mut workers)?;
    }

    let gateway = Gateway::new(
        broker,
        topology,
        Arc::new(JwtAuthenticator::new(&settings.auth.jwt_secret)),
        Arc::new(HttpMembership::new(&settings.membership)?),
    );
    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    let outcome = supervise(
        start_websocket_server(&addr, gateway),
        &mut workers,
        tokio::signal::ctrl_c(),
    )
    .await;

    workers.shutdown().await;
    outcome
}

/// Run the gateway until it exits, a worker stops, or `shutdown` fires.
async fn supervise(
    server: impl Future<Output = io::Result<()>>,
    workers: &mut JoinSet<Result<(), BrokerError>>,
    shutdown: impl Future<Output = io::Result<()>>,
) -> Result<(), Box<dyn Error>> {
    // an empty worker set disables the join_next branch
    tokio::select! {
        result = server => {
            error!("WebSocket gateway exited unexpectedly.");
            result.map_err(|e| Box::new(e) as Box<dyn Error>)
        }
        Some(joined) = workers.join_next() => {
            error!("AI worker stopped, shutting down the gateway.");
            worker_outcome(joined)
        }
        _ = shutdown => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    }
}

fn worker_outcome(
    joined: Result<Result<(), BrokerError>, JoinError>,
) -> Result<(), Box<dyn Error>> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Box::new(e) as Box<dyn Error>),
        Err(e) => Err(Box::new(e) as Box<dyn Error>),
    }
}

async fn run_worker(settings: Settings, in_memory: bool) -> Result<(), Box<dyn Error>> {
    let broker = connect_broker(&settings, in_memory).await?;
    let topology = Arc::new(Topology::from_settings(&settings.broker));

    let mut workers = JoinSet::new();
    let log = spawn_workers(&settings, broker, topology, &mut workers)?;

    let outcome = tokio::select! {
        Some(joined) = workers.join_next() => worker_outcome(joined),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };

    workers.shutdown().await;
    if let Err(e) = log.flush() {
        warn!(error = %e, "failed to flush AI log");
    }
    outcome
}

async fn run_topology(settings: Settings) -> Result<(), Box<dyn Error>> {
    // connecting declares the topology
    AmqpBroker::connect(&settings.broker).await?;
    info!(
        direct = %settings.broker.direct_exchange,
        discussions = %settings.broker.discussions_exchange,
        queue = %settings.broker.ai_question_queue,
        "topology declared"
    );
    Ok(())
}
