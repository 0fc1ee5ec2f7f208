//! Orchestration core for a distributed network-probing platform.
//!
//! Wires together the four subsystems described in the architecture: the
//! Connection Manager (persistent agent duplex channels), the Message
//! Dispatcher (priority queue, distributor, result collector, status
//! updater), the Task Allocator (agent scoring and selection), and the
//! Task Scheduler (main/retry/delayed queues, concurrency cap, reaper).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::allocator::scoring::{FilterThresholds, ScoringWeights};
use crate::allocator::{AllocatorConfig, TaskAllocator};
use crate::config::ConfigManager;
use crate::connection::{self, ConnectionManager};
use crate::dispatcher::collector::ResultCollector;
use crate::dispatcher::distributor::TaskDistributor;
use crate::dispatcher::status::StatusUpdater;
use crate::repository::SqliteRepositories;
use crate::scheduler::TaskScheduler;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The object graph `Server::build` assembles, handed back so both the
/// accept loop and (in tests) scenario drivers can reach every subsystem
/// without re-wiring the handler registrations themselves.
pub struct Handles {
    pub connections: Arc<ConnectionManager>,
    pub collector: Arc<ResultCollector>,
    pub distributor: Arc<TaskDistributor>,
    pub allocator: Arc<TaskAllocator>,
    pub scheduler: Arc<TaskScheduler>,
}

pub struct Server {
    pub config_manager: Arc<Mutex<ConfigManager>>,
    pub listen_address: SocketAddr,
    data_dir: PathBuf,
    connections: Option<Arc<ConnectionManager>>,
    scheduler: Option<Arc<TaskScheduler>>,
    dispatcher: Option<Arc<crate::dispatcher::MessageDispatcher>>,
    /// Unicasts/broadcasts status frames and system notifications outside
    /// the dispatch loop (§4.2.4); kept on `Server` for administrative
    /// tooling built on top of this binary.
    status_updater: Option<Arc<StatusUpdater>>,
    loop_handles: Vec<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Server {
    pub fn new(config_path: PathBuf, data_dir: PathBuf) -> Result<Self> {
        let config_manager = ConfigManager::new(config_path)?;
        let listen_address: SocketAddr = config_manager.config().listen_address.parse().map_err(|e| {
            anyhow::anyhow!(
                "invalid listen address '{}': {}",
                config_manager.config().listen_address,
                e
            )
        })?;

        Ok(Self {
            config_manager: Arc::new(Mutex::new(config_manager)),
            listen_address,
            data_dir,
            connections: None,
            scheduler: None,
            dispatcher: None,
            status_updater: None,
            loop_handles: Vec::new(),
            shutdown_tx: None,
        })
    }

    /// Assembles every subsystem and registers the cross-subsystem
    /// handlers, but stops short of accepting connections — split out of
    /// `run` so integration tests can drive the real object graph over a
    /// loopback listener instead of the production bind address.
    pub async fn build(&mut self) -> Result<Handles> {
        info!("starting orchestrator core, version {}", SERVER_VERSION);

        let cfg = {
            let manager = self.config_manager.lock().await;
            manager.config().clone()
        };
        info!(listen_address = %self.listen_address, data_dir = %self.data_dir.display(), "configuration loaded");

        let repos = Arc::new(
            SqliteRepositories::new(&self.data_dir).context("failed to initialize the orchestrator database")?,
        );
        let agents_repo: Arc<dyn shared::repository::AgentRepository> = repos.clone();
        let tasks_repo: Arc<dyn shared::repository::TaskRepository> = repos.clone();
        let results_repo: Arc<dyn shared::repository::TaskResultRepository> = repos.clone();

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let connections = Arc::new(ConnectionManager::new(
            cfg.max_connections_per_agent,
            Arc::clone(&agents_repo),
            cfg.shared_api_key.clone(),
        ));
        self.connections = Some(Arc::clone(&connections));
        self.loop_handles.push(connections.spawn_heartbeat_loop(shutdown_tx.subscribe()));

        let distributor = Arc::new(TaskDistributor::new(Arc::clone(&connections)));
        let collector = Arc::new(ResultCollector::new(
            Arc::clone(&connections),
            Arc::clone(&tasks_repo),
            Arc::clone(&results_repo),
        ));
        let status_updater = Arc::new(StatusUpdater::new(Arc::clone(&connections)));
        self.status_updater = Some(Arc::clone(&status_updater));

        let message_dispatcher = Arc::new(crate::dispatcher::MessageDispatcher::new());
        self.dispatcher = Some(Arc::clone(&message_dispatcher));
        self.loop_handles.push(message_dispatcher.spawn_loop(shutdown_tx.subscribe()));

        let allocator_config = AllocatorConfig {
            weights: ScoringWeights {
                location: cfg.location_weight,
                performance: cfg.performance_weight,
                load: cfg.load_weight,
            },
            thresholds: FilterThresholds {
                max_agent_load: cfg.max_agent_load,
                min_agent_availability: cfg.min_agent_availability,
            },
            smart_thresholds: FilterThresholds {
                max_agent_load: cfg.smart_max_agent_load,
                min_agent_availability: cfg.smart_min_agent_availability,
            },
        };
        let allocator = Arc::new(TaskAllocator::new(
            Arc::clone(&agents_repo),
            Arc::clone(&results_repo),
            allocator_config,
        ));

        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&tasks_repo),
            Arc::clone(&results_repo),
            Arc::clone(&allocator),
            Arc::clone(&distributor),
            cfg.max_concurrent_tasks,
            Duration::from_secs(cfg.scheduler_check_interval_seconds),
            Duration::from_secs(cfg.reaper_interval_seconds),
            Duration::from_secs(cfg.task_timeout_seconds),
        ));
        self.scheduler = Some(Arc::clone(&scheduler));
        self.loop_handles.extend(scheduler.spawn_loops(&shutdown_tx));

        // Clear the scheduler's executing-slot for this task once the
        // collector has persisted its result, so `max_concurrent_tasks`
        // isn't leaked on real completions (the collector is the sole
        // persister for real results; the scheduler only tracks state here).
        let scheduler_for_results = Arc::clone(&scheduler);
        collector
            .register_handler(Arc::new(move |pending| {
                let scheduler = Arc::clone(&scheduler_for_results);
                let task_id = pending.task_id;
                let status = pending.status;
                tokio::spawn(async move {
                    scheduler.record_completion(task_id, status).await;
                });
            }))
            .await;

        let collector_for_results = Arc::clone(&collector);
        let connections_for_results = Arc::clone(&connections);
        connections.register_handler(
            shared::protocol::frame_type::TASK_RESULT,
            Arc::new(move |session_id, payload| {
                let collector = Arc::clone(&collector_for_results);
                let connections = Arc::clone(&connections_for_results);
                tokio::spawn(async move {
                    let Some(agent_id) = connections.agent_id_for_session(session_id).await else {
                        return;
                    };
                    let frame = shared::protocol::Frame::new(shared::protocol::frame_type::TASK_RESULT, payload);
                    collector.handle_task_result(agent_id, frame).await;
                });
            }),
        );

        Ok(Handles {
            connections,
            collector,
            distributor,
            allocator,
            scheduler,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        let handles = self.build().await?;

        info!(listen_address = %self.listen_address, "accepting agent connections");
        let manager_for_accept = Arc::clone(&handles.connections);
        connection::transport::serve(self.listen_address, move |channel, peer_addr| {
            let manager = Arc::clone(&manager_for_accept);
            async move {
                info!(%peer_addr, "agent connection accepted");
                manager.handle_channel(channel).await;
            }
        })
        .await
        .with_context(|| format!("failed to serve agent connections on {}", self.listen_address))?;

        Ok(())
    }

    pub async fn shutdown(&mut self) {
        info!("shutting down orchestrator core gracefully");

        let shutdown_timeout_secs = {
            let manager = self.config_manager.lock().await;
            manager.config().graceful_shutdown_timeout_seconds
        };

        if let Some(tx) = &self.shutdown_tx {
            if let Err(e) = tx.send(()) {
                warn!("failed to send shutdown signal: {}", e);
            }
        }

        for handle in self.loop_handles.drain(..) {
            match tokio::time::timeout(Duration::from_secs(shutdown_timeout_secs), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("background task panicked: {}", e),
                Err(_) => warn!("background task shutdown timeout reached, aborting"),
            }
        }

        info!("orchestrator core shutdown complete");
    }
}

pub async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("failed to register signal handlers: {}", e);
                error!("falling back to Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("received Ctrl+C");
        }
    }
}
