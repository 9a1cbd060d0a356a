use axum::{routing::get, Router};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::{watch, Semaphore};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use pairgate_core::engine::ConnectionEngine;
use pairgate_core::fault::FaultFilter;
use pairgate_core::onboarding::OnboardingPipeline;
use pairgate_core::{PairingController, SessionStore};

use crate::api::{AppState, PairingCopy};
use crate::config::ServerConfig;
use crate::metrics::PairingMetrics;
use crate::rate_limit::RateLimiter;
use crate::sessions::SessionRegistry;

pub struct PairingServer {
    config: ServerConfig,
    controller: PairingController,
    sessions: SessionRegistry,
    rate_limiter: RateLimiter,
    metrics: Arc<PairingMetrics>,
    capacity: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl PairingServer {
    pub fn new(config: ServerConfig, engine: Arc<dyn ConnectionEngine>) -> anyhow::Result<Self> {
        config.validate()?;

        let faults = if config.benign_fault_patterns.is_empty() {
            FaultFilter::default()
        } else {
            FaultFilter::new(config.benign_fault_patterns.iter().map(String::as_str))
        };

        let controller = PairingController::new(engine, SessionStore::new(&config.sessions_root))
            .with_timings(config.timings())
            .with_onboarding(OnboardingPipeline::new(config.onboarding.clone()))
            .with_faults(Arc::new(faults));

        let sessions = Arc::new(dashmap::DashMap::new());
        let rate_limiter = RateLimiter::new(config.rate_limit.clone());
        let metrics = Arc::new(PairingMetrics::new()?);
        let capacity = Arc::new(Semaphore::new(config.max_active_sessions));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            controller,
            sessions,
            rate_limiter,
            metrics,
            capacity,
            shutdown_tx,
        })
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            controller: self.controller.clone(),
            sessions: self.sessions.clone(),
            rate_limiter: self.rate_limiter.clone(),
            metrics: Arc::clone(&self.metrics),
            copy: Arc::new(PairingCopy {
                message: self.config.pairing_message.clone(),
                instructions: self.config.pairing_instructions.clone(),
            }),
            capacity: Arc::clone(&self.capacity),
        };

        Router::new()
            .route("/", get(crate::api::get_pairing))
            .route("/health", get(crate::api::get_health))
            .route("/metrics", get(crate::api::get_metrics))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.config.sessions_root).await?;

        // Start rate limiter pruning task
        let rate_limiter = self.rate_limiter.clone();
        let window = self.config.rate_limit.window();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(Self::prune_task(rate_limiter, window, shutdown_rx));

        let app = self.router();
        let shutdown_rx = self.shutdown_tx.subscribe();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!(
            "pairgate-server listening on {} (sessions in {})",
            self.config.bind_addr,
            self.config.sessions_root.display()
        );

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(Self::shutdown_signal(shutdown_rx))
            .await?;

        Ok(())
    }

    async fn prune_task(
        rate_limiter: RateLimiter,
        window: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(window);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let pruned = rate_limiter.prune();
                    if pruned > 0 {
                        debug!("Pruned {} idle rate limit buckets, {} remaining", pruned, rate_limiter.tracked_clients());
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    if let Some(ref mut sigterm) = sigterm {
                        sigterm.recv().await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Shutdown requested");
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
