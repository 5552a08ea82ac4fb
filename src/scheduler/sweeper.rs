//! Periodic share sweep.
//!
//! Runs as a background task: every interval it refreshes the history
//! correctors and the group-share snapshot, and recomputes every group when
//! either produced something new.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::SchedulerError;

use super::shares::ShareCalculator;

/// Errors from starting or stopping the sweeper.
#[derive(Debug, Error)]
pub enum SweeperError {
    #[error("Share sweeper is already running")]
    AlreadyRunning,

    #[error("Share sweeper is not running")]
    NotRunning,

    #[error("Share sweeper did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Background task keeping task-queue priorities in line with configuration
/// and usage history.
pub struct ShareSweeper {
    calculator: Arc<ShareCalculator>,
    interval: Duration,
    shutdown_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl ShareSweeper {
    /// Creates a stopped sweeper.
    pub fn new(calculator: Arc<ShareCalculator>, interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            calculator,
            interval,
            shutdown_timeout: Duration::from_secs(30),
            shutdown_tx,
            handle: None,
            is_running: AtomicBool::new(false),
        }
    }

    /// Sets how long [`ShareSweeper::shutdown`] waits for the task.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Spawns the sweep loop. The first sweep runs immediately.
    pub fn start(&mut self) -> Result<(), SweeperError> {
        if self.is_running() {
            return Err(SweeperError::AlreadyRunning);
        }

        let calculator = Arc::clone(&self.calculator);
        let interval = self.interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Share sweeper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = sweep_once(&calculator).await {
                            error!(error = %e, "Share sweep failed");
                        }
                    }
                }
            }
        }));

        self.is_running.store(true, Ordering::SeqCst);
        info!(interval_secs = interval.as_secs(), "Share sweeper started");
        Ok(())
    }

    /// Signals the loop to stop and waits for it.
    pub async fn shutdown(&mut self) -> Result<(), SweeperError> {
        if !self.is_running() {
            return Err(SweeperError::NotRunning);
        }

        let _ = self.shutdown_tx.send(());
        self.is_running.store(false, Ordering::SeqCst);

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match tokio::time::timeout(self.shutdown_timeout, handle).await {
            Ok(Ok(())) => {
                info!("Share sweeper stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Share sweeper task panicked");
                Ok(())
            }
            Err(_) => Err(SweeperError::ShutdownTimeout(self.shutdown_timeout)),
        }
    }
}

/// One sweep. Returns true if priorities were recomputed.
pub async fn sweep_once(calculator: &ShareCalculator) -> Result<bool, SchedulerError> {
    let history_changed = match calculator.corrector() {
        Some(corrector) => corrector.refresh().await,
        None => false,
    };
    let shares_changed = calculator.refresh_shares().await?;

    if !(history_changed || shares_changed) {
        debug!("Share sweep found nothing new");
        return Ok(false);
    }

    let groups = calculator.recalculate_all().await?;
    info!(
        groups,
        history_changed, shares_changed, "Share sweep recomputed priorities"
    );
    Ok(true)
}
