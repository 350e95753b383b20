//! Request loop and background maintenance
//!
//! Reads request lines, handles up to `max_in_flight` of them concurrently,
//! and writes responses in completion order. Alongside the loop run:
//!
//! - a config watcher that reloads the policy file when its mtime changes;
//! - a sweeper that closes resolved issues whose grace period elapsed;
//! - a periodic snapshot writer;
//! - an event logger that turns engine notifications into log records.
//!
//! Shutdown (EOF or cancellation) drains in-flight requests, stops the
//! background tasks and writes a final snapshot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use triage::TriageOrchestrator;

use crate::config::DaemonConfig;
use crate::handler::{persist, Handler};
use crate::wire::Response;

pub struct Daemon {
    engine: Arc<TriageOrchestrator>,
    settings: Arc<DaemonConfig>,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(engine: Arc<TriageOrchestrator>, settings: DaemonConfig) -> Self {
        Self {
            engine,
            settings: Arc::new(settings),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the daemon when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run<R, W>(self, input: R, output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut background = self.spawn_background();
        let handler = Arc::new(Handler::new(self.engine.clone(), self.settings.clone()));

        let (tx, rx) = mpsc::channel::<Response>(self.settings.max_in_flight * 2);
        let writer = tokio::spawn(write_responses(rx, output));

        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut lines = input.lines();

        info!(max_in_flight = self.settings.max_in_flight, "Accepting requests");
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read request");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .context("request semaphore closed")?;
            let handler = handler.clone();
            let tx = tx.clone();
            in_flight.spawn(async move {
                let response = handler.handle_line(&line).await;
                drop(permit);
                if tx.send(response).await.is_err() {
                    warn!("Response writer gone; dropping response");
                }
            });

            // Reap finished tasks so the set stays small
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Request task panicked");
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Request task panicked");
            }
        }
        drop(tx);
        writer
            .await
            .context("response writer panicked")?
            .context("failed to write responses")?;

        self.cancel.cancel();
        while let Some(joined) = background.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Background task panicked");
            }
        }

        let issues = persist(&self.engine, &self.settings.snapshot_path)
            .with_context(|| format!("failed to write {}", self.settings.snapshot_path.display()))?;
        info!(issues, path = %self.settings.snapshot_path.display(), "Final snapshot written");
        Ok(())
    }

    fn spawn_background(&self) -> JoinSet<()> {
        let mut tasks = JoinSet::new();

        if let Some(path) = self.settings.config_path.clone() {
            tasks.spawn(watch_config(
                self.engine.clone(),
                path,
                self.settings.reload_poll,
                self.cancel.clone(),
            ));
        }
        tasks.spawn(sweep_closures(
            self.engine.clone(),
            self.settings.sweep_interval,
            self.cancel.clone(),
        ));
        if !self.settings.snapshot_interval.is_zero() {
            tasks.spawn(snapshot_periodically(
                self.engine.clone(),
                self.settings.snapshot_path.clone(),
                self.settings.snapshot_interval,
                self.cancel.clone(),
            ));
        }
        tasks.spawn(log_events(self.engine.clone(), self.cancel.clone()));

        tasks
    }
}

async fn write_responses<W>(mut rx: mpsc::Receiver<Response>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response).context("failed to encode response")?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(())
}

fn modified(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

async fn watch_config(
    engine: Arc<TriageOrchestrator>,
    path: PathBuf,
    poll: Duration,
    cancel: CancellationToken,
) {
    let mut last_seen = modified(&path);
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = modified(&path);
        if current.is_none() || current == last_seen {
            continue;
        }
        last_seen = current;

        match engine.config().reload_from_path(&path) {
            Ok(version) => info!(version, path = %path.display(), "Config file changed; reloaded"),
            Err(e) => warn!(error = %e, path = %path.display(), "Config reload failed; keeping previous config"),
        }
    }
}

async fn sweep_closures(engine: Arc<TriageOrchestrator>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match engine.close_due(Utc::now()).await {
            Ok(closed) if !closed.is_empty() => info!(count = closed.len(), "Closed resolved issues"),
            Ok(_) => debug!("No issues due for closure"),
            Err(e) => warn!(error = %e, "Closure sweep failed"),
        }
    }
}

async fn snapshot_periodically(
    engine: Arc<TriageOrchestrator>,
    path: PathBuf,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    // The first tick fires immediately; skip it
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match persist(&engine, &path) {
            Ok(issues) => debug!(issues, "Periodic snapshot written"),
            Err(e) => warn!(error = %e, "Periodic snapshot failed"),
        }
    }
}

async fn log_events(engine: Arc<TriageOrchestrator>, cancel: CancellationToken) {
    let mut events = engine.events().subscribe();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                let payload = serde_json::to_string(&event).unwrap_or_default();
                info!(
                    event_type = event.event_type(),
                    issue_id = event.issue_id(),
                    %payload,
                    "Triage event"
                );
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event logger lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
