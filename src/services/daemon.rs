//! Process-level driver around the [`Bridge`]: startup connectivity check,
//! event dispatch and the periodic refresh/resync loops.

use crate::domain::ContainerEvent;
use crate::infra::FeedItem;
use crate::services::Bridge;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often and how long the startup ping is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `-1` retries forever.
    pub attempts: i64,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const UNBOUNDED: i64 = -1;

    fn exhausted(&self, attempt: i64) -> bool {
        self.attempts != Self::UNBOUNDED && attempt >= self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            interval: Duration::from_millis(2000),
        }
    }
}

/// Settings that drive the process rather than the bridge itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonOptions {
    pub registry_uri: String,
    pub runtime_program: String,
    /// Zero disables the refresh loop.
    pub refresh_interval: Duration,
    /// Zero disables the resync loop.
    pub resync_interval: Duration,
    pub retry: RetryPolicy,
}

/// Pings the registry until it answers or the retry budget is spent.
pub fn connect(bridge: &Bridge, retry: &RetryPolicy) -> Result<()> {
    let mut attempt: i64 = 0;
    loop {
        info!(attempt, max_attempts = retry.attempts, "connecting to registry");
        match bridge.ping() {
            Ok(()) => {
                info!("registry reachable");
                return Ok(());
            }
            Err(e) if retry.exhausted(attempt) => {
                return Err(e.context(format!("registry unreachable after {} attempt(s)", attempt + 1)));
            }
            Err(e) => warn!(error = %e, "registry ping failed"),
        }
        thread::sleep(retry.interval);
        attempt += 1;
    }
}

/// Runs the bridge until the event feed fails or `cancel` fires.
///
/// The initial sync completes before any event is dispatched. Events queued
/// in the meantime are handled afterwards in arrival order. A feed error
/// stops both periodic loops and is returned.
pub async fn run(
    bridge: Arc<Bridge>,
    mut events: mpsc::Receiver<FeedItem>,
    options: &DaemonOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let initial = Arc::clone(&bridge);
    let report = task::spawn_blocking(move || initial.sync(false))
        .await
        .context("initial sync task failed")?;
    info!(
        added = report.added,
        reregistered = report.reregistered,
        stale = report.stale_count(),
        dangling = report.dangling.len(),
        "initial sync done"
    );

    let mut loops = JoinSet::new();
    if !options.refresh_interval.is_zero() {
        loops.spawn(tick_loop(
            "refresh",
            options.refresh_interval,
            Arc::clone(&bridge),
            cancel.clone(),
            |bridge| bridge.refresh(),
        ));
    }
    if !options.resync_interval.is_zero() {
        loops.spawn(tick_loop(
            "resync",
            options.resync_interval,
            Arc::clone(&bridge),
            cancel.clone(),
            |bridge| {
                bridge.sync(true);
            },
        ));
    }

    info!("listening for container events");
    let outcome = loop {
        tokio::select! {
            item = events.recv() => match item {
                Some(Ok(event)) => dispatch(&bridge, event),
                Some(Err(e)) => break Err(e.context("container event feed failed")),
                None => break Err(anyhow!("container event feed closed")),
            },
            _ = cancel.cancelled() => break Ok(()),
        }
    };

    cancel.cancel();
    while let Some(joined) = loops.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "periodic loop ended abnormally");
        }
    }
    outcome
}

/// Hands `start` and `die` events to the bridge on the blocking pool without
/// waiting for them.
fn dispatch(bridge: &Arc<Bridge>, event: ContainerEvent) {
    if !event.is_container() {
        debug!(kind = %event.kind, action = %event.action, "ignoring non-container event");
        return;
    }

    let bridge = Arc::clone(bridge);
    match event.action.as_str() {
        "start" => {
            task::spawn_blocking(move || bridge.add(&event.actor_id, false));
        }
        "die" => {
            task::spawn_blocking(move || bridge.remove_on_exit(&event.actor_id));
        }
        other => debug!(action = other, "ignoring container event"),
    }
}

async fn tick_loop(
    name: &'static str,
    every: Duration,
    bridge: Arc<Bridge>,
    cancel: CancellationToken,
    pass: fn(&Arc<Bridge>),
) {
    let mut ticker = time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let bridge = Arc::clone(&bridge);
                if let Err(e) = task::spawn_blocking(move || pass(&bridge)).await {
                    error!(task = name, error = %e, "periodic pass panicked");
                }
            }
            _ = cancel.cancelled() => {
                debug!(task = name, "stopping periodic loop");
                return;
            }
        }
    }
}
