//! Connectivity tracking and automatic sync triggering.
//!
//! Reachability signals arrive on a `watch` channel, so a burst of flaps is
//! seen as its latest value only. The monitor compares that value with the
//! state it last acted on: a net Offline to Online change dispatches exactly one
//! reconnect run, anything else dispatches nothing. While online an optional
//! timer dispatches periodic runs, stretched by [`Backoff`] after failed runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::sync::backoff::Backoff;
use crate::sync::processor::Processor;
use crate::sync::remote::{HttpEndpoint, RemoteEndpoint};
use crate::sync::{ProcessSummary, SyncProgress, SyncStatus, TriggerReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Connectivity::Online => "online",
            Connectivity::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    CameOnline,
    WentOffline,
}

/// The two-state machine.
#[derive(Debug, Clone)]
pub struct ConnectivityState {
    current: Connectivity,
}

impl ConnectivityState {
    pub fn new(initial: Connectivity) -> Self {
        Self { current: initial }
    }

    pub fn current(&self) -> Connectivity {
        self.current
    }

    pub fn observe(&mut self, reachable: bool) -> Transition {
        let next = Connectivity::from_reachable(reachable);
        let transition = match (self.current, next) {
            (Connectivity::Offline, Connectivity::Online) => Transition::CameOnline,
            (Connectivity::Online, Connectivity::Offline) => Transition::WentOffline,
            _ => Transition::None,
        };
        self.current = next;
        transition
    }
}

/// Where the monitor sends run requests.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn trigger(&self, reason: TriggerReason) -> Result<ProcessSummary>;
}

/// Triggers runs of a shared processor against one endpoint.
pub struct QueueTrigger {
    processor: Arc<Processor>,
    remote: Arc<dyn RemoteEndpoint>,
    progress: Arc<dyn SyncProgress>,
}

impl QueueTrigger {
    pub fn new(
        processor: Arc<Processor>,
        remote: Arc<dyn RemoteEndpoint>,
        progress: Arc<dyn SyncProgress>,
    ) -> Self {
        Self {
            processor,
            remote,
            progress,
        }
    }
}

#[async_trait]
impl SyncTrigger for QueueTrigger {
    async fn trigger(&self, reason: TriggerReason) -> Result<ProcessSummary> {
        self.processor
            .process_queue(self.remote.as_ref(), reason, self.progress.as_ref())
            .await
    }
}

/// Something that can answer "is the sync server reachable right now".
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

#[async_trait]
impl Reachability for HttpEndpoint {
    async fn is_reachable(&self) -> bool {
        self.probe().await
    }
}

/// Probe on a fixed cadence and publish the result. Receivers are only woken
/// when the answer changes.
pub async fn watch_reachability(
    probe: Arc<dyn Reachability>,
    every: Duration,
    signals: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reachable = probe.is_reachable().await;
                signals.send_if_modified(|current| {
                    if *current == reachable {
                        return false;
                    }
                    *current = reachable;
                    true
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Reachability probe stopped");
}

pub struct ConnectivityMonitor {
    trigger: Arc<dyn SyncTrigger>,
    interval: Option<Duration>,
    max_backoff: Duration,
}

impl ConnectivityMonitor {
    pub fn new(trigger: Arc<dyn SyncTrigger>) -> Self {
        Self {
            trigger,
            interval: None,
            max_backoff: Duration::from_secs(900),
        }
    }

    /// Also run every `interval` while online. `None` disables the timer.
    pub fn with_interval(mut self, interval: Option<Duration>, max_backoff: Duration) -> Self {
        self.interval = interval;
        self.max_backoff = max_backoff;
        self
    }

    /// Run until `shutdown` changes or the signal sender goes away.
    ///
    /// The signal's current value is the initial state and is not a transition.
    /// Starting online with the timer enabled schedules a periodic run right away.
    pub async fn run(self, mut signals: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        let initial = Connectivity::from_reachable(*signals.borrow_and_update());
        log::info!("Connectivity: starting {}", initial.as_str());
        let mut state = ConnectivityState::new(initial);
        let mut backoff = self.interval.map(|base| Backoff::new(base, self.max_backoff));
        let mut next_tick = match (initial, &backoff) {
            (Connectivity::Online, Some(_)) => Some(Instant::now()),
            _ => None,
        };

        loop {
            tokio::select! {
                changed = signals.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let reachable = *signals.borrow_and_update();
                    self.on_signal(&mut state, reachable, &mut backoff, &mut next_tick).await;
                }
                _ = sleep_until(next_tick) => {
                    let delay = self.dispatch(TriggerReason::Interval, &mut backoff).await;
                    next_tick = delay.and_then(deadline_after);
                }
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("Connectivity monitor stopped");
    }

    async fn on_signal(
        &self,
        state: &mut ConnectivityState,
        reachable: bool,
        backoff: &mut Option<Backoff>,
        next_tick: &mut Option<Instant>,
    ) {
        match state.observe(reachable) {
            Transition::CameOnline => {
                log::info!("Connectivity: online, syncing queued work");
                let delay = self.dispatch(TriggerReason::Reconnect, backoff).await;
                *next_tick = delay.and_then(deadline_after);
            }
            Transition::WentOffline => {
                log::info!("Connectivity: offline, queued work will wait");
                *next_tick = None;
            }
            Transition::None => {}
        }
    }

    /// The one place runs are started from. Returns the delay before the next
    /// periodic run, if the timer is enabled.
    async fn dispatch(&self, reason: TriggerReason, backoff: &mut Option<Backoff>) -> Option<Duration> {
        let status = match self.trigger.trigger(reason).await {
            Ok(summary) => Some(summary.status),
            Err(Error::ProcessorBusy) => {
                log::debug!("Skipping {} run, another run is active", reason.as_str());
                None
            }
            Err(e) => {
                log::warn!("{} sync run failed: {e}", reason.as_str());
                Some(SyncStatus::Failed)
            }
        };
        let backoff = backoff.as_mut()?;
        Some(match status {
            Some(status) => backoff.record(status),
            None => backoff.delay(),
        })
    }
}

/// `None` when the delay is too far out to represent; the timer then stays off.
fn deadline_after(delay: Duration) -> Option<Instant> {
    let deadline = Instant::now().checked_add(delay);
    if deadline.is_none() {
        log::warn!("Periodic sync delay of {}s is out of range, timer disabled", delay.as_secs());
    }
    deadline
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
