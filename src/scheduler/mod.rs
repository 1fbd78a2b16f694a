//! Scheduler module for running the status pipeline on a timer per target.

mod pipeline;

pub use pipeline::*;

use crate::config::TargetConfig;

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock, Semaphore};

/// What a tick does when the previous tick for the same target is still
/// running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Drop the new tick.
    #[default]
    Skip,
    /// Run the new tick once the previous one finishes.
    Queue,
    /// Run both concurrently.
    Allow,
}

/// Owns one recurring timer per target.
pub struct Scheduler {
    monitor: Arc<Monitor>,
    policy: OverlapPolicy,
    stop_chans: RwLock<HashMap<String, broadcast::Sender<()>>>,
    /// Single permit per target, held by the tick in progress. Outlives
    /// restarts so a replaced loop's tick still blocks the new loop.
    busy: RwLock<HashMap<String, Arc<Semaphore>>>,
}

impl Scheduler {
    pub fn new(monitor: Arc<Monitor>, policy: OverlapPolicy) -> Self {
        Self {
            monitor,
            policy,
            stop_chans: RwLock::new(HashMap::new()),
            busy: RwLock::new(HashMap::new()),
        }
    }

    /// Start monitoring `targets`, replacing any timers already running.
    pub async fn start(&self, targets: &[TargetConfig]) {
        self.stop().await;

        tracing::info!("Starting scheduler with {} targets", targets.len());

        for target in targets {
            self.add_target(Arc::new(target.clone())).await;
        }
    }

    /// Start the timer for one target. Any timer already running for the
    /// same target is cancelled first.
    pub async fn add_target(&self, target: Arc<TargetConfig>) {
        let busy = self
            .busy
            .write()
            .await
            .entry(target.name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let mut stop_chans = self.stop_chans.write().await;

        if let Some(previous) = stop_chans.remove(&target.name) {
            let _ = previous.send(());
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        stop_chans.insert(target.name.clone(), stop_tx);
        drop(stop_chans);

        tracing::info!(
            "Status updates started: {} ({}) every {:?}",
            target.name,
            target.endpoint(),
            target.poll_interval()
        );

        tokio::spawn(run_target_loop(target, self.monitor.clone(), self.policy, busy, stop_rx));
    }

    /// Cancel every timer. Ticks already in flight run to completion.
    pub async fn stop(&self) {
        let mut stop_chans = self.stop_chans.write().await;

        for (name, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
            tracing::info!("Scheduler: Stopped {}", name);
        }
    }

    /// Names of targets with a running timer.
    pub async fn active_targets(&self) -> Vec<String> {
        let stop_chans = self.stop_chans.read().await;
        let mut names: Vec<String> = stop_chans.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Run the timer loop for a single target. The first tick fires immediately.
async fn run_target_loop(
    target: Arc<TargetConfig>,
    monitor: Arc<Monitor>,
    policy: OverlapPolicy,
    busy: Arc<Semaphore>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(target.poll_interval());
    // Missed ticks collapse into one, so at most one tick is ever pending
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {}
        }

        match policy {
            OverlapPolicy::Skip => {
                let Ok(permit) = busy.clone().try_acquire_owned() else {
                    tracing::warn!("Skipping update for {}: previous update still running", target.name);
                    continue;
                };
                let monitor = monitor.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    run_tick(&monitor, &target).await;
                    drop(permit);
                });
            }
            OverlapPolicy::Queue => {
                // Inline: the next tick waits for this one
                let permit = tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break,
                    permit = busy.clone().acquire_owned() => permit,
                };
                run_tick(&monitor, &target).await;
                drop(permit);
            }
            OverlapPolicy::Allow => {
                let monitor = monitor.clone();
                let target = target.clone();
                tokio::spawn(async move { run_tick(&monitor, &target).await });
            }
        }
    }

    tracing::debug!("Scheduler: Loop for {} exited", target.name);
}

async fn run_tick(monitor: &Monitor, target: &TargetConfig) {
    let report = monitor.tick(target).await;
    tracing::debug!(
        "Tick for {}: online={} recorded={} chart={} outcome={:?}",
        target.name,
        report.sample.is_online(),
        report.recorded,
        report.payload.image.is_some(),
        report.outcome
    );
}

#[cfg(test)]
mod tests {
    use super::testing::{monitor, ScriptedProber};
    use super::*;
    use crate::config::test_target;
    use crate::publish::testing::RecordingChat;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::sleep;

    fn fast_target(name: &str, interval_ms: u64) -> TargetConfig {
        let mut target = test_target(name);
        target.poll_interval_ms = interval_ms;
        target
    }

    fn scheduler(prober: &Arc<ScriptedProber>, chat: &Arc<RecordingChat>, policy: OverlapPolicy) -> Scheduler {
        Scheduler::new(Arc::new(monitor(prober.clone(), chat.clone())), policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_ticks_immediately_and_repeats() {
        let prober = Arc::new(ScriptedProber::default());
        let chat = Arc::new(RecordingChat::default());
        let scheduler = scheduler(&prober, &chat, OverlapPolicy::Skip);

        scheduler.start(&[fast_target("Survival", 50)]).await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(prober.calls(), 1);

        // Ticks at 50, 100, 150 and 200 ms
        sleep(Duration::from_millis(200)).await;
        assert_eq!(prober.calls(), 5);
        assert_eq!((chat.sends(), chat.edits()), (1, 4));

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timers() {
        let prober = Arc::new(ScriptedProber::default());
        let chat = Arc::new(RecordingChat::default());
        let scheduler = scheduler(&prober, &chat, OverlapPolicy::Skip);

        scheduler
            .start(&[fast_target("a", 30), fast_target("b", 30)])
            .await;
        sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;
        assert!(scheduler.active_targets().await.is_empty());
        assert_eq!(prober.calls(), 8);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(prober.calls(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_duplicate_timers() {
        let prober = Arc::new(ScriptedProber::default());
        let chat = Arc::new(RecordingChat::default());
        let scheduler = scheduler(&prober, &chat, OverlapPolicy::Allow);
        let targets = [fast_target("Survival", 100)];

        scheduler.start(&targets).await;
        scheduler.start(&targets).await;
        assert_eq!(scheduler.active_targets().await, vec!["Survival".to_string()]);

        // One loop: ticks at 0, 100, 200 and 300 ms
        sleep(Duration::from_millis(350)).await;
        scheduler.stop().await;
        assert_eq!(prober.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_waits_for_tick_in_flight() {
        let prober = Arc::new(ScriptedProber::default().with_delay(Duration::from_millis(150)));
        let chat = Arc::new(RecordingChat::default());
        let scheduler = scheduler(&prober, &chat, OverlapPolicy::Skip);
        let targets = [fast_target("Survival", 100)];

        scheduler.start(&targets).await;
        sleep(Duration::from_millis(20)).await;
        scheduler.start(&targets).await;
        sleep(Duration::from_millis(400)).await;
        scheduler.stop().await;

        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(chat.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_policy_prevents_overlap() {
        let prober = Arc::new(ScriptedProber::default().with_delay(Duration::from_millis(120)));
        let chat = Arc::new(RecordingChat::default());
        let scheduler = scheduler(&prober, &chat, OverlapPolicy::Skip);

        scheduler.start(&[fast_target("Survival", 20)]).await;
        sleep(Duration::from_millis(400)).await;
        scheduler.stop().await;

        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(prober.calls() <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_policy_overlaps() {
        let prober = Arc::new(ScriptedProber::default().with_delay(Duration::from_millis(120)));
        let chat = Arc::new(RecordingChat::default());
        let scheduler = scheduler(&prober, &chat, OverlapPolicy::Allow);

        scheduler.start(&[fast_target("Survival", 20)]).await;
        sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        assert!(prober.max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_policy_serializes() {
        let prober = Arc::new(ScriptedProber::default().with_delay(Duration::from_millis(60)));
        let chat = Arc::new(RecordingChat::default());
        let scheduler = scheduler(&prober, &chat, OverlapPolicy::Queue);

        scheduler.start(&[fast_target("Survival", 20)]).await;
        sleep(Duration::from_millis(250)).await;
        scheduler.stop().await;

        assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(prober.calls() >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_policy_runs_nothing_after_stop() {
        let prober = Arc::new(ScriptedProber::default().with_delay(Duration::from_millis(100)));
        let chat = Arc::new(RecordingChat::default());
        let scheduler = scheduler(&prober, &chat, OverlapPolicy::Queue);

        scheduler.start(&[fast_target("Survival", 10)]).await;
        sleep(Duration::from_millis(300)).await;
        scheduler.stop().await;
        let at_stop = prober.calls();
        assert!(at_stop <= 4, "backlog built up: {} calls", at_stop);

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(prober.calls(), at_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_failures_do_not_stop_timer() {
        let prober = Arc::new(ScriptedProber::default());
        let chat = Arc::new(RecordingChat::default());
        chat.set(&chat.missing_channel, true);
        let scheduler = scheduler(&prober, &chat, OverlapPolicy::Skip);

        scheduler.start(&[fast_target("Survival", 30)]).await;
        sleep(Duration::from_millis(130)).await;
        scheduler.stop().await;

        assert_eq!(prober.calls(), 5);
        assert_eq!(chat.sends() + chat.edits(), 0);
    }
}
