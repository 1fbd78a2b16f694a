//! The per-target pipeline run on every tick: probe, record, render, publish.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::TargetConfig;
use crate::history::HistoryTracker;
use crate::probe::{Prober, StatusSample};
use crate::publish::{PublishOutcome, Publisher};
use crate::report::{ReportKind, ReportPayload, ReportRenderer};

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub sample: StatusSample,
    /// Whether the sample went into the history buffer.
    pub recorded: bool,
    pub payload: ReportPayload,
    pub outcome: PublishOutcome,
}

/// Wires the prober, history, renderer and publisher together.
pub struct Monitor {
    prober: Arc<dyn Prober>,
    history: HistoryTracker,
    renderer: ReportRenderer,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    probe_timeout: Duration,
}

impl Monitor {
    pub fn new(
        prober: Arc<dyn Prober>,
        renderer: ReportRenderer,
        publisher: Publisher,
        clock: Arc<dyn Clock>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            prober,
            history: HistoryTracker::new(),
            renderer,
            publisher,
            clock,
            probe_timeout,
        }
    }

    #[cfg(test)]
    pub fn history(&self) -> &HistoryTracker {
        &self.history
    }

    #[cfg(test)]
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Run the full pipeline once for `target`.
    pub async fn tick(&self, target: &TargetConfig) -> TickReport {
        let sample = self
            .prober
            .probe(&target.address, target.port, self.probe_timeout)
            .await;
        let now = self.clock.now();

        // Offline samples are left out so the chart stays continuous
        let recorded = match sample.as_online() {
            Some(status) => {
                self.history
                    .record(&target.name, status, target.history_window_hours, now);
                true
            }
            None => false,
        };

        let history = self.history.snapshot(&target.name);
        let payload = self
            .renderer
            .render(ReportKind::Channel, target, &sample, &history, now);
        let outcome = self
            .publisher
            .publish(&target.name, target.channel_id, &payload)
            .await;

        TickReport {
            sample,
            recorded,
            payload,
            outcome,
        }
    }

    /// Fresh one-off report for the status command. Leaves history and the
    /// published report untouched.
    pub async fn query(&self, target: &TargetConfig) -> ReportPayload {
        let sample = self
            .prober
            .probe(&target.address, target.port, self.probe_timeout)
            .await;
        let history = self.history.snapshot(&target.name);
        self.renderer
            .render(ReportKind::Query, target, &sample, &history, self.clock.now())
    }
}
