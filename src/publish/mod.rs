//! Create-or-update publication of reports.
//!
//! The first successful publish for a target sends a new message; every
//! later publish edits that message in place.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::report::ReportPayload;

/// Chat platform error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("channel {0} not found")]
    ChannelNotFound(u64),
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("invalid payload: {0}")]
    Payload(String),
}

/// Reference to a published report message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub channel_id: u64,
    pub message_id: u64,
}

/// Outbound side of the chat platform.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Check that the channel exists and is reachable.
    async fn resolve_channel(&self, channel_id: u64) -> Result<(), ChatError>;
    async fn send_report(&self, channel_id: u64, payload: &ReportPayload) -> Result<MessageHandle, ChatError>;
    async fn edit_report(&self, handle: &MessageHandle, payload: &ReportPayload) -> Result<(), ChatError>;
}

/// What to do when editing an existing report fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditFailurePolicy {
    /// Keep the handle and try editing again next tick. Never duplicates a
    /// report, but updates stop if the message was deleted.
    #[default]
    KeepHandle,
    /// Forget the handle and send a fresh report right away.
    Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Created(MessageHandle),
    Edited(MessageHandle),
    /// Channel lookup failed, nothing was sent.
    ChannelUnavailable(ChatError),
    SendFailed(ChatError),
    EditFailed(ChatError),
}

impl PublishOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PublishOutcome::Created(_) | PublishOutcome::Edited(_))
    }
}

/// Per-target publication state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishState {
    pub handle: Option<MessageHandle>,
    pub last_outcome: Option<PublishOutcome>,
}

/// How a publish attempt changes the stored handle.
enum HandleChange {
    Keep,
    Set(MessageHandle),
    Clear,
}

/// Owner of every target's report handle.
pub struct Publisher {
    client: Arc<dyn ChatClient>,
    policy: EditFailurePolicy,
    states: Mutex<HashMap<String, PublishState>>,
}

impl Publisher {
    pub fn new(client: Arc<dyn ChatClient>, policy: EditFailurePolicy) -> Self {
        Self {
            client,
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn state(&self, target_id: &str) -> PublishState {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(target_id).cloned().unwrap_or_default()
    }

    fn handle(&self, target_id: &str) -> Option<MessageHandle> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(target_id).and_then(|s| s.handle)
    }

    /// Store the result of a publish attempt. Returns true when it ends a
    /// run of failures.
    fn update(&self, target_id: &str, change: HandleChange, outcome: &PublishOutcome) -> bool {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(target_id.to_string()).or_default();
        match change {
            HandleChange::Keep => {}
            HandleChange::Set(handle) => state.handle = Some(handle),
            HandleChange::Clear => state.handle = None,
        }
        let previous = state.last_outcome.replace(outcome.clone());
        recovered(previous.as_ref(), outcome)
    }

    /// Publish `payload` as the target's report in `channel_id`.
    pub async fn publish(&self, target_id: &str, channel_id: u64, payload: &ReportPayload) -> PublishOutcome {
        if let Err(e) = self.client.resolve_channel(channel_id).await {
            tracing::error!("Channel {} not available for {}: {}", channel_id, target_id, e);
            let outcome = PublishOutcome::ChannelUnavailable(e);
            self.update(target_id, HandleChange::Keep, &outcome);
            return outcome;
        }

        let (outcome, change) = match self.handle(target_id) {
            Some(handle) => match self.client.edit_report(&handle, payload).await {
                Ok(()) => (PublishOutcome::Edited(handle), HandleChange::Keep),
                Err(e) => {
                    tracing::error!("Failed to edit status message for {}: {}", target_id, e);
                    match self.policy {
                        EditFailurePolicy::KeepHandle => (PublishOutcome::EditFailed(e), HandleChange::Keep),
                        EditFailurePolicy::Recreate => {
                            tracing::info!("Re-creating status message for {}", target_id);
                            self.send(target_id, channel_id, payload).await
                        }
                    }
                }
            },
            None => self.send(target_id, channel_id, payload).await,
        };

        if self.update(target_id, change, &outcome) {
            tracing::info!("Status updates recovered for {}", target_id);
        }
        if outcome.is_success() {
            tracing::info!("Status updated: {}", target_id);
        }
        outcome
    }

    async fn send(
        &self,
        target_id: &str,
        channel_id: u64,
        payload: &ReportPayload,
    ) -> (PublishOutcome, HandleChange) {
        match self.client.send_report(channel_id, payload).await {
            Ok(handle) => (PublishOutcome::Created(handle), HandleChange::Set(handle)),
            Err(e) => {
                tracing::error!("Failed to send status message for {}: {}", target_id, e);
                // A recreate attempt that fails leaves no usable handle behind
                let change = match self.policy {
                    EditFailurePolicy::Recreate => HandleChange::Clear,
                    EditFailurePolicy::KeepHandle => HandleChange::Keep,
                };
                (PublishOutcome::SendFailed(e), change)
            }
        }
    }
}

fn recovered(previous: Option<&PublishOutcome>, current: &PublishOutcome) -> bool {
    matches!(previous, Some(p) if !p.is_success()) && current.is_success()
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingChat;
    use super::*;
    use crate::config::Color;
    use chrono::Utc;
    use std::sync::Arc;

    fn payload() -> ReportPayload {
        ReportPayload {
            title: "status".to_string(),
            color: Color(0),
            fields: Vec::new(),
            image: None,
            next_update: None,
            footer: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn publisher(chat: &Arc<RecordingChat>, policy: EditFailurePolicy) -> Publisher {
        Publisher::new(chat.clone(), policy)
    }

    #[tokio::test]
    async fn test_first_publish_creates_then_edits() {
        let chat = Arc::new(RecordingChat::default());
        let publisher = publisher(&chat, EditFailurePolicy::KeepHandle);
        assert_eq!(publisher.state("smp"), PublishState::default());

        let first = publisher.publish("smp", 7, &payload()).await;
        let PublishOutcome::Created(handle) = first else {
            panic!("expected create, got {:?}", first);
        };
        assert_eq!(handle.channel_id, 7);

        for _ in 0..3 {
            assert_eq!(publisher.publish("smp", 7, &payload()).await, PublishOutcome::Edited(handle));
        }
        assert_eq!(chat.sends(), 1);
        assert_eq!(chat.edits(), 3);
        assert_eq!(publisher.state("smp").handle, Some(handle));
    }

    #[tokio::test]
    async fn test_missing_channel_short_circuits() {
        let chat = Arc::new(RecordingChat::default());
        let publisher = publisher(&chat, EditFailurePolicy::KeepHandle);
        chat.set(&chat.missing_channel, true);

        let outcome = publisher.publish("smp", 7, &payload()).await;
        assert_eq!(outcome, PublishOutcome::ChannelUnavailable(ChatError::ChannelNotFound(7)));
        assert_eq!(chat.sends() + chat.edits(), 0);

        let state = publisher.state("smp");
        assert!(state.handle.is_none());
        assert_eq!(state.last_outcome, Some(outcome));
    }

    #[tokio::test]
    async fn test_edit_failure_keeps_handle() {
        let chat = Arc::new(RecordingChat::default());
        let publisher = publisher(&chat, EditFailurePolicy::KeepHandle);
        let PublishOutcome::Created(handle) = publisher.publish("smp", 7, &payload()).await else {
            panic!("expected create");
        };

        chat.set(&chat.fail_edits, true);
        let outcome = publisher.publish("smp", 7, &payload()).await;
        assert!(matches!(outcome, PublishOutcome::EditFailed(_)));
        assert_eq!(publisher.state("smp").handle, Some(handle));
        assert_eq!(chat.sends(), 1);

        // Recovers in place once edits work again
        chat.set(&chat.fail_edits, false);
        assert_eq!(publisher.publish("smp", 7, &payload()).await, PublishOutcome::Edited(handle));
        assert_eq!(chat.sends(), 1);
    }

    #[tokio::test]
    async fn test_edit_failure_recreate_policy() {
        let chat = Arc::new(RecordingChat::default());
        let publisher = publisher(&chat, EditFailurePolicy::Recreate);
        let PublishOutcome::Created(first) = publisher.publish("smp", 7, &payload()).await else {
            panic!("expected create");
        };

        chat.set(&chat.fail_edits, true);
        let PublishOutcome::Created(second) = publisher.publish("smp", 7, &payload()).await else {
            panic!("expected re-create");
        };
        assert_ne!(first, second);
        assert_eq!(chat.sends(), 2);
        assert_eq!(publisher.state("smp").handle, Some(second));
    }

    #[tokio::test]
    async fn test_recreate_send_failure_clears_handle() {
        let chat = Arc::new(RecordingChat::default());
        let publisher = publisher(&chat, EditFailurePolicy::Recreate);
        publisher.publish("smp", 7, &payload()).await;

        chat.set(&chat.fail_edits, true);
        chat.set(&chat.fail_sends, true);
        let outcome = publisher.publish("smp", 7, &payload()).await;
        assert!(matches!(outcome, PublishOutcome::SendFailed(_)));
        assert!(publisher.state("smp").handle.is_none());
    }

    #[tokio::test]
    async fn test_send_failure_stays_unpublished() {
        let chat = Arc::new(RecordingChat::default());
        let publisher = publisher(&chat, EditFailurePolicy::KeepHandle);
        chat.set(&chat.fail_sends, true);

        assert!(matches!(
            publisher.publish("smp", 7, &payload()).await,
            PublishOutcome::SendFailed(_)
        ));
        assert!(publisher.state("smp").handle.is_none());

        chat.set(&chat.fail_sends, false);
        assert!(matches!(
            publisher.publish("smp", 7, &payload()).await,
            PublishOutcome::Created(_)
        ));
    }

    #[tokio::test]
    async fn test_targets_have_separate_handles() {
        let chat = Arc::new(RecordingChat::default());
        let publisher = publisher(&chat, EditFailurePolicy::KeepHandle);

        publisher.publish("a", 7, &payload()).await;
        publisher.publish("b", 7, &payload()).await;
        assert_eq!(chat.sends(), 2);
        assert_ne!(publisher.state("a").handle, publisher.state("b").handle);
    }

    #[tokio::test]
    async fn test_outcome_tracks_failure_and_recovery() {
        let chat = Arc::new(RecordingChat::default());
        let publisher = publisher(&chat, EditFailurePolicy::KeepHandle);
        let PublishOutcome::Created(handle) = publisher.publish("smp", 7, &payload()).await else {
            panic!("expected create");
        };

        chat.set(&chat.missing_channel, true);
        let failed = publisher.publish("smp", 7, &payload()).await;
        assert_eq!(publisher.state("smp").last_outcome, Some(failed.clone()));

        chat.set(&chat.missing_channel, false);
        let edited = publisher.publish("smp", 7, &payload()).await;
        assert_eq!(edited, PublishOutcome::Edited(handle));
        assert_eq!(publisher.state("smp").last_outcome, Some(edited.clone()));

        assert!(recovered(Some(&failed), &edited));
        assert!(!recovered(Some(&edited), &edited));
        assert!(!recovered(None, &PublishOutcome::Created(handle)));
        assert!(!recovered(Some(&failed), &failed));
    }
}
