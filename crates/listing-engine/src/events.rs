//! Pipeline event broadcaster for live progress streaming.
//!
//! Events are fire-and-forget. Sending with no subscriber attached is fine,
//! and a lagging subscriber only loses its own backlog.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::Phase;

/// Something observable happened to a product's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    PhaseStarted {
        product_id: String,
        phase: Phase,
        job_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    PhaseProgress {
        product_id: String,
        phase: Phase,
        percentage: u8,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    PhaseCompleted {
        product_id: String,
        phase: Phase,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RetryScheduled {
        product_id: String,
        phase: Phase,
        job_id: String,
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// Retries exhausted; the product now needs manual review.
    #[serde(rename_all = "camelCase")]
    PhaseFailed {
        product_id: String,
        phase: Phase,
        job_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    PipelineCompleted {
        product_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The reconciler marked a phase completed from stored output.
    #[serde(rename_all = "camelCase")]
    PhaseRepaired {
        product_id: String,
        phase: Phase,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    JobReaped {
        product_id: String,
        phase: Phase,
        job_id: String,
        worker_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn product_id(&self) -> &str {
        match self {
            PipelineEvent::PhaseStarted { product_id, .. }
            | PipelineEvent::PhaseProgress { product_id, .. }
            | PipelineEvent::PhaseCompleted { product_id, .. }
            | PipelineEvent::RetryScheduled { product_id, .. }
            | PipelineEvent::PhaseFailed { product_id, .. }
            | PipelineEvent::PipelineCompleted { product_id, .. }
            | PipelineEvent::PhaseRepaired { product_id, .. }
            | PipelineEvent::JobReaped { product_id, .. } => product_id,
        }
    }

    /// The phase concerned, if the event is about a single phase.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            PipelineEvent::PhaseStarted { phase, .. }
            | PipelineEvent::PhaseProgress { phase, .. }
            | PipelineEvent::PhaseCompleted { phase, .. }
            | PipelineEvent::RetryScheduled { phase, .. }
            | PipelineEvent::PhaseFailed { phase, .. }
            | PipelineEvent::PhaseRepaired { phase, .. }
            | PipelineEvent::JobReaped { phase, .. } => Some(*phase),
            PipelineEvent::PipelineCompleted { .. } => None,
        }
    }
}

/// Broadcasts pipeline events to any number of subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<PipelineEvent>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: PipelineEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = EventBroadcaster::new(4);
        broadcaster.send(PipelineEvent::PipelineCompleted {
            product_id: "p".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_send_receive() {
        let broadcaster = EventBroadcaster::new(4);
        let mut rx = broadcaster.subscribe();

        broadcaster.send(PipelineEvent::PhaseCompleted {
            product_id: "p".into(),
            phase: Phase::Pricing,
            timestamp: Utc::now(),
        });

        let received = rx.try_recv().unwrap();
        assert_eq!(received.product_id(), "p");
        assert_eq!(received.phase(), Some(Phase::Pricing));
    }

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::RetryScheduled {
            product_id: "p".into(),
            phase: Phase::MarketResearch,
            job_id: "j".into(),
            retry_count: 1,
            scheduled_at: Utc::now(),
            error: "rate limited".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "retryScheduled");
        assert_eq!(json["productId"], "p");
        assert_eq!(json["retryCount"], 1);
        assert_eq!(json["phase"], "market_research");
    }
}
