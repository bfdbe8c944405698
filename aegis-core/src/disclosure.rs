//! Progressive error disclosure.
//!
//! Repeated occurrences of the same fingerprint inside an observation window
//! collapse into one escalating notification instead of one toast per
//! occurrence. Escalation: 1st occurrence → auto-dismissing toast; 2nd–4th →
//! modal with a retry action; 5th+ → modal with expandable technical detail
//! (power tier only); any critical-severity record → blocking full-screen
//! disclosure regardless of count. Content adapts to the caller's declared
//! experience tier. Decisions are pushed to the UI over a broadcast stream.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::classify::{ErrorRecord, ExperienceTier, Severity};
use crate::config::DisclosureConfig;

/// UI surface a disclosure renders in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisclosureChannel {
    Toast,
    Modal,
    EnhancedModal,
    Fullscreen,
}

/// Action the UI may offer alongside a disclosure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "action")]
pub enum RecoveryAction {
    Dismiss,
    Retry,
    /// Replay every queued offline action.
    RetryAll,
    /// Manually close the named breaker (power tier).
    ResetBreaker { name: String },
    /// Unlock a critically-failed operation for another explicit attempt.
    Acknowledge,
    ContactSupport,
}

/// What the UI should show for one terminal outcome.
#[derive(Debug, Clone, Serialize)]
pub struct DisclosureDecision {
    /// Escalation level, 1..=4.
    pub level: u8,
    pub channel: DisclosureChannel,
    pub message: String,
    /// Expandable technical detail; populated for the power tier only.
    pub detail: Option<String>,
    pub actions: Vec<RecoveryAction>,
    pub record: ErrorRecord,
}

struct Occurrence {
    count: u32,
    last_seen: Instant,
}

/// Maps classified records plus their occurrence history to disclosure
/// decisions, and pushes them to subscribers.
pub struct ErrorDisclosureController {
    window: Duration,
    occurrences: Mutex<HashMap<String, Occurrence>>,
    events: broadcast::Sender<DisclosureDecision>,
}

impl ErrorDisclosureController {
    pub fn new(config: &DisclosureConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            window: config.observation_window,
            occurrences: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to the push-based disclosure stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DisclosureDecision> {
        self.events.subscribe()
    }

    /// Record one occurrence, decide the disclosure, and push it to the UI.
    ///
    /// `pending_actions` is the current offline-queue depth; when non-zero a
    /// "retry all" action is offered.
    pub fn present(&self, mut record: ErrorRecord, pending_actions: usize) -> DisclosureDecision {
        record.occurrence_count = self.observe(&record.fingerprint);
        let decision = self.decide(record, pending_actions);
        debug!(
            fingerprint = %decision.record.fingerprint,
            occurrences = decision.record.occurrence_count,
            level = decision.level,
            "disclosing error"
        );
        let _ = self.events.send(decision.clone());
        decision
    }

    /// Bump and return the occurrence count for a fingerprint, expiring
    /// stale entries first.
    fn observe(&self, fingerprint: &str) -> u32 {
        let mut occurrences = self.occurrences.lock();
        let now = Instant::now();
        occurrences.retain(|_, o| now.duration_since(o.last_seen) <= self.window);

        let entry = occurrences
            .entry(fingerprint.to_string())
            .or_insert(Occurrence {
                count: 0,
                last_seen: now,
            });
        entry.count += 1;
        entry.last_seen = now;
        entry.count
    }

    /// Drop fingerprints whose window has elapsed with no new occurrence.
    pub fn prune(&self) {
        let now = Instant::now();
        self.occurrences
            .lock()
            .retain(|_, o| now.duration_since(o.last_seen) <= self.window);
    }

    fn decide(&self, record: ErrorRecord, pending_actions: usize) -> DisclosureDecision {
        let tier = record.context.experience_tier;

        let level = if record.severity == Severity::Critical {
            4
        } else {
            match record.occurrence_count {
                0 | 1 => 1,
                2..=4 => 2,
                // The enhanced modal is a power-tier surface.
                _ if tier == ExperienceTier::Power => 3,
                _ => 2,
            }
        };

        let channel = match level {
            1 => DisclosureChannel::Toast,
            2 => DisclosureChannel::Modal,
            3 => DisclosureChannel::EnhancedModal,
            _ => DisclosureChannel::Fullscreen,
        };

        let mut actions = Vec::new();
        match level {
            1 => actions.push(RecoveryAction::Dismiss),
            2 | 3 => {
                if record.recoverable {
                    actions.push(RecoveryAction::Retry);
                }
                actions.push(RecoveryAction::Dismiss);
            }
            _ => {
                // Automatic retry stays disabled until the user acts.
                actions.push(RecoveryAction::Acknowledge);
                actions.push(RecoveryAction::ContactSupport);
            }
        }
        if pending_actions > 0 {
            actions.push(RecoveryAction::RetryAll);
        }
        if tier == ExperienceTier::Power {
            if let Some(name) = &record.dependency {
                actions.push(RecoveryAction::ResetBreaker { name: name.clone() });
            }
        }

        let message = match tier {
            ExperienceTier::New => match &record.prevention_tip {
                Some(tip) => format!("{} {}", record.user_message, tip),
                None => record.user_message.clone(),
            },
            _ => record.user_message.clone(),
        };

        let detail = (tier == ExperienceTier::Power).then(|| match &record.developer_detail {
            Some(dev) => format!("{} ({})", record.message, dev),
            None => record.message.clone(),
        });

        DisclosureDecision {
            level,
            channel,
            message,
            detail,
            actions,
            record,
        }
    }
}
