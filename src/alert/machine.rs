//! Per-rule state machine.
//!
//! ```text
//!            enters                      Nth trigger in window
//!   Normal ─────────▶ Triggered ─────────────────────────────▶ Suppressed
//!     ▲                  │                                        │
//!     └──── exits ───────┘        cooldown expiry: re-evaluate ◀──┘
//! ```
//!
//! Events are emitted on `Normal → Triggered` and `Triggered → Normal`.
//! While suppressed the condition is still tracked but nothing is emitted;
//! on expiry an event is emitted only if the visible state changed since
//! the last emitted event.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::AlertRule;
use crate::models::{AlertEvent, AlertStatus, TransitionKind};

// ---

/// Triggers allowed within a cooldown window before the rule suppresses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Suppression {
    pub after: u32,
    pub cooldown: TimeDelta,
}

/// Read-only view of a rule's evaluation state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleState {
    pub status: AlertStatus,
    pub last_value: Option<f64>,
    pub last_transition_time: Option<DateTime<Utc>>,
    pub last_evaluated: Option<DateTime<Utc>>,
    pub suppressed_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RuleMachine {
    status: AlertStatus,
    last_value: Option<f64>,
    last_transition: Option<DateTime<Utc>>,
    last_evaluated: Option<DateTime<Utc>>,
    /// Condition state after hysteresis, tracked in every status.
    active: bool,
    last_emitted: Option<TransitionKind>,
    triggers: VecDeque<DateTime<Utc>>,
    suppressed_until: Option<DateTime<Utc>>,
}

impl Default for RuleMachine {
    fn default() -> Self {
        Self {
            status: AlertStatus::Normal,
            last_value: None,
            last_transition: None,
            last_evaluated: None,
            active: false,
            last_emitted: None,
            triggers: VecDeque::new(),
            suppressed_until: None,
        }
    }
}

impl RuleMachine {
    // ---
    pub fn state(&self) -> RuleState {
        RuleState {
            status: self.status,
            last_value: self.last_value,
            last_transition_time: self.last_transition,
            last_evaluated: self.last_evaluated,
            suppressed_until: self.suppressed_until,
        }
    }

    /// Apply one observation. Observations older than the last applied
    /// one are ignored.
    pub fn apply(
        &mut self,
        rule: &AlertRule,
        station_id: &str,
        ts: DateTime<Utc>,
        value: f64,
    ) -> Option<AlertEvent> {
        // ---
        if self.last_evaluated.is_some_and(|last| ts < last) {
            return None;
        }
        self.last_evaluated = Some(ts);
        self.last_value = Some(value);

        self.active = if self.active {
            !rule.condition.exits(value, rule.hysteresis)
        } else {
            rule.condition.enters(value, rule.hysteresis)
        };

        let kind = match self.status {
            AlertStatus::Normal if self.active => {
                self.status = AlertStatus::Triggered;
                self.record_trigger(rule, ts);
                Some(TransitionKind::Triggered)
            }
            AlertStatus::Triggered if !self.active => {
                self.status = AlertStatus::Normal;
                Some(TransitionKind::Cleared)
            }
            AlertStatus::Suppressed if !self.active => {
                self.suppressed_until = None;
                self.triggers.clear();
                self.status = AlertStatus::Normal;
                self.last_transition = Some(ts);
                (self.last_emitted == Some(TransitionKind::Triggered))
                    .then_some(TransitionKind::Cleared)
            }
            AlertStatus::Suppressed if self.suppressed_until.map_or(true, |until| ts >= until) => {
                self.suppressed_until = None;
                self.triggers.clear();
                self.status = if self.active {
                    AlertStatus::Triggered
                } else {
                    AlertStatus::Normal
                };
                self.last_transition = Some(ts);
                let visible = if self.active {
                    TransitionKind::Triggered
                } else {
                    TransitionKind::Cleared
                };
                (self.last_emitted != Some(visible)).then_some(visible)
            }
            _ => None,
        };

        let kind = kind?;
        self.last_transition = Some(ts);
        self.last_emitted = Some(kind);

        Some(AlertEvent {
            event_id: Uuid::new_v4(),
            rule_id: rule.id.clone(),
            station_id: station_id.to_string(),
            field: rule.condition.field.clone(),
            value,
            threshold: rule.condition.threshold,
            kind,
            timestamp: ts,
        })
    }

    /// Count a trigger and enter suppression once the window is full.
    fn record_trigger(&mut self, rule: &AlertRule, ts: DateTime<Utc>) {
        // ---
        let Some(policy) = rule.suppression else {
            return;
        };

        let horizon = ts - policy.cooldown;
        while self.triggers.front().is_some_and(|&t| t <= horizon) {
            self.triggers.pop_front();
        }
        self.triggers.push_back(ts);

        if self.triggers.len() >= policy.after as usize {
            self.status = AlertStatus::Suppressed;
            self.suppressed_until = Some(ts + policy.cooldown);
        }
    }
}
