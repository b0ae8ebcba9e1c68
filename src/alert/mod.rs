//! Alert rule registry and evaluation.
//!
//! Rules live in an arena indexed by rule id. Each slot owns the state
//! machines of its rule, one per station the rule has observed, so
//! evaluation only needs a read lock on the arena plus the slot's own lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::TimeDelta;
use tracing::{debug, info};

use crate::config::AlertConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::{AlertEvent, AlertRuleDefinition, Measurement, ANY_STATION};

mod condition;
mod machine;
mod reorder;

pub use condition::{Condition, Operator};
pub use machine::{RuleMachine, RuleState, Suppression};
pub use reorder::ReorderBuffer;

// ---

/// Validated, ready-to-evaluate rule.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub station: String,
    pub condition: Condition,
    pub topic: String,
    pub hysteresis: f64,
    pub suppression: Option<Suppression>,
    pub definition: AlertRuleDefinition,
}

impl AlertRule {
    // ---
    pub fn compile(definition: AlertRuleDefinition, defaults: &AlertConfig) -> CoreResult<Self> {
        // ---
        let id = definition.id.trim();
        if id.is_empty() || id.contains('/') || id.chars().any(char::is_whitespace) {
            return Err(CoreError::invalid_rule(format!(
                "rule id '{}' must be non-empty without '/' or whitespace",
                definition.id
            )));
        }

        let station = definition.station.trim();
        if station.is_empty() {
            return Err(CoreError::invalid_rule("station must not be empty"));
        }

        let condition = Condition::parse(&definition.condition)?;

        let hysteresis = match definition.hysteresis {
            Some(h) if !h.is_finite() || h < 0.0 => {
                return Err(CoreError::invalid_rule(format!(
                    "hysteresis must be a non-negative number, got {h}"
                )));
            }
            Some(h) if h > 0.0 && !condition.supports_hysteresis() => {
                return Err(CoreError::invalid_rule(format!(
                    "hysteresis is not supported for '{condition}'"
                )));
            }
            Some(h) => h,
            None if condition.supports_hysteresis() => defaults.default_hysteresis,
            None => 0.0,
        };

        let after = definition
            .suppress_after
            .unwrap_or(defaults.default_suppress_after);
        let cooldown_secs = definition
            .cooldown_secs
            .unwrap_or(defaults.default_cooldown.as_secs());
        let suppression = if after == 0 {
            None
        } else {
            if cooldown_secs == 0 {
                return Err(CoreError::invalid_rule(
                    "cooldown_secs must be positive when suppression is enabled",
                ));
            }
            let cooldown = i64::try_from(cooldown_secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .ok_or_else(|| CoreError::invalid_rule("cooldown_secs out of range"))?;
            Some(Suppression { after, cooldown })
        };

        let topic = match definition.topic.as_deref().map(str::trim) {
            Some("") => return Err(CoreError::invalid_rule("topic must not be empty")),
            Some(topic) => topic.to_string(),
            None => crate::publish::alert_topic(id),
        };

        Ok(AlertRule {
            id: id.to_string(),
            station: station.to_string(),
            condition,
            topic,
            hysteresis,
            suppression,
            definition,
        })
    }

    fn applies_to(&self, m: &Measurement) -> bool {
        (self.station == ANY_STATION || self.station == m.station_id)
            && m.fields.contains_key(&self.condition.field)
    }
}

/// Alert event together with the topic it is published on.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredAlert {
    pub topic: String,
    pub event: AlertEvent,
}

struct RuleSlot {
    rule: Arc<AlertRule>,
    machines: Mutex<HashMap<String, RuleMachine>>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Arc<RuleSlot>>>,
    index: HashMap<String, usize>,
    free: Vec<usize>,
}

/// Registry of alert rules and their evaluation state.
pub struct AlertEvaluator {
    defaults: AlertConfig,
    arena: RwLock<Arena>,
}

impl AlertEvaluator {
    // ---
    pub fn new(defaults: AlertConfig) -> Self {
        Self {
            defaults,
            arena: RwLock::new(Arena::default()),
        }
    }

    /// Register or replace a rule. Replacing resets its evaluation state.
    pub fn register_rule(&self, definition: AlertRuleDefinition) -> CoreResult<Arc<AlertRule>> {
        // ---
        let rule = Arc::new(AlertRule::compile(definition, &self.defaults)?);
        let slot = Arc::new(RuleSlot {
            rule: Arc::clone(&rule),
            machines: Mutex::new(HashMap::new()),
        });

        let mut arena = self.arena.write().unwrap_or_else(|e| e.into_inner());
        match arena.index.get(&rule.id).copied() {
            Some(at) => {
                arena.slots[at] = Some(slot);
                info!(rule_id = %rule.id, condition = %rule.condition, "Alert rule replaced");
            }
            None => {
                let at = match arena.free.pop() {
                    Some(at) => {
                        arena.slots[at] = Some(slot);
                        at
                    }
                    None => {
                        arena.slots.push(Some(slot));
                        arena.slots.len() - 1
                    }
                };
                arena.index.insert(rule.id.clone(), at);
                info!(rule_id = %rule.id, condition = %rule.condition, "Alert rule registered");
            }
        }
        Ok(rule)
    }

    pub fn remove_rule(&self, rule_id: &str) -> CoreResult<()> {
        // ---
        let mut arena = self.arena.write().unwrap_or_else(|e| e.into_inner());
        let at = arena
            .index
            .remove(rule_id)
            .ok_or_else(|| CoreError::RuleNotFound {
                rule_id: rule_id.to_string(),
            })?;
        arena.slots[at] = None;
        arena.free.push(at);
        info!(rule_id = %rule_id, "Alert rule removed");
        Ok(())
    }

    pub fn get_rule(&self, rule_id: &str) -> CoreResult<Arc<AlertRule>> {
        self.slot(rule_id).map(|slot| Arc::clone(&slot.rule))
    }

    /// All registered rules, ordered by id.
    pub fn list_rules(&self) -> Vec<Arc<AlertRule>> {
        // ---
        let arena = self.arena.read().unwrap_or_else(|e| e.into_inner());
        let mut rules: Vec<_> = arena
            .slots
            .iter()
            .flatten()
            .map(|slot| Arc::clone(&slot.rule))
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// State of `rule_id` for `station_id`; a station the rule has not
    /// observed yet reports the initial state.
    pub fn rule_state(&self, rule_id: &str, station_id: &str) -> CoreResult<RuleState> {
        // ---
        let slot = self.slot(rule_id)?;
        let machines = slot.machines.lock().unwrap_or_else(|e| e.into_inner());
        Ok(machines
            .get(station_id)
            .map(RuleMachine::state)
            .unwrap_or_else(|| RuleMachine::default().state()))
    }

    /// States of every station the rule has observed.
    pub fn rule_states(&self, rule_id: &str) -> CoreResult<BTreeMap<String, RuleState>> {
        // ---
        let slot = self.slot(rule_id)?;
        let machines = slot.machines.lock().unwrap_or_else(|e| e.into_inner());
        Ok(machines
            .iter()
            .map(|(station, machine)| (station.clone(), machine.state()))
            .collect())
    }

    /// Run every applicable rule against one measurement.
    ///
    /// Callers feed each station's measurements in timestamp order.
    pub fn evaluate(&self, measurement: &Measurement) -> Vec<FiredAlert> {
        // ---
        let slots: Vec<Arc<RuleSlot>> = {
            let arena = self.arena.read().unwrap_or_else(|e| e.into_inner());
            arena
                .slots
                .iter()
                .flatten()
                .filter(|slot| slot.rule.applies_to(measurement))
                .cloned()
                .collect()
        };

        let mut fired = Vec::new();
        for slot in slots {
            let rule = &slot.rule;
            let Some(value) = measurement.value(&rule.condition.field) else {
                continue;
            };

            let mut machines = slot.machines.lock().unwrap_or_else(|e| e.into_inner());
            let machine = machines.entry(measurement.station_id.clone()).or_default();
            if let Some(event) =
                machine.apply(rule, &measurement.station_id, measurement.timestamp, value)
            {
                debug!(
                    rule_id = %rule.id,
                    station = %measurement.station_id,
                    kind = ?event.kind,
                    value,
                    "Alert transition"
                );
                fired.push(FiredAlert {
                    topic: rule.topic.clone(),
                    event,
                });
            }
        }
        fired
    }

    fn slot(&self, rule_id: &str) -> CoreResult<Arc<RuleSlot>> {
        // ---
        let arena = self.arena.read().unwrap_or_else(|e| e.into_inner());
        arena
            .index
            .get(rule_id)
            .and_then(|&at| arena.slots[at].clone())
            .ok_or_else(|| CoreError::RuleNotFound {
                rule_id: rule_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{AlertStatus, TransitionKind};
    use chrono::{DateTime, TimeZone, Utc};

    fn create_test_definition(id: &str, station: &str, condition: &str) -> AlertRuleDefinition {
        // ---
        AlertRuleDefinition {
            id: id.to_string(),
            station: station.to_string(),
            condition: condition.to_string(),
            topic: None,
            hysteresis: None,
            suppress_after: None,
            cooldown_secs: None,
        }
    }

    fn create_test_measurement(station: &str, minute: i64, field: &str, value: f64) -> Measurement {
        // ---
        let ts: DateTime<Utc> =
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + TimeDelta::minutes(minute);
        Measurement {
            station_id: station.to_string(),
            timestamp: ts,
            fields: BTreeMap::from([(field.to_string(), value)]),
            provenance: "test".to_string(),
        }
    }

    #[test]
    fn test_compile_defaults() {
        // ---
        let defaults = AlertConfig {
            default_hysteresis: 0.5,
            ..AlertConfig::default()
        };
        let rule =
            AlertRule::compile(create_test_definition("freeze", "*", "temperature < 0"), &defaults)
                .unwrap();

        assert_eq!(rule.topic, "weather/alerts/freeze");
        assert_eq!(rule.hysteresis, 0.5);
        assert_eq!(rule.suppression, None);

        // Default hysteresis does not apply to equality checks
        let rule =
            AlertRule::compile(create_test_definition("dead", "*", "wind_speed == 0"), &defaults)
                .unwrap();
        assert_eq!(rule.hysteresis, 0.0);
    }

    #[test]
    fn test_compile_rejections() {
        // ---
        let defaults = AlertConfig::default();
        let mut cases = vec![
            create_test_definition("", "*", "temperature < 0"),
            create_test_definition("a/b", "*", "temperature < 0"),
            create_test_definition("r", "", "temperature < 0"),
            create_test_definition("r", "*", "temperature <"),
        ];

        let mut negative = create_test_definition("r", "*", "temperature < 0");
        negative.hysteresis = Some(-1.0);
        cases.push(negative);

        let mut equality = create_test_definition("r", "*", "temperature == 0");
        equality.hysteresis = Some(1.0);
        cases.push(equality);

        let mut no_cooldown = create_test_definition("r", "*", "temperature < 0");
        no_cooldown.suppress_after = Some(3);
        no_cooldown.cooldown_secs = Some(0);
        cases.push(no_cooldown);

        for def in cases {
            assert!(
                matches!(
                    AlertRule::compile(def.clone(), &defaults),
                    Err(CoreError::InvalidRuleDefinition { .. })
                ),
                "expected rejection for {def:?}"
            );
        }
    }

    #[test]
    fn test_evaluate_station_and_wildcard_rules() {
        // ---
        let evaluator = AlertEvaluator::new(AlertConfig::default());
        evaluator
            .register_rule(create_test_definition("ksea-freeze", "KSEA", "temperature < 0"))
            .unwrap();
        evaluator
            .register_rule(create_test_definition("any-freeze", "*", "temperature < 0"))
            .unwrap();

        let fired = evaluator.evaluate(&create_test_measurement("KSEA", 0, "temperature", -2.0));
        let mut topics: Vec<_> = fired.iter().map(|f| f.topic.as_str()).collect();
        topics.sort();
        assert_eq!(
            topics,
            vec!["weather/alerts/any-freeze", "weather/alerts/ksea-freeze"]
        );

        let fired = evaluator.evaluate(&create_test_measurement("KPDX", 0, "temperature", -2.0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event.rule_id, "any-freeze");
        assert_eq!(fired[0].event.station_id, "KPDX");

        // Wildcard rule tracks each station separately
        let fired = evaluator.evaluate(&create_test_measurement("KPDX", 1, "temperature", 3.0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event.kind, TransitionKind::Cleared);
        assert_eq!(
            evaluator.rule_state("any-freeze", "KSEA").unwrap().status,
            AlertStatus::Triggered
        );
        assert_eq!(evaluator.rule_states("any-freeze").unwrap().len(), 2);
    }

    #[test]
    fn test_measurement_without_field_is_skipped() {
        // ---
        let evaluator = AlertEvaluator::new(AlertConfig::default());
        evaluator
            .register_rule(create_test_definition("r", "*", "temperature < 0"))
            .unwrap();

        let fired = evaluator.evaluate(&create_test_measurement("KSEA", 0, "humidity", -5.0));
        assert!(fired.is_empty());
        assert!(evaluator.rule_states("r").unwrap().is_empty());
    }

    #[test]
    fn test_remove_and_reuse_slot() {
        // ---
        let evaluator = AlertEvaluator::new(AlertConfig::default());
        evaluator
            .register_rule(create_test_definition("a", "*", "temperature < 0"))
            .unwrap();
        evaluator
            .register_rule(create_test_definition("b", "*", "temperature > 30"))
            .unwrap();

        evaluator.remove_rule("a").unwrap();
        assert!(matches!(
            evaluator.remove_rule("a"),
            Err(CoreError::RuleNotFound { .. })
        ));
        assert!(matches!(
            evaluator.rule_state("a", "KSEA"),
            Err(CoreError::RuleNotFound { .. })
        ));

        evaluator
            .register_rule(create_test_definition("c", "*", "humidity > 90"))
            .unwrap();
        let ids: Vec<_> = evaluator.list_rules().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(evaluator
            .evaluate(&create_test_measurement("KSEA", 0, "temperature", -5.0))
            .is_empty());
    }

    #[test]
    fn test_replacing_rule_resets_state() {
        // ---
        let evaluator = AlertEvaluator::new(AlertConfig::default());
        evaluator
            .register_rule(create_test_definition("r", "*", "temperature < 0"))
            .unwrap();
        evaluator.evaluate(&create_test_measurement("KSEA", 0, "temperature", -5.0));

        evaluator
            .register_rule(create_test_definition("r", "*", "temperature < -10"))
            .unwrap();
        assert_eq!(evaluator.list_rules().len(), 1);
        assert_eq!(
            evaluator.rule_state("r", "KSEA").unwrap().status,
            AlertStatus::Normal
        );
    }
}
