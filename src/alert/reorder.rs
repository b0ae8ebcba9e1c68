use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::models::Measurement;

// ---

/// Holds one station's measurements for a short window so that reports
/// arriving slightly out of order reach rule evaluation in timestamp order.
#[derive(Debug)]
pub struct ReorderBuffer {
    window: Duration,
    pending: BTreeMap<DateTime<Utc>, (Measurement, Instant)>,
}

impl ReorderBuffer {
    // ---
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Buffer a measurement. A second report for a pending timestamp is
    /// merged into the first and keeps its arrival time.
    pub fn push(&mut self, measurement: Measurement, arrived: Instant) {
        // ---
        match self.pending.get_mut(&measurement.timestamp) {
            Some((existing, _)) => existing.merge(&measurement),
            None => {
                self.pending
                    .insert(measurement.timestamp, (measurement, arrived));
            }
        }
    }

    /// Earliest instant at which `release` will return something.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|(_, arrived)| *arrived + self.window)
            .min()
    }

    /// Release every measurement whose hold time has elapsed, together
    /// with anything older than it, in timestamp order.
    pub fn release(&mut self, now: Instant) -> Vec<Measurement> {
        // ---
        let due = self
            .pending
            .iter()
            .filter(|(_, (_, arrived))| *arrived + self.window <= now)
            .map(|(ts, _)| *ts)
            .next_back();

        let Some(cutoff) = due else {
            return Vec::new();
        };

        let later = match cutoff.checked_add_signed(chrono::TimeDelta::microseconds(1)) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };
        let ready = std::mem::replace(&mut self.pending, later);
        ready.into_values().map(|(m, _)| m).collect()
    }

    /// Release everything regardless of hold time.
    pub fn flush(&mut self) -> Vec<Measurement> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|(m, _)| m)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::alert::AlertEvaluator;
    use crate::config::AlertConfig;
    use crate::models::AlertRuleDefinition;
    use chrono::{TimeDelta, TimeZone};
    use proptest::prelude::*;

    fn create_test_measurement(second: i64, value: f64) -> Measurement {
        // ---
        Measurement {
            station_id: "KSEA".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + TimeDelta::seconds(second),
            fields: BTreeMap::from([("temperature".to_string(), value)]),
            provenance: "test".to_string(),
        }
    }

    #[test]
    fn test_release_waits_for_window() {
        // ---
        let window = Duration::from_secs(2);
        let mut buffer = ReorderBuffer::new(window);
        let t0 = Instant::now();

        buffer.push(create_test_measurement(10, 1.0), t0);
        buffer.push(create_test_measurement(5, 2.0), t0 + Duration::from_secs(1));
        assert!(buffer.release(t0 + Duration::from_millis(500)).is_empty());
        assert_eq!(buffer.next_deadline(), Some(t0 + window));

        // The older late arrival is released with the due one
        let released = buffer.release(t0 + window);
        let seconds: Vec<_> = released
            .iter()
            .map(|m| m.timestamp.timestamp() % 60)
            .collect();
        assert_eq!(seconds, vec![5, 10]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_release_keeps_newer_pending() {
        // ---
        let window = Duration::from_secs(2);
        let mut buffer = ReorderBuffer::new(window);
        let t0 = Instant::now();

        buffer.push(create_test_measurement(1, 1.0), t0);
        buffer.push(create_test_measurement(2, 1.0), t0 + Duration::from_secs(1));

        assert_eq!(buffer.release(t0 + window).len(), 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.flush().len(), 1);
    }

    #[test]
    fn test_duplicate_timestamps_merge() {
        // ---
        let mut buffer = ReorderBuffer::new(Duration::ZERO);
        let now = Instant::now();

        let mut partial = create_test_measurement(1, 1.0);
        partial.fields.insert("humidity".to_string(), 80.0);
        buffer.push(partial, now);
        buffer.push(create_test_measurement(1, 3.0), now);

        let released = buffer.release(now);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].value("temperature"), Some(3.0));
        assert_eq!(released[0].value("humidity"), Some(80.0));
    }

    fn transitions(measurements: &[Measurement]) -> Vec<(i64, f64)> {
        // ---
        let evaluator = AlertEvaluator::new(AlertConfig::default());
        evaluator
            .register_rule(AlertRuleDefinition {
                id: "freeze".to_string(),
                station: "KSEA".to_string(),
                condition: "temperature < 0".to_string(),
                topic: None,
                hysteresis: Some(1.0),
                suppress_after: None,
                cooldown_secs: None,
            })
            .unwrap();

        measurements
            .iter()
            .flat_map(|m| evaluator.evaluate(m))
            .map(|fired| (fired.event.timestamp.timestamp(), fired.event.value))
            .collect()
    }

    proptest! {
        #[test]
        fn prop_buffered_permutation_matches_ordered_evaluation(
            (values, order) in prop::collection::vec(-5.0f64..5.0, 1..24)
                .prop_flat_map(|values| {
                    let order = Just((0..values.len()).collect::<Vec<_>>()).prop_shuffle();
                    (Just(values), order)
                })
        ) {
            // ---
            let ordered: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, v)| create_test_measurement(i as i64, *v))
                .collect();

            let mut buffer = ReorderBuffer::new(Duration::from_secs(2));
            let now = Instant::now();
            for i in &order {
                buffer.push(ordered[*i].clone(), now);
            }
            let released = buffer.release(now + Duration::from_secs(2));

            prop_assert_eq!(&released, &ordered);
            prop_assert_eq!(transitions(&released), transitions(&ordered));
        }
    }
}
