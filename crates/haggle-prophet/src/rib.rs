//! The delivery-predictability table itself: aging, encounter updates, and
//! the transitive update rule (spec §4.8 "Forwarding Manager" / PRoPHET).
//!
//! Node identity here is just the node id string (`haggle_core::Node::id_hex`)
//! used directly as a hash map key. The original interns ids into small
//! integers (`id_for_string`, self always 1) to keep its C map fast; a
//! `HashMap<String, _>` is the idiomatic Rust equivalent and the interning
//! table brings no benefit here, so it's dropped (Open Question resolution,
//! see DESIGN.md).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Initial predictability assigned on first encounter with a neighbor.
pub const P_ENCOUNTER: f64 = 0.75;
/// Transitivity scaling constant in the update rule.
pub const BETA: f64 = 0.25;
/// Aging decay constant applied per `AGING_UNIT` elapsed.
pub const GAMMA: f64 = 0.999;
/// How often a metric ages, in seconds (10 minutes).
pub const AGING_UNIT: Duration = Duration::from_secs(600);
/// Metrics below this are floored to exactly zero.
const FLOOR_EPSILON: f64 = 0.000_001;

/// A single `(P, last_aged)` predictability entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub p: f64,
    /// Unix seconds of the last time this metric was aged.
    pub last_aged: u64,
}

impl Metric {
    pub fn new(p: f64, now: u64) -> Self {
        Self { p, last_aged: now }
    }

    /// Age this metric to `now`. A metric that has never been touched
    /// simply has its clock started, matching the original's "new metric,
    /// don't age it yet" branch.
    pub fn age(&mut self, now: u64) {
        if self.last_aged == 0 {
            self.last_aged = now;
            return;
        }
        let elapsed = now.saturating_sub(self.last_aged);
        let k = elapsed / AGING_UNIT.as_secs();
        if k > 0 {
            self.p *= GAMMA.powi(k as i32);
            if self.p < FLOOR_EPSILON {
                self.p = 0.0;
            }
            self.last_aged = now;
        }
    }

    /// Serialize as `"<p>:<last_aged>"`, matching the original's
    /// repository-entry value format (`getSaveState`).
    pub fn to_repository_value(&self) -> String {
        format!("{}:{}", self.p, self.last_aged)
    }

    pub fn from_repository_value(s: &str) -> Option<Self> {
        let (p_str, t_str) = s.split_once(':')?;
        Some(Self {
            p: p_str.parse().ok()?,
            last_aged: t_str.parse().ok()?,
        })
    }
}

/// A full routing-information-base: delivery predictability to every node
/// this table has an opinion about.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Rib {
    entries: HashMap<String, Metric>,
}

impl Rib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<Metric> {
        self.entries.get(node_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Metric)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Age `node_id`'s metric to `now` and return the aged value, creating
    /// an unset (p=0) entry if none existed yet.
    pub fn age(&mut self, node_id: &str, now: u64) -> Metric {
        let metric = self
            .entries
            .entry(node_id.to_string())
            .or_insert_with(|| Metric::new(0.0, 0));
        metric.age(now);
        *metric
    }

    /// Encounter update on direct contact with a neighbor:
    /// `P(n) <- P(n) + (1 - P(n)) * P_encounter`.
    pub fn encounter(&mut self, node_id: &str, now: u64) -> Metric {
        let metric = self
            .entries
            .entry(node_id.to_string())
            .or_insert_with(|| Metric::new(0.0, now));
        metric.p += (1.0 - metric.p) * P_ENCOUNTER;
        metric.last_aged = now;
        *metric
    }

    /// Age-by-one-interval applied when a neighbor goes out of range
    /// (an out-of-draft addition the original keeps as a deliberate
    /// deviation — `_endNeighbor`).
    pub fn neighbor_departed(&mut self, node_id: &str, now: u64) -> Metric {
        let metric = self
            .entries
            .entry(node_id.to_string())
            .or_insert_with(|| Metric::new(0.0, now));
        metric.p *= GAMMA;
        if metric.p < FLOOR_EPSILON {
            metric.p = 0.0;
        }
        metric.last_aged = now;
        *metric
    }

    /// Transitive update from a neighbor `b`'s own table: for every
    /// `(c, P(b,c))` the neighbor reports, fold in
    /// `P(a,c) <- P(a,c) + (1 - P(a,c)) * P(a,b) * P(b,c) * beta`, skipping
    /// `c == self_id` (a node's predictability to itself is always 1 and
    /// never updated).
    pub fn apply_transitive_update(
        &mut self,
        self_id: &str,
        neighbor_id: &str,
        neighbor_reported: &HashMap<String, f64>,
        now: u64,
    ) {
        let p_ab = self.age(neighbor_id, now).p;
        for (c, &p_bc) in neighbor_reported {
            if c == self_id {
                continue;
            }
            let mut p_ac = self.age(c, now);
            p_ac.p += (1.0 - p_ac.p) * p_ab * p_bc * BETA;
            self.entries.insert(c.clone(), p_ac);
        }
    }

    pub fn set(&mut self, node_id: impl Into<String>, metric: Metric) {
        self.entries.insert(node_id.into(), metric);
    }

    pub fn remove(&mut self, node_id: &str) {
        self.entries.remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_metric_starts_clock_without_aging() {
        let mut m = Metric::new(0.5, 0);
        m.age(1000);
        assert_eq!(m.p, 0.5);
        assert_eq!(m.last_aged, 1000);
    }

    #[test]
    fn aging_decays_by_gamma_power_k() {
        let mut m = Metric::new(0.8, 0);
        m.last_aged = 1;
        let elapsed_units = 3u64;
        let now = 1 + elapsed_units * AGING_UNIT.as_secs();
        m.age(now);
        let expected = 0.8 * GAMMA.powi(3);
        assert!((m.p - expected).abs() < 1e-12);
    }

    #[test]
    fn aging_floors_tiny_values_to_zero() {
        let mut m = Metric::new(0.000_000_5, 1);
        m.age(1 + AGING_UNIT.as_secs());
        assert_eq!(m.p, 0.0);
    }

    #[test]
    fn encounter_increases_predictability() {
        let mut rib = Rib::new();
        let m = rib.encounter("peer-a", 100);
        assert!((m.p - P_ENCOUNTER).abs() < 1e-12);
        let m2 = rib.encounter("peer-a", 100);
        assert!(m2.p > m.p);
    }

    #[test]
    fn transitive_update_increases_third_party_predictability() {
        let mut rib = Rib::new();
        rib.set("peer-b", Metric::new(0.9, 0));
        let mut reported = HashMap::new();
        reported.insert("peer-c".to_string(), 0.8);
        rib.apply_transitive_update("self", "peer-b", &reported, 100);
        let p_ac = rib.get("peer-c").unwrap().p;
        assert!(p_ac > 0.0);
    }

    #[test]
    fn transitive_update_skips_self() {
        let mut rib = Rib::new();
        rib.set("peer-b", Metric::new(0.9, 0));
        let mut reported = HashMap::new();
        reported.insert("self".to_string(), 0.99);
        rib.apply_transitive_update("self", "peer-b", &reported, 100);
        assert!(rib.get("self").is_none());
    }

    #[test]
    fn repository_value_round_trip() {
        let m = Metric::new(0.42, 12345);
        let s = m.to_repository_value();
        let parsed = Metric::from_repository_value(&s).unwrap();
        assert_eq!(m, parsed);
    }
}
