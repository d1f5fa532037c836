//! Forwarders: the pluggable module behind the forwarding manager's
//! delegate/target selection (spec §4.8). `ForwarderProphet` implements
//! PRoPHET; `ForwarderEmpty` is the no-op forwarder selected when the
//! repository says forwarding is disabled (SPEC_FULL.md §2, "forwarding
//! module selection via repository").

use std::collections::HashMap;

use crate::rib::{Metric, Rib};
use crate::strategy::{ForwardingStrategy, Grtr};

/// A `(node_id, predictability)` pair ready to be embedded in a node
/// description's routing-information metadata (`addRoutingInformation`).
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingMetric {
    pub node_id: String,
    pub p: f64,
}

/// A candidate to carry an object further towards `target`.
#[derive(Clone, Debug, PartialEq)]
pub struct Delegate {
    pub node_id: String,
    pub p_ad: f64,
    pub p_bd: f64,
}

/// The forwarding module contract: given neighbor events and routing
/// information exchanged with them, maintain whatever state is needed to
/// answer "who's a good delegate for this target".
pub trait Forwarder: Send + Sync {
    fn name(&self) -> &'static str;

    /// A neighbor came into range.
    fn new_neighbor(&mut self, neighbor_id: &str, now: u64);

    /// A neighbor went out of range.
    fn end_neighbor(&mut self, neighbor_id: &str, now: u64);

    /// Routing information metadata arrived from `neighbor_id`, reporting
    /// their own predictability to the nodes in `reported`.
    fn new_routing_information(&mut self, neighbor_id: &str, reported: &HashMap<String, f64>, now: u64);

    /// Routing metrics this node should advertise in its own node
    /// description.
    fn routing_information_to_advertise(&mut self, now: u64) -> Vec<RoutingMetric>;

    /// Candidate delegates among currently known neighbors for `target_id`.
    fn delegates_for(&mut self, target_id: &str, neighbor_ids: &[String], now: u64) -> Vec<Delegate>;

    /// Serialize all state as `(node_id, repository_value)` pairs
    /// (`getSaveState`).
    fn save_state(&self) -> Vec<(String, String)>;

    /// Restore a single `(node_id, repository_value)` entry
    /// (`setSaveState`).
    fn restore_state(&mut self, node_id: &str, value: &str) -> bool;
}

/// PRoPHET forwarder: one local RIB plus a copy of every known neighbor's
/// reported RIB, scored through a pluggable `ForwardingStrategy`.
pub struct ForwarderProphet {
    rib: Rib,
    neighbor_ribs: HashMap<String, HashMap<String, f64>>,
    strategy: Box<dyn ForwardingStrategy>,
}

impl ForwarderProphet {
    pub fn new(strategy: Box<dyn ForwardingStrategy>) -> Self {
        Self {
            rib: Rib::new(),
            neighbor_ribs: HashMap::new(),
            strategy,
        }
    }

    pub fn rib(&self) -> &Rib {
        &self.rib
    }
}

impl Default for ForwarderProphet {
    fn default() -> Self {
        Self::new(Box::new(Grtr))
    }
}

impl Forwarder for ForwarderProphet {
    fn name(&self) -> &'static str {
        "Prophet"
    }

    fn new_neighbor(&mut self, neighbor_id: &str, now: u64) {
        self.rib.encounter(neighbor_id, now);
    }

    fn end_neighbor(&mut self, neighbor_id: &str, now: u64) {
        self.rib.neighbor_departed(neighbor_id, now);
    }

    fn new_routing_information(&mut self, neighbor_id: &str, reported: &HashMap<String, f64>, now: u64) {
        self.neighbor_ribs.insert(neighbor_id.to_string(), reported.clone());
        self.rib.apply_transitive_update("self", neighbor_id, reported, now);
    }

    fn routing_information_to_advertise(&mut self, now: u64) -> Vec<RoutingMetric> {
        let ids: Vec<String> = self.rib.iter().map(|(id, _)| id.clone()).collect();
        ids.into_iter()
            .filter_map(|id| {
                let aged = self.rib.age(&id, now);
                if aged.p != 0.0 {
                    Some(RoutingMetric { node_id: id, p: aged.p })
                } else {
                    None
                }
            })
            .collect()
    }

    fn delegates_for(&mut self, target_id: &str, neighbor_ids: &[String], now: u64) -> Vec<Delegate> {
        let p_ad = self.rib.age(target_id, now).p;
        let mut out = Vec::new();
        for neighbor_id in neighbor_ids {
            if neighbor_id == target_id {
                continue;
            }
            let Some(neighbor_rib) = self.neighbor_ribs.get(neighbor_id) else {
                continue;
            };
            let Some(&p_bd) = neighbor_rib.get(target_id) else {
                continue;
            };
            if self.strategy.is_good_delegate(p_ad, p_bd) {
                out.push(Delegate {
                    node_id: neighbor_id.clone(),
                    p_ad,
                    p_bd,
                });
            }
        }
        out
    }

    fn save_state(&self) -> Vec<(String, String)> {
        self.rib
            .iter()
            .map(|(id, metric)| (id.clone(), metric.to_repository_value()))
            .collect()
    }

    fn restore_state(&mut self, node_id: &str, value: &str) -> bool {
        match Metric::from_repository_value(value) {
            Some(metric) => {
                self.rib.set(node_id, metric);
                true
            }
            None => false,
        }
    }
}

/// The no-op forwarder: never proposes a delegate, never learns anything.
/// Selected at startup when the repository disables forwarding
/// (SPEC_FULL.md §2).
#[derive(Clone, Copy, Debug, Default)]
pub struct ForwarderEmpty;

impl Forwarder for ForwarderEmpty {
    fn name(&self) -> &'static str {
        "Empty"
    }

    fn new_neighbor(&mut self, _neighbor_id: &str, _now: u64) {}
    fn end_neighbor(&mut self, _neighbor_id: &str, _now: u64) {}
    fn new_routing_information(&mut self, _neighbor_id: &str, _reported: &HashMap<String, f64>, _now: u64) {}

    fn routing_information_to_advertise(&mut self, _now: u64) -> Vec<RoutingMetric> {
        Vec::new()
    }

    fn delegates_for(&mut self, _target_id: &str, _neighbor_ids: &[String], _now: u64) -> Vec<Delegate> {
        Vec::new()
    }

    fn save_state(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn restore_state(&mut self, _node_id: &str, _value: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Gtmx;

    #[test]
    fn prophet_picks_delegate_with_better_predictability() {
        let mut fwd = ForwarderProphet::new(Box::new(Grtr));
        fwd.new_neighbor("peer-b", 100); // P(self,b) = 0.75
        let mut reported = HashMap::new();
        reported.insert("target".to_string(), 0.95);
        fwd.new_routing_information("peer-b", &reported, 100);

        let delegates = fwd.delegates_for("target", &["peer-b".to_string()], 100);
        assert_eq!(delegates.len(), 1);
        assert_eq!(delegates[0].node_id, "peer-b");
    }

    #[test]
    fn prophet_skips_worse_delegate() {
        let mut fwd = ForwarderProphet::new(Box::new(Grtr));
        fwd.new_neighbor("peer-b", 100);
        let mut reported = HashMap::new();
        reported.insert("target".to_string(), 0.01);
        fwd.new_routing_information("peer-b", &reported, 100);

        let delegates = fwd.delegates_for("target", &["peer-b".to_string()], 100);
        assert!(delegates.is_empty());
    }

    #[test]
    fn save_and_restore_round_trip() {
        let mut fwd = ForwarderProphet::default();
        fwd.new_neighbor("peer-b", 100);
        let saved = fwd.save_state();
        assert_eq!(saved.len(), 1);

        let mut restored = ForwarderProphet::default();
        for (id, value) in &saved {
            assert!(restored.restore_state(id, value));
        }
        assert_eq!(restored.rib().get("peer-b"), fwd.rib().get("peer-b"));
    }

    #[test]
    fn empty_forwarder_never_proposes_delegates() {
        let mut fwd = ForwarderEmpty;
        fwd.new_neighbor("peer-b", 100);
        assert!(fwd.delegates_for("target", &["peer-b".to_string()], 100).is_empty());
        assert!(fwd.save_state().is_empty());
    }

    #[test]
    fn gtmx_strategy_plugs_into_prophet() {
        let mut fwd = ForwarderProphet::new(Box::new(Gtmx::new(0.5)));
        fwd.new_neighbor("peer-b", 100);
        let mut reported = HashMap::new();
        reported.insert("target".to_string(), 0.9);
        fwd.new_routing_information("peer-b", &reported, 100);
        assert_eq!(fwd.delegates_for("target", &["peer-b".to_string()], 100).len(), 1);
    }
}
