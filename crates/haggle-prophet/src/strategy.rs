//! Delegate-selection strategies (spec §4.8): decide whether a node's
//! predictability for a target beats a candidate delegate's, enough to hand
//! the object off.

/// Compares "my" predictability to a target against a candidate delegate's.
pub trait ForwardingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `p_ad`: this node's predictability of delivering to the target.
    /// `p_bd`: the candidate delegate's predictability of the same.
    /// Returns whether the candidate is a good delegate.
    fn is_good_delegate(&self, p_ad: f64, p_bd: f64) -> bool;
}

/// GRTR: a strict majority rule — the candidate is better than us, full
/// stop.
#[derive(Clone, Copy, Debug, Default)]
pub struct Grtr;

impl ForwardingStrategy for Grtr {
    fn name(&self) -> &'static str {
        "GRTR"
    }

    fn is_good_delegate(&self, p_ad: f64, p_bd: f64) -> bool {
        p_bd > p_ad
    }
}

/// GTMX: GRTR plus a configured predictability floor the delegate's own
/// `P(B,C)` must also clear, used to bound how far a target's reach spreads
/// hop by hop — a delegate only barely better than us is still rejected if
/// its predictability itself isn't high enough to be worth the hop.
#[derive(Clone, Copy, Debug)]
pub struct Gtmx {
    pub threshold: f64,
}

impl Default for Gtmx {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl Gtmx {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl ForwardingStrategy for Gtmx {
    fn name(&self) -> &'static str {
        "GTMX"
    }

    fn is_good_delegate(&self, p_ad: f64, p_bd: f64) -> bool {
        p_bd > p_ad && p_bd > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grtr_requires_strictly_better_delegate() {
        let s = Grtr;
        assert!(s.is_good_delegate(0.3, 0.5));
        assert!(!s.is_good_delegate(0.5, 0.5));
        assert!(!s.is_good_delegate(0.6, 0.5));
    }

    #[test]
    fn gtmx_requires_better_delegate_above_the_configured_floor() {
        let s = Gtmx::new(0.6);
        // Better than us, but below the floor: still not good enough.
        assert!(!s.is_good_delegate(0.3, 0.5));
        // Better than us and above the floor: good.
        assert!(s.is_good_delegate(0.3, 0.7));
        // Above the floor but not better than us: rejected by GRTR half.
        assert!(!s.is_good_delegate(0.8, 0.7));
    }
}
