//! Tier and policy sorting
//!
//! Tiers sort valid before invalid, then by order (absent order last), then
//! by name. Policies within a tier sort by order, then by name. Both are
//! total orders so re-sorting never moves anything.

use std::cmp::Ordering;
use std::collections::HashMap;

use strata_common::model::{Policy, PolicyKey, Tier, TierKey};
use tracing::debug;

/// The parts of a policy that affect ordering and placement
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PolicyMeta {
    /// Sort order within the tier
    pub order: Option<f64>,
    /// Policy applies to ingress
    pub governs_ingress: bool,
    /// Policy applies to egress
    pub governs_egress: bool,
    /// Policy belongs in the untracked table
    pub do_not_track: bool,
    /// Policy applies before DNAT
    pub pre_dnat: bool,
    /// Policy applies to forwarded traffic
    pub apply_on_forward: bool,
}

impl From<&Policy> for PolicyMeta {
    fn from(policy: &Policy) -> Self {
        Self {
            order: policy.order,
            governs_ingress: policy.governs_ingress(),
            governs_egress: policy.governs_egress(),
            do_not_track: policy.do_not_track,
            pre_dnat: policy.pre_dnat,
            apply_on_forward: policy.apply_on_forward,
        }
    }
}

/// Compare two optional orders, absent sorting last
pub fn compare_order(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Default)]
struct TierInfo {
    order: Option<f64>,
    valid: bool,
    policies: HashMap<PolicyKey, PolicyMeta>,
}

/// One tier in sorted position with its policies in order
#[derive(Debug, Clone, PartialEq)]
pub struct SortedTier {
    /// Tier name
    pub name: String,
    /// Tier order
    pub order: Option<f64>,
    /// False for tiers that only exist because policies reference them
    pub valid: bool,
    /// Policies in order
    pub policies: Vec<(PolicyKey, PolicyMeta)>,
}

/// Maintains the global tier and policy order
#[derive(Debug, Default)]
pub struct PolicySorter {
    tiers: HashMap<String, TierInfo>,
    sorted: Option<Vec<SortedTier>>,
}

impl PolicySorter {
    /// Create an empty sorter
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a tier update; returns true if the order may have changed
    pub fn on_tier_update(&mut self, key: &TierKey, tier: Option<&Tier>) -> bool {
        let changed = match tier {
            Some(tier) => {
                let info = self.tiers.entry(key.name.clone()).or_default();
                let changed = !info.valid || info.order != tier.order;
                info.valid = true;
                info.order = tier.order;
                changed
            }
            None => {
                let Some(info) = self.tiers.get_mut(&key.name) else {
                    return false;
                };
                if info.policies.is_empty() {
                    self.tiers.remove(&key.name);
                } else {
                    // Still referenced: keep it as an invalid placeholder.
                    info.valid = false;
                    info.order = None;
                }
                true
            }
        };
        if changed {
            debug!(tier = %key.name, "tier order changed");
            self.sorted = None;
        }
        changed
    }

    /// Apply a policy update; returns true if the order may have changed
    pub fn on_policy_update(&mut self, key: &PolicyKey, policy: Option<&Policy>) -> bool {
        let changed = match policy {
            Some(policy) => {
                let meta = PolicyMeta::from(policy);
                let info = self.tiers.entry(key.tier.clone()).or_default();
                info.policies.insert(key.clone(), meta) != Some(meta)
            }
            None => {
                let Some(info) = self.tiers.get_mut(&key.tier) else {
                    return false;
                };
                let removed = info.policies.remove(key).is_some();
                if !info.valid && info.policies.is_empty() {
                    self.tiers.remove(&key.tier);
                }
                removed
            }
        };
        if changed {
            self.sorted = None;
        }
        changed
    }

    /// Policy metadata, if the policy is known
    pub fn policy(&self, key: &PolicyKey) -> Option<&PolicyMeta> {
        self.tiers.get(&key.tier)?.policies.get(key)
    }

    /// Names of policies in a tier
    pub fn tier_policies(&self, tier: &str) -> impl Iterator<Item = &PolicyKey> {
        self.tiers
            .get(tier)
            .into_iter()
            .flat_map(|info| info.policies.keys())
    }

    /// Tiers in sorted order, re-sorting only after a change
    pub fn sorted_tiers(&mut self) -> &[SortedTier] {
        let tiers = &self.tiers;
        self.sorted.get_or_insert_with(|| sort_tiers(tiers))
    }
}

fn sort_tiers(tiers: &HashMap<String, TierInfo>) -> Vec<SortedTier> {
    let mut sorted: Vec<SortedTier> = tiers
        .iter()
        .map(|(name, info)| {
            let mut policies: Vec<(PolicyKey, PolicyMeta)> = info
                .policies
                .iter()
                .map(|(k, m)| (k.clone(), *m))
                .collect();
            policies.sort_by(|(ka, ma), (kb, mb)| {
                compare_order(ma.order, mb.order).then_with(|| ka.name.cmp(&kb.name))
            });
            SortedTier {
                name: name.clone(),
                order: info.order,
                valid: info.valid,
                policies,
            }
        })
        .collect();
    sorted.sort_by(|a, b| {
        b.valid
            .cmp(&a.valid)
            .then_with(|| compare_order(a.order, b.order))
            .then_with(|| a.name.cmp(&b.name))
    });
    sorted
}
