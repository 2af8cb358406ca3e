//! Per-endpoint policy resolution
//!
//! Intersects the global tier order with the set of policies matching each
//! local endpoint. Any change marks the endpoint dirty; dirty endpoints are
//! resolved once per flush, and only after the datastore is in sync.

use std::collections::{BTreeSet, HashMap, HashSet};

use strata_common::model::{Endpoint, EndpointKey, Policy, PolicyKey, Tier, TierKey, WorkloadEndpointKey};
use strata_common::Result;
use tracing::{debug, info};

use super::sorter::{PolicyMeta, PolicySorter};
use crate::egress::EgressData;

/// A policy applying to one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredPolicy {
    /// Policy key
    pub key: PolicyKey,
    /// Ordering and placement metadata
    pub meta: PolicyMeta,
}

/// One tier's policies that apply to one endpoint, in order
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredTier {
    /// Tier name
    pub name: String,
    /// Matching policies in order
    pub policies: Vec<FilteredPolicy>,
}

/// Receives resolved endpoints
pub trait PolicyResolverCallbacks {
    /// The endpoint's ordered policies or egress data changed; `endpoint`
    /// is None once it has been deleted
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Endpoint>,
        egress: Option<&EgressData>,
        tiers: &[FilteredTier],
    ) -> Result<()>;
}

/// Resolves the ordered policy list of each local endpoint
#[derive(Debug, Default)]
pub struct PolicyResolver {
    sorter: PolicySorter,
    endpoints: HashMap<EndpointKey, Endpoint>,
    endpoint_policies: HashMap<EndpointKey, HashSet<PolicyKey>>,
    policy_endpoints: HashMap<PolicyKey, HashSet<EndpointKey>>,
    egress: HashMap<WorkloadEndpointKey, EgressData>,
    dirty: BTreeSet<EndpointKey>,
    in_sync: bool,
}

impl PolicyResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or forget a local endpoint
    pub fn on_endpoint_update(&mut self, key: &EndpointKey, endpoint: Option<&Endpoint>) {
        match endpoint {
            Some(ep) => {
                if self.endpoints.get(key) == Some(ep) {
                    return;
                }
                self.endpoints.insert(key.clone(), ep.clone());
            }
            None => {
                if self.endpoints.remove(key).is_none() {
                    return;
                }
                if let EndpointKey::Workload(wep) = key {
                    self.egress.remove(wep);
                }
            }
        }
        self.dirty.insert(key.clone());
    }

    /// Apply a tier update, dirtying endpoints that use the tier
    pub fn on_tier_update(&mut self, key: &TierKey, tier: Option<&Tier>) {
        if !self.sorter.on_tier_update(key, tier) {
            return;
        }
        let affected: Vec<EndpointKey> = self
            .sorter
            .tier_policies(&key.name)
            .filter_map(|p| self.policy_endpoints.get(p))
            .flatten()
            .cloned()
            .collect();
        self.dirty.extend(affected);
    }

    /// Apply a policy update, dirtying the endpoints it matches
    pub fn on_policy_update(&mut self, key: &PolicyKey, policy: Option<&Policy>) {
        if !self.sorter.on_policy_update(key, policy) {
            return;
        }
        if let Some(eps) = self.policy_endpoints.get(key) {
            self.dirty.extend(eps.iter().cloned());
        }
    }

    /// A local endpoint started matching a policy
    pub fn on_policy_match_started(&mut self, policy: &PolicyKey, endpoint: &EndpointKey) {
        self.endpoint_policies
            .entry(endpoint.clone())
            .or_default()
            .insert(policy.clone());
        self.policy_endpoints
            .entry(policy.clone())
            .or_default()
            .insert(endpoint.clone());
        self.dirty.insert(endpoint.clone());
    }

    /// A local endpoint stopped matching a policy
    pub fn on_policy_match_stopped(&mut self, policy: &PolicyKey, endpoint: &EndpointKey) {
        if let Some(policies) = self.endpoint_policies.get_mut(endpoint) {
            policies.remove(policy);
            if policies.is_empty() {
                self.endpoint_policies.remove(endpoint);
            }
        }
        if let Some(endpoints) = self.policy_endpoints.get_mut(policy) {
            endpoints.remove(endpoint);
            if endpoints.is_empty() {
                self.policy_endpoints.remove(policy);
            }
        }
        self.dirty.insert(endpoint.clone());
    }

    /// Egress data for a local workload endpoint changed
    pub fn on_egress_update(&mut self, key: &WorkloadEndpointKey, data: EgressData) {
        if data == EgressData::default() {
            self.egress.remove(key);
        } else {
            self.egress.insert(key.clone(), data);
        }
        self.dirty.insert(EndpointKey::Workload(key.clone()));
    }

    /// The datastore delivered its complete snapshot
    pub fn on_datastore_in_sync(&mut self) {
        if !self.in_sync {
            info!(dirty = self.dirty.len(), "policy resolver in sync");
            self.in_sync = true;
        }
    }

    /// Number of endpoints awaiting resolution
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Resolve every dirty endpoint
    pub fn flush<C: PolicyResolverCallbacks + ?Sized>(&mut self, cb: &mut C) -> Result<()> {
        if !self.in_sync || self.dirty.is_empty() {
            return Ok(());
        }
        let dirty = std::mem::take(&mut self.dirty);
        debug!(endpoints = dirty.len(), "resolving endpoint policies");
        let sorted = self.sorter.sorted_tiers();
        for key in dirty {
            let Some(endpoint) = self.endpoints.get(&key) else {
                cb.on_endpoint_tier_update(&key, None, None, &[])?;
                continue;
            };
            let matched = self.endpoint_policies.get(&key);
            let tiers: Vec<FilteredTier> = sorted
                .iter()
                .filter_map(|tier| {
                    let policies: Vec<FilteredPolicy> = tier
                        .policies
                        .iter()
                        .filter(|(k, _)| matched.is_some_and(|m| m.contains(k)))
                        .map(|(k, meta)| FilteredPolicy {
                            key: k.clone(),
                            meta: *meta,
                        })
                        .collect();
                    (!policies.is_empty()).then(|| FilteredTier {
                        name: tier.name.clone(),
                        policies,
                    })
                })
                .collect();
            let egress = match &key {
                EndpointKey::Workload(wep) => self.egress.get(wep),
                EndpointKey::Host(_) => None,
            };
            cb.on_endpoint_tier_update(&key, Some(endpoint), egress, &tiers)?;
        }
        Ok(())
    }
}
