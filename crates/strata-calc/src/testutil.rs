//! Test helpers: an in-memory label index and a dataplane model

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ipnet::IpNet;
use strata_common::model::{
    HostEndpointKey, IpPool, Labels, PolicyKey, ProfileKey, WorkloadEndpointKey,
};
use strata_common::selector::Selector;

use crate::labels::{LabelIndex, LabelledItem, MatchEvent, MatchTarget};
use crate::routes::RouteUpdate;
use crate::rule_scanner::ParsedRules;
use crate::sequencer::{
    DataplaneMessage, HostEndpointMessage, TierInfo, WorkloadEndpointMessage,
};

// =============================================================================
// Label index
// =============================================================================

/// Label index understanding `all()`, `k == 'v'` and `&&`
///
/// Parentheses around terms are ignored. Parent labels apply first and the
/// item's own labels override them.
#[derive(Debug, Default)]
pub struct TestLabelIndex {
    selectors: BTreeMap<MatchTarget, String>,
    items: BTreeMap<LabelledItem, (Labels, Vec<String>)>,
    parents: BTreeMap<String, Labels>,
    matches: BTreeSet<(MatchTarget, LabelledItem)>,
}

impl TestLabelIndex {
    fn effective_labels(&self, item: &LabelledItem) -> Option<Labels> {
        let (own, parents) = self.items.get(item)?;
        let mut labels = Labels::new();
        for parent in parents {
            if let Some(inherited) = self.parents.get(parent) {
                labels.extend(inherited.clone());
            }
        }
        labels.extend(own.clone());
        Some(labels)
    }

    fn recompute(&mut self, events: &mut Vec<MatchEvent>) {
        let mut now = BTreeSet::new();
        for (target, expression) in &self.selectors {
            for item in self.items.keys() {
                let labels = self.effective_labels(item).unwrap_or_default();
                if evaluate(expression, &labels) {
                    now.insert((target.clone(), item.clone()));
                }
            }
        }
        for (target, item) in self.matches.difference(&now) {
            events.push(MatchEvent::Stopped {
                target: target.clone(),
                item: item.clone(),
            });
        }
        for (target, item) in now.difference(&self.matches) {
            events.push(MatchEvent::Started {
                target: target.clone(),
                item: item.clone(),
            });
        }
        self.matches = now;
    }
}

fn evaluate(expression: &str, labels: &Labels) -> bool {
    expression.split("&&").all(|term| {
        let term = term.trim().trim_start_matches('(');
        if term.starts_with("all()") {
            return true;
        }
        let term = term.trim_end_matches(')');
        let Some((key, value)) = term.split_once("==") else {
            return false;
        };
        let value = value.trim().trim_matches('\'').trim_matches('"');
        labels.get(key.trim()).map(String::as_str) == Some(value)
    })
}

impl LabelIndex for TestLabelIndex {
    fn update_selector(
        &mut self,
        target: MatchTarget,
        selector: &Selector,
        events: &mut Vec<MatchEvent>,
    ) {
        self.selectors
            .insert(target, selector.expression().to_string());
        self.recompute(events);
    }

    fn delete_selector(&mut self, target: &MatchTarget, events: &mut Vec<MatchEvent>) {
        self.selectors.remove(target);
        self.recompute(events);
    }

    fn update_labels(
        &mut self,
        item: LabelledItem,
        labels: &Labels,
        parents: &[String],
        events: &mut Vec<MatchEvent>,
    ) {
        self.items
            .insert(item, (labels.clone(), parents.to_vec()));
        self.recompute(events);
    }

    fn delete_labels(&mut self, item: &LabelledItem, events: &mut Vec<MatchEvent>) {
        self.items.remove(item);
        self.recompute(events);
    }

    fn update_parent_labels(&mut self, parent: &str, labels: &Labels, events: &mut Vec<MatchEvent>) {
        self.parents.insert(parent.to_string(), labels.clone());
        self.recompute(events);
    }

    fn delete_parent_labels(&mut self, parent: &str, events: &mut Vec<MatchEvent>) {
        self.parents.remove(parent);
        self.recompute(events);
    }
}

// =============================================================================
// Dataplane model
// =============================================================================

/// State a dataplane would hold after applying messages in order
///
/// Panics when a message references something not yet programmed or
/// removes something still referenced.
#[derive(Debug, Default, PartialEq)]
pub struct DataplaneState {
    pub config: BTreeMap<String, String>,
    pub ip_sets: BTreeMap<String, BTreeSet<String>>,
    pub policies: BTreeMap<PolicyKey, ParsedRules>,
    pub profiles: BTreeMap<ProfileKey, ParsedRules>,
    pub workload_endpoints: BTreeMap<WorkloadEndpointKey, WorkloadEndpointMessage>,
    pub host_endpoints: BTreeMap<HostEndpointKey, HostEndpointMessage>,
    pub routes: BTreeMap<IpNet, RouteUpdate>,
    pub tunnels: BTreeSet<IpAddr>,
    pub bindings: BTreeMap<IpAddr, IpAddr>,
    pub blacklist: BTreeSet<IpAddr>,
    pub namespaces: BTreeMap<String, Labels>,
    pub service_accounts: BTreeMap<(String, String), Labels>,
    pub host_metadata: BTreeMap<String, IpAddr>,
    pub ipam_pools: BTreeMap<String, IpPool>,
    pub in_sync: bool,
}

impl DataplaneState {
    pub fn apply_all(&mut self, msgs: &[DataplaneMessage]) {
        for msg in msgs {
            self.apply(msg.clone());
        }
    }

    pub fn apply(&mut self, msg: DataplaneMessage) {
        match msg {
            DataplaneMessage::InSync => self.in_sync = true,
            DataplaneMessage::DatastoreNotReady => {}
            DataplaneMessage::ConfigUpdate { config } => self.config = config,
            DataplaneMessage::IpSetUpdate { id, members, .. } => {
                self.ip_sets.insert(id, members.into_iter().collect());
            }
            DataplaneMessage::IpSetDeltaUpdate {
                id,
                added_members,
                removed_members,
            } => {
                let set = self
                    .ip_sets
                    .get_mut(&id)
                    .unwrap_or_else(|| panic!("delta for unknown IP set {id}"));
                for member in removed_members {
                    assert!(set.remove(&member), "removing absent member {member}");
                }
                for member in added_members {
                    assert!(set.insert(member), "adding present member");
                }
            }
            DataplaneMessage::IpSetRemove { id } => {
                assert!(
                    !self.ip_set_referenced(&id),
                    "IP set {id} removed while referenced"
                );
                self.ip_sets.remove(&id).expect("removing unknown IP set");
            }
            DataplaneMessage::ActivePolicyUpdate { id, policy } => {
                self.check_rules(&policy);
                self.policies.insert(id, policy);
            }
            DataplaneMessage::ActivePolicyRemove { id } => {
                assert!(
                    !self.policy_referenced(&id),
                    "policy {id} removed while referenced"
                );
                self.policies.remove(&id).expect("removing unknown policy");
            }
            DataplaneMessage::ActiveProfileUpdate { id, profile } => {
                self.check_rules(&profile);
                self.profiles.insert(id, profile);
            }
            DataplaneMessage::ActiveProfileRemove { id } => {
                self.profiles.remove(&id).expect("removing unknown profile");
            }
            DataplaneMessage::WorkloadEndpointUpdate { id, endpoint } => {
                self.check_tiers(&id.workload_id, &endpoint.tiers);
                for profile in &endpoint.profile_ids {
                    assert!(
                        self.profiles.contains_key(&ProfileKey::new(profile.as_str())),
                        "endpoint references unknown profile {profile}"
                    );
                }
                if let Some(set) = &endpoint.egress_ip_set_id {
                    assert!(self.ip_sets.contains_key(set), "unknown egress set {set}");
                }
                self.workload_endpoints.insert(id, endpoint);
            }
            DataplaneMessage::WorkloadEndpointRemove { id } => {
                self.workload_endpoints.remove(&id);
            }
            DataplaneMessage::HostEndpointUpdate { id, endpoint } => {
                self.check_tiers(&id.endpoint_id, &endpoint.tiers);
                self.host_endpoints.insert(id, endpoint);
            }
            DataplaneMessage::HostEndpointRemove { id } => {
                self.host_endpoints.remove(&id);
            }
            DataplaneMessage::RouteUpdate { route } => {
                self.routes.insert(route.dst, route);
            }
            DataplaneMessage::RouteRemove { dst } => {
                self.routes.remove(&dst);
            }
            DataplaneMessage::TunnelAdd { addr } => {
                assert!(self.tunnels.insert(addr), "duplicate tunnel {addr}");
            }
            DataplaneMessage::TunnelRemove { addr } => {
                assert!(
                    !self.bindings.values().any(|t| *t == addr),
                    "tunnel {addr} removed while bound"
                );
                assert!(self.tunnels.remove(&addr), "removing unknown tunnel {addr}");
            }
            DataplaneMessage::BindingAdd {
                tunnel_addr,
                workload_addrs,
            } => {
                assert!(self.tunnels.contains(&tunnel_addr), "binding to unknown tunnel");
                for addr in workload_addrs {
                    assert!(
                        self.bindings.insert(addr, tunnel_addr).is_none(),
                        "{addr} bound twice"
                    );
                }
            }
            DataplaneMessage::BindingRemove { workload_addrs, .. } => {
                for addr in workload_addrs {
                    self.bindings.remove(&addr).expect("removing unknown binding");
                }
            }
            DataplaneMessage::BlacklistAdd { addrs } => self.blacklist.extend(addrs),
            DataplaneMessage::BlacklistRemove { addrs } => {
                for addr in addrs {
                    self.blacklist.remove(&addr);
                }
            }
            DataplaneMessage::PacketCaptureUpdate { .. }
            | DataplaneMessage::PacketCaptureRemove { .. } => {}
            DataplaneMessage::ServiceAccountUpdate {
                namespace,
                name,
                labels,
            } => {
                self.service_accounts.insert((namespace, name), labels);
            }
            DataplaneMessage::ServiceAccountRemove { namespace, name } => {
                self.service_accounts.remove(&(namespace, name));
            }
            DataplaneMessage::NamespaceUpdate { name, labels } => {
                self.namespaces.insert(name, labels);
            }
            DataplaneMessage::NamespaceRemove { name } => {
                self.namespaces.remove(&name);
            }
            DataplaneMessage::HostMetadataUpdate { hostname, addr } => {
                self.host_metadata.insert(hostname, addr);
            }
            DataplaneMessage::HostMetadataRemove { hostname } => {
                self.host_metadata.remove(&hostname);
            }
            DataplaneMessage::IpamPoolUpdate { id, pool } => {
                self.ipam_pools.insert(id, pool);
            }
            DataplaneMessage::IpamPoolRemove { id } => {
                self.ipam_pools.remove(&id);
            }
        }
    }

    fn check_rules(&self, rules: &ParsedRules) {
        for id in rule_ip_sets(rules) {
            assert!(self.ip_sets.contains_key(id), "rule references unknown IP set {id}");
        }
    }

    fn check_tiers(&self, endpoint: &str, tiers: &[TierInfo]) {
        for tier in tiers {
            for name in tier.ingress_policies.iter().chain(&tier.egress_policies) {
                let key = PolicyKey::new(tier.name.as_str(), name.as_str());
                assert!(
                    self.policies.contains_key(&key),
                    "{endpoint} references unknown policy {key}"
                );
            }
        }
    }

    fn ip_set_referenced(&self, id: &str) -> bool {
        self.policies
            .values()
            .chain(self.profiles.values())
            .any(|rules| rule_ip_sets(rules).any(|set| set == id))
    }

    fn policy_referenced(&self, key: &PolicyKey) -> bool {
        let tiers = self
            .workload_endpoints
            .values()
            .flat_map(|ep| ep.tiers.iter())
            .chain(self.host_endpoints.values().flat_map(|ep| ep.tiers.iter()));
        for tier in tiers {
            if tier.name == key.tier
                && tier
                    .ingress_policies
                    .iter()
                    .chain(&tier.egress_policies)
                    .any(|name| *name == key.name)
            {
                return true;
            }
        }
        false
    }
}

fn rule_ip_sets(rules: &ParsedRules) -> impl Iterator<Item = &str> {
    rules
        .inbound_rules
        .iter()
        .chain(&rules.outbound_rules)
        .flat_map(|rule| {
            rule.src_ip_set_ids
                .iter()
                .chain(&rule.dst_ip_set_ids)
                .chain(&rule.not_src_ip_set_ids)
                .chain(&rule.not_dst_ip_set_ids)
        })
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::model::{EndpointKey, NetworkSetKey};

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_index_reports_start_and_stop() {
        let mut index = TestLabelIndex::default();
        let mut events = Vec::new();
        let item = LabelledItem::NetworkSet(NetworkSetKey {
            name: "ns".to_string(),
        });
        let target = MatchTarget::IpSet("s:x".to_string());

        index.update_selector(
            target.clone(),
            &Selector::from_canonical("(all()) && role == 'db'"),
            &mut events,
        );
        index.update_labels(item.clone(), &labels(&[]), &["p".to_string()], &mut events);
        assert!(events.is_empty());

        index.update_parent_labels("p", &labels(&[("role", "db")]), &mut events);
        assert_eq!(
            events,
            vec![MatchEvent::Started {
                target: target.clone(),
                item: item.clone()
            }]
        );

        events.clear();
        index.update_labels(item.clone(), &labels(&[("role", "web")]), &["p".to_string()], &mut events);
        assert_eq!(events, vec![MatchEvent::Stopped { target, item }]);
    }

    #[test]
    fn test_own_labels_override_parents() {
        let mut index = TestLabelIndex::default();
        let mut events = Vec::new();
        let item = LabelledItem::Endpoint(EndpointKey::Host(HostEndpointKey {
            hostname: "h".to_string(),
            endpoint_id: "eth0".to_string(),
        }));
        index.update_parent_labels("p", &labels(&[("role", "db")]), &mut events);
        index.update_labels(item, &labels(&[("role", "web")]), &["p".to_string()], &mut events);
        index.update_selector(
            MatchTarget::IpSet("s:x".to_string()),
            &Selector::from_canonical("role == 'db'"),
            &mut events,
        );
        assert!(events.is_empty());
    }
}
