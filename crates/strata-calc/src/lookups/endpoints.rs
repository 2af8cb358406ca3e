//! Address to endpoint, network set and node lookups
//!
//! Used to annotate flows with the objects behind their addresses.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::RwLock;
use strata_common::model::{Endpoint, EndpointKey, Labels, NetworkSet, NetworkSetKey};

use crate::lpm::LpmTrie;

/// What a lookup knows about an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointData {
    /// Endpoint key
    pub key: EndpointKey,
    /// Endpoint labels
    pub labels: Labels,
    /// Profiles applied to the endpoint
    pub profile_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct LookupState {
    endpoint_addrs: HashMap<EndpointKey, Vec<IpAddr>>,
    by_addr: HashMap<IpAddr, BTreeMap<EndpointKey, Arc<EndpointData>>>,
    network_sets: HashMap<NetworkSetKey, NetworkSet>,
    net_trie: LpmTrie<NetworkSetKey>,
    node_addr: HashMap<String, IpAddr>,
    addr_to_nodes: HashMap<IpAddr, BTreeSet<String>>,
}

/// Shared address lookups; clones share the same cache
#[derive(Debug, Clone, Default)]
pub struct EndpointLookupsCache {
    state: Arc<RwLock<LookupState>>,
}

impl EndpointLookupsCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// An endpoint was created, updated or deleted
    pub fn on_endpoint_update(&self, key: &EndpointKey, endpoint: Option<&Endpoint>) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        for addr in state.endpoint_addrs.remove(key).unwrap_or_default() {
            if let Some(owners) = state.by_addr.get_mut(&addr) {
                owners.remove(key);
                if owners.is_empty() {
                    state.by_addr.remove(&addr);
                }
            }
        }
        let Some(endpoint) = endpoint else {
            return;
        };
        let data = Arc::new(EndpointData {
            key: key.clone(),
            labels: endpoint.labels().clone(),
            profile_ids: endpoint.profile_ids().to_vec(),
        });
        let addrs: Vec<IpAddr> = endpoint.nets().iter().map(IpNet::addr).collect();
        for addr in &addrs {
            state
                .by_addr
                .entry(*addr)
                .or_default()
                .insert(key.clone(), Arc::clone(&data));
        }
        state.endpoint_addrs.insert(key.clone(), addrs);
    }

    /// A network set was created, updated or deleted
    pub fn on_network_set_update(&self, key: &NetworkSetKey, set: Option<&NetworkSet>) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if let Some(old) = state.network_sets.remove(key) {
            for net in &old.nets {
                state.net_trie.remove(net, key);
            }
        }
        if let Some(set) = set {
            for net in &set.nets {
                state.net_trie.insert(net, key.clone());
            }
            state.network_sets.insert(key.clone(), set.clone());
        }
    }

    /// A node's host address changed
    pub fn on_host_ip_update(&self, node: &str, addr: Option<IpAddr>) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if let Some(old) = state.node_addr.remove(node) {
            if let Some(nodes) = state.addr_to_nodes.get_mut(&old) {
                nodes.remove(node);
                if nodes.is_empty() {
                    state.addr_to_nodes.remove(&old);
                }
            }
        }
        if let Some(addr) = addr {
            state.node_addr.insert(node.to_string(), addr);
            state
                .addr_to_nodes
                .entry(addr)
                .or_default()
                .insert(node.to_string());
        }
    }

    /// The endpoint owning `addr`, lowest key first if several claim it
    pub fn get_endpoint(&self, addr: IpAddr) -> Option<Arc<EndpointData>> {
        let state = self.state.read();
        state.by_addr.get(&addr)?.values().next().cloned()
    }

    /// The most specific network set containing `addr`
    pub fn get_network_set(&self, addr: IpAddr) -> Option<(NetworkSetKey, Labels)> {
        let state = self.state.read();
        let (_, keys) = state.net_trie.lookup(addr)?;
        let key = keys.first()?;
        let set = state.network_sets.get(key)?;
        Some((key.clone(), set.labels.clone()))
    }

    /// The node owning `addr`, unless more than one claims it
    pub fn get_node(&self, addr: IpAddr) -> Option<String> {
        let state = self.state.read();
        let nodes = state.addr_to_nodes.get(&addr)?;
        match nodes.len() {
            1 => nodes.first().cloned(),
            _ => None,
        }
    }
}
