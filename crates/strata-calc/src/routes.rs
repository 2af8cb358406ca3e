//! Workload route calculator
//!
//! Emits one route per workload CIDR in the cluster. Remote routes point at
//! the owning node's host address and are withheld until that address is
//! known; local routes are emitted straight away.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use strata_common::model::{EncapMode, IpPool, IpPoolKey, WorkloadEndpoint, WorkloadEndpointKey};
use strata_common::Result;
use tracing::debug;

use crate::lpm::LpmTrie;

/// A route towards a workload CIDR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    /// Destination CIDR
    pub dst: IpNet,
    /// Node hosting the destination
    pub dst_node: String,
    /// Host address of the destination node; None for local routes
    /// whose node address is not known yet
    pub gateway: Option<IpAddr>,
    /// Destination is a workload on this node
    pub local_workload: bool,
    /// Destination lies in an IP pool
    pub in_pool: bool,
    /// Traffic from the destination is NATed when leaving the pool
    pub nat_outgoing: bool,
    /// Encapsulation of the containing pool
    pub encap: EncapMode,
}

/// Receives route changes
pub trait RouteCallbacks {
    /// A route was added or changed
    fn on_route_update(&mut self, route: RouteUpdate) -> Result<()>;

    /// A route went away
    fn on_route_remove(&mut self, dst: IpNet) -> Result<()>;
}

/// Computes routes from workloads, node addresses and pools
#[derive(Debug)]
pub struct RouteCalculator {
    hostname: String,
    wep_nets: HashMap<WorkloadEndpointKey, Vec<IpNet>>,
    net_owners: BTreeMap<IpNet, BTreeSet<WorkloadEndpointKey>>,
    node_ips: HashMap<String, IpAddr>,
    pools: HashMap<IpPoolKey, IpPool>,
    pool_trie: LpmTrie<IpPoolKey>,
    emitted: BTreeMap<IpNet, RouteUpdate>,
}

impl RouteCalculator {
    /// Create a calculator for the node named `hostname`
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            wep_nets: HashMap::new(),
            net_owners: BTreeMap::new(),
            node_ips: HashMap::new(),
            pools: HashMap::new(),
            pool_trie: LpmTrie::new(),
            emitted: BTreeMap::new(),
        }
    }

    /// A workload endpoint anywhere in the cluster changed
    pub fn on_endpoint_update<C: RouteCallbacks + ?Sized>(
        &mut self,
        key: &WorkloadEndpointKey,
        endpoint: Option<&WorkloadEndpoint>,
        cb: &mut C,
    ) -> Result<()> {
        let new: Vec<IpNet> = endpoint
            .map(|ep| ep.nets().copied().collect())
            .unwrap_or_default();
        let old = self.wep_nets.remove(key).unwrap_or_default();
        if !new.is_empty() {
            self.wep_nets.insert(key.clone(), new.clone());
        }

        let mut touched = BTreeSet::new();
        for net in old.iter().filter(|n| !new.contains(n)) {
            if let Some(owners) = self.net_owners.get_mut(net) {
                owners.remove(key);
                if owners.is_empty() {
                    self.net_owners.remove(net);
                }
            }
            touched.insert(*net);
        }
        for net in new.iter().filter(|n| !old.contains(n)) {
            self.net_owners.entry(*net).or_default().insert(key.clone());
            touched.insert(*net);
        }
        for net in touched {
            self.recalc(net, cb)?;
        }
        Ok(())
    }

    /// A node's host address changed
    pub fn on_host_ip_update<C: RouteCallbacks + ?Sized>(
        &mut self,
        node: &str,
        addr: Option<IpAddr>,
        cb: &mut C,
    ) -> Result<()> {
        let changed = match addr {
            Some(addr) => self.node_ips.insert(node.to_string(), addr) != Some(addr),
            None => self.node_ips.remove(node).is_some(),
        };
        if !changed {
            return Ok(());
        }
        let nets: Vec<IpNet> = self
            .net_owners
            .iter()
            .filter(|(_, owners)| owners.first().is_some_and(|k| k.hostname == node))
            .map(|(net, _)| *net)
            .collect();
        debug!(node, routes = nets.len(), "node address changed");
        for net in nets {
            self.recalc(net, cb)?;
        }
        Ok(())
    }

    /// An IP pool changed
    pub fn on_pool_update<C: RouteCallbacks + ?Sized>(
        &mut self,
        key: &IpPoolKey,
        pool: Option<&IpPool>,
        cb: &mut C,
    ) -> Result<()> {
        let old = self.pools.remove(key);
        if let Some(old) = &old {
            self.pool_trie.remove(&old.cidr, key);
        }
        if let Some(pool) = pool {
            self.pool_trie.insert(&pool.cidr, key.clone());
            self.pools.insert(key.clone(), pool.clone());
        }
        if old.as_ref() == pool {
            return Ok(());
        }
        let nets: Vec<IpNet> = self
            .net_owners
            .keys()
            .filter(|net| old.iter().chain(pool).any(|p| p.cidr.contains(*net)))
            .copied()
            .collect();
        for net in nets {
            self.recalc(net, cb)?;
        }
        Ok(())
    }

    /// Routes currently emitted
    pub fn routes(&self) -> impl Iterator<Item = &RouteUpdate> {
        self.emitted.values()
    }

    fn desired(&self, dst: IpNet) -> Option<RouteUpdate> {
        // Lowest key wins when several endpoints claim one CIDR.
        let owner = self.net_owners.get(&dst)?.first()?;
        let local = owner.hostname == self.hostname;
        let gateway = self.node_ips.get(&owner.hostname).copied();
        if !local && gateway.is_none() {
            return None;
        }
        let pool = self
            .pool_trie
            .lookup_net(&dst)
            .and_then(|(_, keys)| keys.first())
            .and_then(|key| self.pools.get(key));
        Some(RouteUpdate {
            dst,
            dst_node: owner.hostname.clone(),
            gateway,
            local_workload: local,
            in_pool: pool.is_some(),
            nat_outgoing: pool.is_some_and(|p| p.masquerade),
            encap: pool.map_or(EncapMode::Never, |p| match p.vxlan_mode {
                EncapMode::Never => p.ipip_mode,
                mode => mode,
            }),
        })
    }

    fn recalc<C: RouteCallbacks + ?Sized>(&mut self, dst: IpNet, cb: &mut C) -> Result<()> {
        match self.desired(dst) {
            Some(route) => {
                if self.emitted.get(&dst) != Some(&route) {
                    self.emitted.insert(dst, route.clone());
                    cb.on_route_update(route)?;
                }
            }
            None => {
                if self.emitted.remove(&dst).is_some() {
                    cb.on_route_remove(dst)?;
                }
            }
        }
        Ok(())
    }
}
