//! Ambiguity-safe tunnel binding resolver
//!
//! Pairs each workload address with the tunnel address of the node hosting
//! it. A binding exists only while the workload address has exactly one
//! owning workload endpoint and the node address has exactly one owning
//! node. Workload addresses that exist but cannot be bound are blacklisted.
//!
//! Every update first removes old values from the reverse indexes and
//! re-evaluates what they affected, then adds the new values and
//! re-evaluates again. An owner replaced within one update therefore never
//! looks like two owners.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use strata_common::model::{WorkloadEndpoint, WorkloadEndpointKey};
use strata_common::Result;
use tracing::debug;

/// A workload address reachable through a tunnel address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Binding {
    /// Address of the node hosting the workload
    pub tunnel_addr: IpAddr,
    /// Workload address
    pub workload_addr: IpAddr,
}

/// Receives topology changes
pub trait BindingCallbacks {
    /// A node address gained its first owner
    fn on_tunnel_added(&mut self, addr: IpAddr) -> Result<()>;

    /// A node address lost its last owner
    fn on_tunnel_removed(&mut self, addr: IpAddr) -> Result<()>;

    /// A binding became valid
    fn on_binding_added(&mut self, binding: Binding) -> Result<()>;

    /// A binding stopped being valid
    fn on_binding_removed(&mut self, binding: Binding) -> Result<()>;

    /// A workload address exists but cannot be bound
    fn on_blacklist_added(&mut self, addr: IpAddr) -> Result<()>;

    /// A blacklisted address was bound or went away
    fn on_blacklist_removed(&mut self, addr: IpAddr) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Bound { tunnel: IpAddr },
    Blacklisted,
}

/// Maintains bindings from node and workload address relations
#[derive(Debug, Default)]
pub struct BindingResolver {
    node_addr: HashMap<String, IpAddr>,
    addr_to_nodes: HashMap<IpAddr, BTreeSet<String>>,
    wep_addrs: HashMap<WorkloadEndpointKey, BTreeSet<IpAddr>>,
    addr_to_weps: HashMap<IpAddr, BTreeSet<WorkloadEndpointKey>>,
    node_to_weps: HashMap<String, BTreeSet<WorkloadEndpointKey>>,
    emitted: BTreeMap<IpAddr, Resolution>,
}

impl BindingResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// A node's host address was set, changed or cleared
    pub fn on_host_ip_update<C: BindingCallbacks + ?Sized>(
        &mut self,
        node: &str,
        addr: Option<IpAddr>,
        cb: &mut C,
    ) -> Result<()> {
        let old = self.node_addr.get(node).copied();
        if old == addr {
            return Ok(());
        }
        debug!(node, ?old, new = ?addr, "node address changed");

        if let Some(old) = old {
            self.node_addr.remove(node);
            let affected = self.nodes_at(old);
            let now_empty = match self.addr_to_nodes.get_mut(&old) {
                Some(nodes) => {
                    nodes.remove(node);
                    nodes.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.addr_to_nodes.remove(&old);
            }
            self.reevaluate_nodes(&affected, cb)?;
            if now_empty {
                cb.on_tunnel_removed(old)?;
            }
        }

        if let Some(new) = addr {
            self.node_addr.insert(node.to_string(), new);
            let nodes = self.addr_to_nodes.entry(new).or_default();
            let first = nodes.is_empty();
            nodes.insert(node.to_string());
            if first {
                cb.on_tunnel_added(new)?;
            }
            let affected = self.nodes_at(new);
            self.reevaluate_nodes(&affected, cb)?;
        }
        Ok(())
    }

    /// A workload endpoint was created, updated or deleted
    ///
    /// Only IPv4 addresses take part in bindings.
    pub fn on_endpoint_update<C: BindingCallbacks + ?Sized>(
        &mut self,
        key: &WorkloadEndpointKey,
        endpoint: Option<&WorkloadEndpoint>,
        cb: &mut C,
    ) -> Result<()> {
        let new: BTreeSet<IpAddr> = endpoint
            .map(|ep| ep.ipv4_nets.iter().map(|net| net.addr()).collect())
            .unwrap_or_default();
        let old = self.wep_addrs.get(key).cloned().unwrap_or_default();
        if old == new {
            return Ok(());
        }

        for addr in old.difference(&new) {
            if let Some(weps) = self.addr_to_weps.get_mut(addr) {
                weps.remove(key);
                if weps.is_empty() {
                    self.addr_to_weps.remove(addr);
                }
            }
            self.reevaluate(*addr, cb)?;
        }

        if new.is_empty() {
            self.wep_addrs.remove(key);
            if let Some(weps) = self.node_to_weps.get_mut(&key.hostname) {
                weps.remove(key);
                if weps.is_empty() {
                    self.node_to_weps.remove(&key.hostname);
                }
            }
        } else {
            self.wep_addrs.insert(key.clone(), new.clone());
            self.node_to_weps
                .entry(key.hostname.clone())
                .or_default()
                .insert(key.clone());
        }

        for addr in new.difference(&old) {
            self.addr_to_weps.entry(*addr).or_default().insert(key.clone());
            self.reevaluate(*addr, cb)?;
        }
        Ok(())
    }

    /// Currently emitted bindings
    pub fn bindings(&self) -> impl Iterator<Item = Binding> + '_ {
        self.emitted.iter().filter_map(|(addr, res)| match res {
            Resolution::Bound { tunnel } => Some(Binding {
                tunnel_addr: *tunnel,
                workload_addr: *addr,
            }),
            Resolution::Blacklisted => None,
        })
    }

    /// Currently blacklisted workload addresses
    pub fn blacklist(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.emitted
            .iter()
            .filter(|(_, res)| **res == Resolution::Blacklisted)
            .map(|(addr, _)| *addr)
    }

    /// Nodes sharing `addr`, including any being removed from it
    fn nodes_at(&self, addr: IpAddr) -> Vec<String> {
        self.addr_to_nodes
            .get(&addr)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn reevaluate_nodes<C: BindingCallbacks + ?Sized>(
        &mut self,
        nodes: &[String],
        cb: &mut C,
    ) -> Result<()> {
        let addrs: BTreeSet<IpAddr> = nodes
            .iter()
            .filter_map(|node| self.node_to_weps.get(node))
            .flatten()
            .filter_map(|wep| self.wep_addrs.get(wep))
            .flatten()
            .copied()
            .collect();
        for addr in addrs {
            self.reevaluate(addr, cb)?;
        }
        Ok(())
    }

    /// What `addr` should resolve to given current state
    fn resolve(&self, addr: IpAddr) -> Option<Resolution> {
        let owners = self.addr_to_weps.get(&addr)?;
        let mut iter = owners.iter();
        let (Some(owner), None) = (iter.next(), iter.next()) else {
            return Some(Resolution::Blacklisted);
        };
        let Some(tunnel) = self.node_addr.get(&owner.hostname).copied() else {
            return Some(Resolution::Blacklisted);
        };
        match self.addr_to_nodes.get(&tunnel) {
            Some(nodes) if nodes.len() == 1 => Some(Resolution::Bound { tunnel }),
            _ => Some(Resolution::Blacklisted),
        }
    }

    fn reevaluate<C: BindingCallbacks + ?Sized>(&mut self, addr: IpAddr, cb: &mut C) -> Result<()> {
        let desired = self.resolve(addr);
        let current = self.emitted.get(&addr).copied();
        if desired == current {
            return Ok(());
        }
        match current {
            Some(Resolution::Bound { tunnel }) => cb.on_binding_removed(Binding {
                tunnel_addr: tunnel,
                workload_addr: addr,
            })?,
            Some(Resolution::Blacklisted) => cb.on_blacklist_removed(addr)?,
            None => {}
        }
        match desired {
            Some(res @ Resolution::Bound { tunnel }) => {
                self.emitted.insert(addr, res);
                cb.on_binding_added(Binding {
                    tunnel_addr: tunnel,
                    workload_addr: addr,
                })?;
            }
            Some(Resolution::Blacklisted) => {
                self.emitted.insert(addr, Resolution::Blacklisted);
                cb.on_blacklist_added(addr)?;
            }
            None => {
                self.emitted.remove(&addr);
            }
        }
        Ok(())
    }
}
