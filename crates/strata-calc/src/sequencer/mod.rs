//! Event sequencer
//!
//! Buffers everything the calculators emit between flushes, coalesces it
//! and writes dataplane messages in dependency order: nothing is referenced
//! before it has been sent and nothing is removed while still referenced.
//!
//! Within one flush window an addition followed by a removal of the same
//! object cancels out unless the object had already been sent, and an
//! update equal to what was last sent is dropped.

mod messages;

pub use messages::{
    DataplaneMessage, HostEndpointMessage, SplitTiers, TierInfo, WorkloadEndpointMessage,
};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::mem;
use std::net::IpAddr;

use ipnet::IpNet;
use strata_common::config::{Config, ConfigSource};
use strata_common::metrics::{self, FlushTimer};
use strata_common::model::{
    Endpoint, EndpointKey, HostEndpointKey, IpPool, Labels, PacketCapture, PacketCaptureKey,
    PolicyKey, ProfileKey, WorkloadEndpointKey,
};
use strata_common::{Error, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bindings::{Binding, BindingCallbacks};
use crate::config_batcher::ConfigBatcherCallbacks;
use crate::egress::EgressData;
use crate::ipsets::{IpSetKind, IpSetMember, MemberCallbacks};
use crate::policy::{FilteredTier, PolicyResolverCallbacks};
use crate::routes::{RouteCallbacks, RouteUpdate};
use crate::rule_scanner::ParsedRules;

// =============================================================================
// Seams
// =============================================================================

/// Layered configuration the sequencer merges datastore parameters into
#[cfg_attr(test, mockall::automock)]
pub trait ConfigInterface: Send {
    /// Replace one source's raw values; returns whether the merge changed
    fn update_from(&mut self, raw: &BTreeMap<String, String>, source: ConfigSource)
        -> Result<bool>;

    /// Merged raw values
    fn raw_values(&self) -> BTreeMap<String, String>;
}

impl ConfigInterface for Config {
    fn update_from(
        &mut self,
        raw: &BTreeMap<String, String>,
        source: ConfigSource,
    ) -> Result<bool> {
        Config::update_from(self, raw, source)
    }

    fn raw_values(&self) -> BTreeMap<String, String> {
        Config::raw_values(self)
    }
}

/// Destination of flushed messages
pub trait DataplaneSink {
    /// Deliver one message
    fn send(&mut self, msg: DataplaneMessage) -> Result<()>;
}

impl DataplaneSink for Vec<DataplaneMessage> {
    fn send(&mut self, msg: DataplaneMessage) -> Result<()> {
        self.push(msg);
        Ok(())
    }
}

impl DataplaneSink for mpsc::UnboundedSender<DataplaneMessage> {
    fn send(&mut self, msg: DataplaneMessage) -> Result<()> {
        mpsc::UnboundedSender::send(self, msg).map_err(|_| Error::channel_closed("dataplane"))
    }
}

// =============================================================================
// Pending state
// =============================================================================

/// Coalesced updates and removals of one kind of keyed object
///
/// A strict map treats removal of an object that is not live, or an
/// [`add`](Self::add) of one that already is, as a lifecycle violation.
struct PendingMap<K, V> {
    kind: &'static str,
    strict: bool,
    live: HashSet<K>,
    updates: BTreeMap<K, V>,
    removes: BTreeSet<K>,
    sent: HashMap<K, V>,
}

impl<K, V> PendingMap<K, V>
where
    K: Clone + Ord + Hash + Debug,
    V: Clone + PartialEq,
{
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            strict: false,
            live: HashSet::new(),
            updates: BTreeMap::new(),
            removes: BTreeSet::new(),
            sent: HashMap::new(),
        }
    }

    fn strict(kind: &'static str) -> Self {
        Self {
            strict: true,
            ..Self::new(kind)
        }
    }

    fn update(&mut self, key: K, value: V) {
        self.live.insert(key.clone());
        self.removes.remove(&key);
        if self.sent.get(&key) == Some(&value) {
            self.updates.remove(&key);
        } else {
            self.updates.insert(key, value);
        }
    }

    /// Activate `key`, which must not already be live in a strict map
    fn add(&mut self, key: K, value: V) -> Result<()> {
        if self.strict && self.live.contains(&key) {
            return Err(Error::lifecycle(
                self.kind,
                format!("{key:?}"),
                "activated while already active",
            ));
        }
        self.update(key, value);
        Ok(())
    }

    fn remove(&mut self, key: &K) -> Result<()> {
        if !self.live.remove(key) && self.strict {
            return Err(Error::lifecycle(
                self.kind,
                format!("{key:?}"),
                "removed while not active",
            ));
        }
        self.updates.remove(key);
        if self.sent.contains_key(key) {
            self.removes.insert(key.clone());
        }
        Ok(())
    }

    fn take_updates(&mut self) -> Vec<(K, V)> {
        let updates = mem::take(&mut self.updates);
        for (key, value) in &updates {
            self.sent.insert(key.clone(), value.clone());
        }
        updates.into_iter().collect()
    }

    fn take_removes(&mut self) -> Vec<K> {
        let removes = mem::take(&mut self.removes);
        for key in &removes {
            self.sent.remove(key);
        }
        removes.into_iter().collect()
    }
}

type PendingSet<K> = PendingMap<K, ()>;

#[derive(Default)]
struct PendingIpSets {
    active: HashMap<String, IpSetKind>,
    sent: HashSet<String>,
    added: BTreeMap<String, IpSetKind>,
    removed: BTreeSet<String>,
    added_members: BTreeMap<String, BTreeSet<String>>,
    removed_members: BTreeMap<String, BTreeSet<String>>,
}

impl PendingIpSets {
    fn add_set(&mut self, id: &str, kind: IpSetKind) -> Result<()> {
        if self.active.insert(id.to_string(), kind).is_some() {
            return Err(Error::lifecycle("ip set", id, "activated while already active"));
        }
        // A (re-)added set starts out empty.
        self.added.insert(id.to_string(), kind);
        self.removed.remove(id);
        self.added_members.remove(id);
        self.removed_members.remove(id);
        Ok(())
    }

    fn remove_set(&mut self, id: &str) -> Result<()> {
        if self.active.remove(id).is_none() {
            return Err(Error::lifecycle("ip set", id, "deactivated while not active"));
        }
        if self.sent.contains(id) {
            self.removed.insert(id.to_string());
        }
        self.added.remove(id);
        self.added_members.remove(id);
        self.removed_members.remove(id);
        Ok(())
    }

    fn add_member(&mut self, id: &str, member: String) -> Result<()> {
        if !self.active.contains_key(id) {
            return Err(Error::lifecycle(
                "ip set",
                id,
                format!("member {member} added while not active"),
            ));
        }
        if !remove_nested(&mut self.removed_members, id, &member) {
            self.added_members
                .entry(id.to_string())
                .or_default()
                .insert(member);
        }
        Ok(())
    }

    fn remove_member(&mut self, id: &str, member: String) -> Result<()> {
        if !self.active.contains_key(id) {
            return Err(Error::lifecycle(
                "ip set",
                id,
                format!("member {member} removed while not active"),
            ));
        }
        if !remove_nested(&mut self.added_members, id, &member) && !self.added.contains_key(id) {
            self.removed_members
                .entry(id.to_string())
                .or_default()
                .insert(member);
        }
        Ok(())
    }
}

fn remove_nested(map: &mut BTreeMap<String, BTreeSet<String>>, id: &str, member: &str) -> bool {
    let Some(members) = map.get_mut(id) else {
        return false;
    };
    let removed = members.remove(member);
    if members.is_empty() {
        map.remove(id);
    }
    removed
}

// =============================================================================
// Sequencer
// =============================================================================

/// Coalescing, ordering buffer between the calculators and the dataplane
pub struct EventSequencer {
    config: Box<dyn ConfigInterface>,
    config_sent: bool,
    pending_config: Option<BTreeMap<String, String>>,
    pending_not_ready: bool,
    pending_in_sync: bool,
    in_sync_sent: bool,

    ip_sets: PendingIpSets,
    policies: PendingMap<PolicyKey, ParsedRules>,
    profiles: PendingMap<ProfileKey, ParsedRules>,
    workload_endpoints: PendingMap<WorkloadEndpointKey, WorkloadEndpointMessage>,
    host_endpoints: PendingMap<HostEndpointKey, HostEndpointMessage>,
    captures: PendingMap<(PacketCaptureKey, WorkloadEndpointKey), PacketCapture>,
    service_accounts: PendingMap<(String, String), Labels>,
    namespaces: PendingMap<String, Labels>,
    routes: PendingMap<IpNet, RouteUpdate>,
    tunnels: PendingSet<IpAddr>,
    bindings: PendingSet<Binding>,
    blacklist: PendingSet<IpAddr>,
    host_metadata: PendingMap<String, IpAddr>,
    ipam_pools: PendingMap<String, IpPool>,
}

impl EventSequencer {
    /// Create a sequencer merging datastore configuration into `config`
    pub fn new(config: Box<dyn ConfigInterface>) -> Self {
        Self {
            config,
            config_sent: false,
            pending_config: None,
            pending_not_ready: false,
            pending_in_sync: false,
            in_sync_sent: false,
            ip_sets: PendingIpSets::default(),
            policies: PendingMap::strict("policy"),
            profiles: PendingMap::strict("profile"),
            workload_endpoints: PendingMap::new("workload endpoint"),
            host_endpoints: PendingMap::new("host endpoint"),
            captures: PendingMap::new("packet capture"),
            service_accounts: PendingMap::new("service account"),
            namespaces: PendingMap::new("namespace"),
            routes: PendingMap::new("route"),
            tunnels: PendingSet::strict("tunnel"),
            bindings: PendingSet::strict("binding"),
            blacklist: PendingSet::strict("blacklist"),
            host_metadata: PendingMap::new("host metadata"),
            ipam_pools: PendingMap::new("ipam pool"),
        }
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    /// Datastore finished its initial snapshot; reported once
    pub fn on_datastore_in_sync(&mut self) {
        if !self.in_sync_sent {
            self.pending_in_sync = true;
        }
    }

    /// Datastore connection is not ready
    pub fn on_datastore_not_ready(&mut self) {
        self.pending_not_ready = true;
    }

    /// An IP set became referenced
    pub fn on_ip_set_added(&mut self, id: &str, kind: IpSetKind) -> Result<()> {
        debug!(ip_set = id, ?kind, "IP set added");
        self.ip_sets.add_set(id, kind)
    }

    /// An IP set is no longer referenced
    pub fn on_ip_set_removed(&mut self, id: &str) -> Result<()> {
        debug!(ip_set = id, "IP set removed");
        self.ip_sets.remove_set(id)
    }

    /// A policy is active, or its rules changed
    pub fn on_policy_active(&mut self, key: &PolicyKey, rules: ParsedRules) {
        self.policies.update(key.clone(), rules);
    }

    /// A policy is no longer active
    pub fn on_policy_inactive(&mut self, key: &PolicyKey) -> Result<()> {
        self.policies.remove(key)
    }

    /// A profile is active, or its rules changed
    pub fn on_profile_active(&mut self, key: &ProfileKey, rules: ParsedRules) {
        self.profiles.update(key.clone(), rules);
    }

    /// A profile is no longer active
    pub fn on_profile_inactive(&mut self, key: &ProfileKey) -> Result<()> {
        self.profiles.remove(key)
    }

    /// A packet capture applies to a local endpoint, or its spec changed
    pub fn on_capture_active(
        &mut self,
        key: &PacketCaptureKey,
        endpoint: &WorkloadEndpointKey,
        spec: &PacketCapture,
    ) {
        self.captures
            .update((key.clone(), endpoint.clone()), spec.clone());
    }

    /// A packet capture no longer applies to a local endpoint
    pub fn on_capture_inactive(
        &mut self,
        key: &PacketCaptureKey,
        endpoint: &WorkloadEndpointKey,
    ) -> Result<()> {
        self.captures.remove(&(key.clone(), endpoint.clone()))
    }

    /// Namespace labels set (Some) or the namespace removed (None)
    pub fn on_namespace_update(&mut self, name: &str, labels: Option<&Labels>) -> Result<()> {
        match labels {
            Some(labels) => {
                self.namespaces.update(name.to_string(), labels.clone());
                Ok(())
            }
            None => self.namespaces.remove(&name.to_string()),
        }
    }

    /// Service account labels set (Some) or the account removed (None)
    pub fn on_service_account_update(
        &mut self,
        namespace: &str,
        name: &str,
        labels: Option<&Labels>,
    ) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        match labels {
            Some(labels) => {
                self.service_accounts.update(key, labels.clone());
                Ok(())
            }
            None => self.service_accounts.remove(&key),
        }
    }

    /// A node's host address was set (Some) or cleared (None)
    pub fn on_host_metadata_update(&mut self, hostname: &str, addr: Option<IpAddr>) -> Result<()> {
        match addr {
            Some(addr) => {
                self.host_metadata.update(hostname.to_string(), addr);
                Ok(())
            }
            None => self.host_metadata.remove(&hostname.to_string()),
        }
    }

    /// An IP pool was created or changed (Some) or deleted (None)
    pub fn on_ipam_pool_update(&mut self, id: &str, pool: Option<&IpPool>) -> Result<()> {
        match pool {
            Some(pool) => {
                self.ipam_pools.update(id.to_string(), pool.clone());
                Ok(())
            }
            None => self.ipam_pools.remove(&id.to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    /// Emit everything pending to `sink`; returns the number of messages
    pub fn flush<S: DataplaneSink + ?Sized>(&mut self, sink: &mut S) -> Result<usize> {
        let timer = FlushTimer::start();
        let mut out = Vec::new();

        self.flush_status(&mut out);
        self.flush_added_ip_sets(&mut out);
        self.flush_ip_set_deltas(&mut out);
        self.flush_updates(&mut out);
        self.flush_removes(&mut out);
        self.flush_identities(&mut out);
        self.flush_topology(&mut out);
        self.flush_host_state(&mut out);
        if mem::take(&mut self.pending_in_sync) {
            self.in_sync_sent = true;
            out.push(DataplaneMessage::InSync);
        }

        let count = out.len();
        for msg in out {
            metrics::record_message(msg.message_type());
            sink.send(msg)?;
        }
        timer.finish(count);
        if count > 0 {
            debug!(messages = count, "flushed dataplane messages");
        }
        Ok(count)
    }

    fn flush_status(&mut self, out: &mut Vec<DataplaneMessage>) {
        if mem::take(&mut self.pending_not_ready) {
            out.push(DataplaneMessage::DatastoreNotReady);
        }
        if let Some(config) = self.pending_config.take() {
            self.config_sent = true;
            out.push(DataplaneMessage::ConfigUpdate { config });
        }
    }

    fn flush_added_ip_sets(&mut self, out: &mut Vec<DataplaneMessage>) {
        let sets = &mut self.ip_sets;
        for (id, kind) in mem::take(&mut sets.added) {
            let members = sets.added_members.remove(&id).unwrap_or_default();
            sets.sent.insert(id.clone());
            out.push(DataplaneMessage::IpSetUpdate {
                id,
                kind,
                members: members.into_iter().collect(),
            });
        }
    }

    fn flush_ip_set_deltas(&mut self, out: &mut Vec<DataplaneMessage>) {
        let mut added = mem::take(&mut self.ip_sets.added_members);
        let mut removed = mem::take(&mut self.ip_sets.removed_members);
        let ids: BTreeSet<String> = added.keys().chain(removed.keys()).cloned().collect();
        for id in ids {
            let added_members: Vec<String> =
                added.remove(&id).unwrap_or_default().into_iter().collect();
            let removed_members: Vec<String> =
                removed.remove(&id).unwrap_or_default().into_iter().collect();
            if added_members.is_empty() && removed_members.is_empty() {
                continue;
            }
            out.push(DataplaneMessage::IpSetDeltaUpdate {
                id,
                added_members,
                removed_members,
            });
        }
    }

    fn flush_updates(&mut self, out: &mut Vec<DataplaneMessage>) {
        for (id, policy) in self.policies.take_updates() {
            out.push(DataplaneMessage::ActivePolicyUpdate { id, policy });
        }
        for (id, profile) in self.profiles.take_updates() {
            out.push(DataplaneMessage::ActiveProfileUpdate { id, profile });
        }
        for (id, endpoint) in self.workload_endpoints.take_updates() {
            out.push(DataplaneMessage::WorkloadEndpointUpdate { id, endpoint });
        }
        for (id, endpoint) in self.host_endpoints.take_updates() {
            out.push(DataplaneMessage::HostEndpointUpdate { id, endpoint });
        }
        for ((id, endpoint), spec) in self.captures.take_updates() {
            out.push(DataplaneMessage::PacketCaptureUpdate { id, endpoint, spec });
        }
    }

    fn flush_removes(&mut self, out: &mut Vec<DataplaneMessage>) {
        for (id, endpoint) in self.captures.take_removes() {
            out.push(DataplaneMessage::PacketCaptureRemove { id, endpoint });
        }
        for id in self.workload_endpoints.take_removes() {
            out.push(DataplaneMessage::WorkloadEndpointRemove { id });
        }
        for id in self.host_endpoints.take_removes() {
            out.push(DataplaneMessage::HostEndpointRemove { id });
        }
        for id in self.profiles.take_removes() {
            out.push(DataplaneMessage::ActiveProfileRemove { id });
        }
        for id in self.policies.take_removes() {
            out.push(DataplaneMessage::ActivePolicyRemove { id });
        }
        for id in mem::take(&mut self.ip_sets.removed) {
            self.ip_sets.sent.remove(&id);
            out.push(DataplaneMessage::IpSetRemove { id });
        }
    }

    fn flush_identities(&mut self, out: &mut Vec<DataplaneMessage>) {
        for (namespace, name) in self.service_accounts.take_removes() {
            out.push(DataplaneMessage::ServiceAccountRemove { namespace, name });
        }
        for ((namespace, name), labels) in self.service_accounts.take_updates() {
            out.push(DataplaneMessage::ServiceAccountUpdate {
                namespace,
                name,
                labels,
            });
        }
        for name in self.namespaces.take_removes() {
            out.push(DataplaneMessage::NamespaceRemove { name });
        }
        for (name, labels) in self.namespaces.take_updates() {
            out.push(DataplaneMessage::NamespaceUpdate { name, labels });
        }
    }

    fn flush_topology(&mut self, out: &mut Vec<DataplaneMessage>) {
        // Protect addresses before anything that could expose them changes.
        let blacklist_adds: Vec<IpAddr> = self
            .blacklist
            .take_updates()
            .into_iter()
            .map(|(addr, ())| addr)
            .collect();
        if !blacklist_adds.is_empty() {
            out.push(DataplaneMessage::BlacklistAdd {
                addrs: blacklist_adds,
            });
        }

        for dst in self.routes.take_removes() {
            out.push(DataplaneMessage::RouteRemove { dst });
        }
        for (tunnel_addr, workload_addrs) in group_bindings(self.bindings.take_removes()) {
            out.push(DataplaneMessage::BindingRemove {
                tunnel_addr,
                workload_addrs,
            });
        }
        for addr in self.tunnels.take_removes() {
            out.push(DataplaneMessage::TunnelRemove { addr });
        }
        for (addr, ()) in self.tunnels.take_updates() {
            out.push(DataplaneMessage::TunnelAdd { addr });
        }
        let binding_adds = self.bindings.take_updates().into_iter().map(|(b, ())| b);
        for (tunnel_addr, workload_addrs) in group_bindings(binding_adds) {
            out.push(DataplaneMessage::BindingAdd {
                tunnel_addr,
                workload_addrs,
            });
        }
        for (_, route) in self.routes.take_updates() {
            out.push(DataplaneMessage::RouteUpdate { route });
        }

        let blacklist_removes = self.blacklist.take_removes();
        if !blacklist_removes.is_empty() {
            out.push(DataplaneMessage::BlacklistRemove {
                addrs: blacklist_removes,
            });
        }
    }

    fn flush_host_state(&mut self, out: &mut Vec<DataplaneMessage>) {
        for hostname in self.host_metadata.take_removes() {
            out.push(DataplaneMessage::HostMetadataRemove { hostname });
        }
        for (hostname, addr) in self.host_metadata.take_updates() {
            out.push(DataplaneMessage::HostMetadataUpdate { hostname, addr });
        }
        for id in self.ipam_pools.take_removes() {
            out.push(DataplaneMessage::IpamPoolRemove { id });
        }
        for (id, pool) in self.ipam_pools.take_updates() {
            out.push(DataplaneMessage::IpamPoolUpdate { id, pool });
        }
    }
}

fn group_bindings(bindings: impl IntoIterator<Item = Binding>) -> BTreeMap<IpAddr, Vec<IpAddr>> {
    let mut grouped: BTreeMap<IpAddr, Vec<IpAddr>> = BTreeMap::new();
    for binding in bindings {
        grouped
            .entry(binding.tunnel_addr)
            .or_default()
            .push(binding.workload_addr);
    }
    grouped
}

// =============================================================================
// Calculator outputs
// =============================================================================

impl MemberCallbacks for EventSequencer {
    fn on_member_added(&mut self, set_id: &str, member: IpSetMember) -> Result<()> {
        self.ip_sets.add_member(set_id, member.to_string())
    }

    fn on_member_removed(&mut self, set_id: &str, member: IpSetMember) -> Result<()> {
        self.ip_sets.remove_member(set_id, member.to_string())
    }
}

impl PolicyResolverCallbacks for EventSequencer {
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Endpoint>,
        egress: Option<&EgressData>,
        tiers: &[FilteredTier],
    ) -> Result<()> {
        match (key, endpoint) {
            (EndpointKey::Workload(key), Some(Endpoint::Workload(ep))) => {
                let egress_ip_set_id = egress.and_then(|e| e.ip_set_id.clone());
                let msg = WorkloadEndpointMessage::new(
                    ep,
                    SplitTiers::from_filtered(tiers),
                    egress_ip_set_id,
                );
                self.workload_endpoints.update(key.clone(), msg);
                Ok(())
            }
            (EndpointKey::Host(key), Some(Endpoint::Host(ep))) => {
                let msg = HostEndpointMessage::new(ep, SplitTiers::from_filtered(tiers));
                self.host_endpoints.update(key.clone(), msg);
                Ok(())
            }
            (EndpointKey::Workload(key), None) => self.workload_endpoints.remove(key),
            (EndpointKey::Host(key), None) => self.host_endpoints.remove(key),
            (key, Some(_)) => Err(Error::internal_with_context(
                "policy resolver",
                format!("endpoint value does not match key kind for {key}"),
            )),
        }
    }
}

impl RouteCallbacks for EventSequencer {
    fn on_route_update(&mut self, route: RouteUpdate) -> Result<()> {
        self.routes.update(route.dst, route);
        Ok(())
    }

    fn on_route_remove(&mut self, dst: IpNet) -> Result<()> {
        self.routes.remove(&dst)
    }
}

impl BindingCallbacks for EventSequencer {
    fn on_tunnel_added(&mut self, addr: IpAddr) -> Result<()> {
        self.tunnels.add(addr, ())
    }

    fn on_tunnel_removed(&mut self, addr: IpAddr) -> Result<()> {
        self.tunnels.remove(&addr)
    }

    fn on_binding_added(&mut self, binding: Binding) -> Result<()> {
        self.bindings.add(binding, ())
    }

    fn on_binding_removed(&mut self, binding: Binding) -> Result<()> {
        self.bindings.remove(&binding)
    }

    fn on_blacklist_added(&mut self, addr: IpAddr) -> Result<()> {
        self.blacklist.add(addr, ())
    }

    fn on_blacklist_removed(&mut self, addr: IpAddr) -> Result<()> {
        self.blacklist.remove(&addr)
    }
}

impl ConfigBatcherCallbacks for EventSequencer {
    fn on_config_update(
        &mut self,
        global: &BTreeMap<String, String>,
        host: &BTreeMap<String, String>,
    ) -> Result<()> {
        let global_changed = self
            .config
            .update_from(global, ConfigSource::DatastoreGlobal)?;
        let host_changed = self
            .config
            .update_from(host, ConfigSource::DatastorePerHost)?;
        if global_changed || host_changed || !self.config_sent {
            if self.config_sent {
                info!("effective configuration changed");
            }
            self.pending_config = Some(self.config.raw_values());
        }
        Ok(())
    }
}
