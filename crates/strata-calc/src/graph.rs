//! Calculation graph
//!
//! Dispatches each datastore update to the calculators that care about it
//! and routes their outputs to each other and to the [`EventSequencer`].
//! Match events reported by the label index are queued and drained in
//! arrival order before the update that caused them returns.
//!
//! The graph is single-threaded; see [`crate::async_graph`] for running it
//! on its own task.

use std::mem;
use std::sync::Arc;

use strata_common::config::{Config, IpsecMode, Params};
use strata_common::metrics;
use strata_common::model::{
    Endpoint, EndpointKey, HostEndpoint, HostEndpointKey, HostIpKey, IpPool, IpPoolKey,
    NetworkSet, NetworkSetKey, PacketCapture, PacketCaptureKey, Policy, PolicyKey, Profile,
    ProfileKey, ProfileOrigin, Rule, Update, WorkloadEndpoint, WorkloadEndpointKey,
};
use strata_common::selector::{Selector, SelectorParser};
use strata_common::{Error, Result};
use tracing::{debug, error, info, warn};

use crate::active_rules::{ActiveRulesCalculator, ActiveRulesCallbacks};
use crate::bindings::BindingResolver;
use crate::capture::{CaptureCallbacks, PacketCaptureCalculator};
use crate::config_batcher::ConfigBatcher;
use crate::egress::{ActiveEgressCalculator, EgressCallbacks, EgressData};
use crate::ipsets::{IpSetCallbacks, IpSetData, IpSetMemberCalculator};
use crate::l7::L7ServiceCalculator;
use crate::labels::{LabelIndex, LabelledItem, MatchEvent, MatchTarget};
use crate::lookups::{EndpointLookupsCache, NflogLookupsCache};
use crate::policy::PolicyResolver;
use crate::routes::RouteCalculator;
use crate::rule_scanner::{ParsedRules, RuleScanner, RuleScannerCallbacks};
use crate::sequencer::{ConfigInterface, DataplaneSink, EventSequencer};

/// Static settings of one graph instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphConfig {
    /// Name of the node the graph computes state for
    pub hostname: String,
    /// Parameters fixed for the graph's lifetime
    pub params: Params,
}

/// One input to the graph
#[derive(Debug, Clone, PartialEq)]
pub enum GraphInput {
    /// A datastore change
    Update(Update),
    /// A match event delivered from outside the graph
    Match(MatchEvent),
    /// The datastore snapshot is complete
    InSync,
    /// The datastore is not ready
    NotReady,
}

// =============================================================================
// Wiring
// =============================================================================

/// Fans IP set activations out to the sequencer, member calculator and index
struct IpSetWiring<'a> {
    index: &'a mut dyn LabelIndex,
    events: &'a mut Vec<MatchEvent>,
    members: &'a mut IpSetMemberCalculator,
    sequencer: &'a mut EventSequencer,
}

impl IpSetCallbacks for IpSetWiring<'_> {
    fn on_ip_set_active(&mut self, data: &IpSetData) -> Result<()> {
        self.sequencer.on_ip_set_added(&data.id, data.kind)?;
        if let Some(selector) = &data.selector {
            self.members.on_ip_set_active(&data.id);
            self.index
                .update_selector(MatchTarget::IpSet(data.id.clone()), selector, self.events);
        }
        Ok(())
    }

    fn on_ip_set_inactive(&mut self, data: &IpSetData) -> Result<()> {
        if data.selector.is_some() {
            self.index
                .delete_selector(&MatchTarget::IpSet(data.id.clone()), self.events);
            self.members.on_ip_set_inactive(&data.id);
        }
        self.sequencer.on_ip_set_removed(&data.id)
    }
}

impl RuleScannerCallbacks for IpSetWiring<'_> {
    fn on_policy_active(&mut self, key: &PolicyKey, rules: ParsedRules) -> Result<()> {
        self.sequencer.on_policy_active(key, rules);
        Ok(())
    }

    fn on_policy_inactive(&mut self, key: &PolicyKey) -> Result<()> {
        self.sequencer.on_policy_inactive(key)
    }

    fn on_profile_active(&mut self, key: &ProfileKey, rules: ParsedRules) -> Result<()> {
        self.sequencer.on_profile_active(key, rules);
        Ok(())
    }

    fn on_profile_inactive(&mut self, key: &ProfileKey) -> Result<()> {
        self.sequencer.on_profile_inactive(key)
    }
}

/// Active rules output: selectors to the index, rules to the scanner
struct RulesWiring<'a> {
    scanner: &'a mut RuleScanner,
    sets: IpSetWiring<'a>,
}

impl ActiveRulesCallbacks for RulesWiring<'_> {
    fn on_policy_selector(&mut self, key: &PolicyKey, selector: Option<&Selector>) -> Result<()> {
        let target = MatchTarget::Policy(key.clone());
        match selector {
            Some(selector) => self.sets.index.update_selector(target, selector, self.sets.events),
            None => self.sets.index.delete_selector(&target, self.sets.events),
        }
        Ok(())
    }

    fn on_policy_active(&mut self, key: &PolicyKey, policy: &Policy) -> Result<()> {
        self.scanner.on_policy_active(key, policy, &mut self.sets)
    }

    fn on_policy_inactive(&mut self, key: &PolicyKey) -> Result<()> {
        self.scanner.on_policy_inactive(key, &mut self.sets)
    }

    fn on_profile_active(&mut self, key: &ProfileKey, inbound: &[Rule], outbound: &[Rule]) -> Result<()> {
        self.scanner
            .on_profile_active(key, inbound, outbound, &mut self.sets)
    }

    fn on_profile_inactive(&mut self, key: &ProfileKey) -> Result<()> {
        self.scanner.on_profile_inactive(key, &mut self.sets)
    }
}

/// Egress output: IP sets as usual, endpoint data to the resolver
struct EgressWiring<'a> {
    sets: IpSetWiring<'a>,
    resolver: &'a mut PolicyResolver,
}

impl IpSetCallbacks for EgressWiring<'_> {
    fn on_ip_set_active(&mut self, data: &IpSetData) -> Result<()> {
        self.sets.on_ip_set_active(data)
    }

    fn on_ip_set_inactive(&mut self, data: &IpSetData) -> Result<()> {
        self.sets.on_ip_set_inactive(data)
    }
}

impl EgressCallbacks for EgressWiring<'_> {
    fn on_endpoint_egress_data(&mut self, key: &WorkloadEndpointKey, data: EgressData) -> Result<()> {
        self.resolver.on_egress_update(key, data);
        Ok(())
    }
}

/// Capture output: selectors to the index, matches to the sequencer
struct CaptureWiring<'a> {
    index: &'a mut dyn LabelIndex,
    events: &'a mut Vec<MatchEvent>,
    sequencer: &'a mut EventSequencer,
}

impl CaptureCallbacks for CaptureWiring<'_> {
    fn on_capture_selector(&mut self, key: &PacketCaptureKey, selector: Option<&Selector>) -> Result<()> {
        let target = MatchTarget::PacketCapture(key.clone());
        match selector {
            Some(selector) => self.index.update_selector(target, selector, self.events),
            None => self.index.delete_selector(&target, self.events),
        }
        Ok(())
    }

    fn on_capture_active(
        &mut self,
        key: &PacketCaptureKey,
        endpoint: &WorkloadEndpointKey,
        spec: &PacketCapture,
    ) -> Result<()> {
        self.sequencer.on_capture_active(key, endpoint, spec);
        Ok(())
    }

    fn on_capture_inactive(&mut self, key: &PacketCaptureKey, endpoint: &WorkloadEndpointKey) -> Result<()> {
        self.sequencer.on_capture_inactive(key, endpoint)
    }
}

// Field-level borrows so several calculators can be driven at once.
macro_rules! ip_sets {
    ($graph:expr) => {
        IpSetWiring {
            index: &mut *$graph.index,
            events: &mut $graph.events,
            members: &mut $graph.members,
            sequencer: &mut $graph.sequencer,
        }
    };
}

macro_rules! rules {
    ($graph:expr) => {
        RulesWiring {
            scanner: &mut $graph.rule_scanner,
            sets: ip_sets!($graph),
        }
    };
}

macro_rules! egress {
    ($graph:expr) => {
        EgressWiring {
            sets: ip_sets!($graph),
            resolver: &mut $graph.resolver,
        }
    };
}

macro_rules! captures {
    ($graph:expr) => {
        CaptureWiring {
            index: &mut *$graph.index,
            events: &mut $graph.events,
            sequencer: &mut $graph.sequencer,
        }
    };
}

// =============================================================================
// Graph
// =============================================================================

/// The per-node calculation graph
pub struct CalcGraph {
    hostname: String,
    index: Box<dyn LabelIndex>,
    events: Vec<MatchEvent>,

    active_rules: ActiveRulesCalculator,
    rule_scanner: RuleScanner,
    members: IpSetMemberCalculator,
    resolver: PolicyResolver,
    egress: ActiveEgressCalculator,
    routes: RouteCalculator,
    bindings: Option<BindingResolver>,
    captures: PacketCaptureCalculator,
    l7: Option<L7ServiceCalculator>,
    config_batcher: ConfigBatcher,
    sequencer: EventSequencer,

    endpoint_lookups: EndpointLookupsCache,
    nflog_lookups: NflogLookupsCache,
}

impl CalcGraph {
    /// Build a graph around `index`, merging datastore config into `config`
    pub fn new(
        graph_config: GraphConfig,
        index: Box<dyn LabelIndex>,
        parser: Arc<dyn SelectorParser>,
        config: Box<dyn ConfigInterface>,
    ) -> Result<Self> {
        let GraphConfig { hostname, params } = graph_config;
        let bindings = (params.ipsec_mode == IpsecMode::Psk).then(BindingResolver::new);
        let mut graph = Self {
            index,
            events: Vec::new(),
            active_rules: ActiveRulesCalculator::new(parser.clone()),
            rule_scanner: RuleScanner::new(parser.clone()),
            members: IpSetMemberCalculator::new(),
            resolver: PolicyResolver::new(),
            egress: ActiveEgressCalculator::new(params.egress_ip_support, parser.clone()),
            routes: RouteCalculator::new(hostname.clone()),
            bindings,
            captures: PacketCaptureCalculator::new(parser),
            l7: L7ServiceCalculator::new(params.tproxy_mode),
            config_batcher: ConfigBatcher::new(hostname.clone()),
            sequencer: EventSequencer::new(config),
            endpoint_lookups: EndpointLookupsCache::new(),
            nflog_lookups: NflogLookupsCache::new(),
            hostname,
        };
        if let Some(l7) = &graph.l7 {
            l7.start(&mut ip_sets!(graph))?;
        }
        info!(
            hostname = %graph.hostname,
            tproxy = %params.tproxy_mode,
            egress = %params.egress_ip_support,
            ipsec = %params.ipsec_mode,
            "calculation graph built"
        );
        Ok(graph)
    }

    /// Build a graph with a plain [`Config`]
    pub fn with_config(
        graph_config: GraphConfig,
        index: Box<dyn LabelIndex>,
        parser: Arc<dyn SelectorParser>,
        config: Config,
    ) -> Result<Self> {
        Self::new(graph_config, index, parser, Box::new(config))
    }

    /// Name of the node this graph serves
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Shared handle to the address lookup cache
    pub fn endpoint_lookups(&self) -> EndpointLookupsCache {
        self.endpoint_lookups.clone()
    }

    /// Shared handle to the NFLOG prefix cache
    pub fn nflog_lookups(&self) -> NflogLookupsCache {
        self.nflog_lookups.clone()
    }

    /// Apply one input
    pub fn apply(&mut self, input: GraphInput) -> Result<()> {
        match input {
            GraphInput::Update(update) => self.on_update(update),
            GraphInput::Match(event) => self.on_match(event),
            GraphInput::InSync => {
                self.on_datastore_in_sync();
                Ok(())
            }
            GraphInput::NotReady => {
                self.on_datastore_not_ready();
                Ok(())
            }
        }
    }

    /// Apply one datastore update and everything it triggers
    pub fn on_update(&mut self, update: Update) -> Result<()> {
        let kind = update.kind();
        metrics::record_update(kind);
        debug!(kind, delete = update.is_delete(), "applying update");
        let result = self.dispatch(update).and_then(|()| self.drain_events());
        result.map_err(report)
    }

    /// Apply a match event reported outside an update
    pub fn on_match(&mut self, event: MatchEvent) -> Result<()> {
        let result = self
            .handle_match(event)
            .and_then(|()| self.drain_events());
        result.map_err(report)
    }

    /// The datastore snapshot is complete
    pub fn on_datastore_in_sync(&mut self) {
        info!("datastore in sync");
        self.config_batcher.on_datastore_in_sync();
        self.resolver.on_datastore_in_sync();
        self.sequencer.on_datastore_in_sync();
    }

    /// The datastore is not ready
    pub fn on_datastore_not_ready(&mut self) {
        warn!("datastore not ready");
        self.sequencer.on_datastore_not_ready();
    }

    /// Flush batched state through the sequencer into `sink`
    pub fn flush<S: DataplaneSink + ?Sized>(&mut self, sink: &mut S) -> Result<usize> {
        let result = self
            .drain_events()
            .and_then(|()| self.config_batcher.flush(&mut self.sequencer))
            .and_then(|()| self.resolver.flush(&mut self.sequencer))
            .and_then(|()| self.sequencer.flush(sink));
        result.map_err(report)
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    fn dispatch(&mut self, update: Update) -> Result<()> {
        match update {
            Update::WorkloadEndpoint { key, value } => self.on_workload_endpoint(key, value),
            Update::HostEndpoint { key, value } => self.on_host_endpoint(key, value),
            Update::Tier { key, value } => {
                self.resolver.on_tier_update(&key, value.as_ref());
                Ok(())
            }
            Update::Policy { key, value } => self.on_policy(key, value),
            Update::Profile { key, value } => self.on_profile(key, value),
            Update::HostIp { key, value } => self.on_host_ip(key, value),
            Update::IpPool { key, value } => self.on_ip_pool(key, value),
            Update::NetworkSet { key, value } => self.on_network_set(key, value),
            Update::KubeService { key, value } => match &mut self.l7 {
                Some(l7) => l7.on_service_update(&key, value.as_ref(), &mut self.sequencer),
                None => Ok(()),
            },
            Update::PacketCapture { key, value } => {
                self.captures
                    .on_capture_update(&key, value.as_ref(), &mut captures!(self))
            }
            Update::Config { key, value } => {
                self.config_batcher.on_config_update(&key, value.as_deref());
                Ok(())
            }
        }
    }

    fn on_workload_endpoint(
        &mut self,
        key: WorkloadEndpointKey,
        value: Option<WorkloadEndpoint>,
    ) -> Result<()> {
        let ep_key = EndpointKey::Workload(key.clone());
        let endpoint = value.clone().map(Endpoint::Workload);
        self.update_labelled_endpoint(&ep_key, endpoint.as_ref())?;

        self.routes
            .on_endpoint_update(&key, value.as_ref(), &mut self.sequencer)?;
        if let Some(bindings) = &mut self.bindings {
            bindings.on_endpoint_update(&key, value.as_ref(), &mut self.sequencer)?;
        }

        if key.hostname == self.hostname {
            self.update_local_endpoint(&ep_key, endpoint.as_ref())?;
            self.egress
                .on_endpoint_update(&key, value.as_ref(), &mut egress!(self))?;
        }
        Ok(())
    }

    fn on_host_endpoint(&mut self, key: HostEndpointKey, value: Option<HostEndpoint>) -> Result<()> {
        let ep_key = EndpointKey::Host(key.clone());
        let endpoint = value.map(Endpoint::Host);
        self.update_labelled_endpoint(&ep_key, endpoint.as_ref())?;
        if key.hostname == self.hostname {
            self.update_local_endpoint(&ep_key, endpoint.as_ref())?;
        }
        Ok(())
    }

    /// Index, IP set membership and lookups; applies to every endpoint
    fn update_labelled_endpoint(&mut self, key: &EndpointKey, endpoint: Option<&Endpoint>) -> Result<()> {
        let item = LabelledItem::Endpoint(key.clone());
        match endpoint {
            Some(ep) => {
                self.index
                    .update_labels(item.clone(), ep.labels(), ep.profile_ids(), &mut self.events);
                self.members
                    .update_item_nets(&item, ep.nets(), &mut self.sequencer)?;
            }
            None => {
                self.index.delete_labels(&item, &mut self.events);
                self.members.delete_item(&item, &mut self.sequencer)?;
            }
        }
        self.endpoint_lookups.on_endpoint_update(key, endpoint);
        Ok(())
    }

    /// Profile activation and policy resolution; local endpoints only
    fn update_local_endpoint(&mut self, key: &EndpointKey, endpoint: Option<&Endpoint>) -> Result<()> {
        self.active_rules
            .on_endpoint_update(key, endpoint.map(Endpoint::profile_ids), &mut rules!(self))?;
        self.resolver.on_endpoint_update(key, endpoint);
        Ok(())
    }

    fn on_policy(&mut self, key: PolicyKey, value: Option<Policy>) -> Result<()> {
        self.nflog_lookups.on_policy_update(&key, value.as_ref())?;
        self.resolver.on_policy_update(&key, value.as_ref());
        self.active_rules
            .on_policy_update(&key, value, &mut rules!(self))
    }

    fn on_profile(&mut self, key: ProfileKey, value: Option<Profile>) -> Result<()> {
        self.nflog_lookups.on_profile_update(&key, value.as_ref());
        match &value {
            Some(profile) => {
                self.index
                    .update_parent_labels(&key.name, &profile.labels, &mut self.events)
            }
            None => self.index.delete_parent_labels(&key.name, &mut self.events),
        }

        let labels = value.as_ref().map(|p| &p.labels);
        match key.origin() {
            Ok(ProfileOrigin::Plain) => {}
            Ok(ProfileOrigin::Namespace(ns)) => self.sequencer.on_namespace_update(ns, labels)?,
            Ok(ProfileOrigin::ServiceAccount { namespace, name }) => {
                self.sequencer
                    .on_service_account_update(namespace, name, labels)?
            }
            Err(err) => warn!(profile = %key.name, error = %err, "skipping identity update"),
        }

        self.egress
            .on_profile_update(&key, value.as_ref(), &mut egress!(self))?;
        self.active_rules
            .on_profile_update(&key, value, &mut rules!(self))
    }

    fn on_host_ip(&mut self, key: HostIpKey, value: Option<std::net::IpAddr>) -> Result<()> {
        let node = key.hostname.as_str();
        self.routes
            .on_host_ip_update(node, value, &mut self.sequencer)?;
        if let Some(bindings) = &mut self.bindings {
            bindings.on_host_ip_update(node, value, &mut self.sequencer)?;
        }
        self.endpoint_lookups.on_host_ip_update(node, value);
        self.sequencer.on_host_metadata_update(node, value)
    }

    fn on_ip_pool(&mut self, key: IpPoolKey, value: Option<IpPool>) -> Result<()> {
        self.routes
            .on_pool_update(&key, value.as_ref(), &mut self.sequencer)?;
        self.sequencer
            .on_ipam_pool_update(&key.pool_id(), value.as_ref())
    }

    fn on_network_set(&mut self, key: NetworkSetKey, value: Option<NetworkSet>) -> Result<()> {
        let item = LabelledItem::NetworkSet(key.clone());
        match &value {
            Some(set) => {
                self.index
                    .update_labels(item.clone(), &set.labels, &[], &mut self.events);
                self.members
                    .update_item_nets(&item, set.nets.clone(), &mut self.sequencer)?;
            }
            None => {
                self.index.delete_labels(&item, &mut self.events);
                self.members.delete_item(&item, &mut self.sequencer)?;
            }
        }
        self.endpoint_lookups
            .on_network_set_update(&key, value.as_ref());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Match events
    // -------------------------------------------------------------------------

    fn drain_events(&mut self) -> Result<()> {
        while !self.events.is_empty() {
            for event in mem::take(&mut self.events) {
                self.handle_match(event)?;
            }
        }
        Ok(())
    }

    fn handle_match(&mut self, event: MatchEvent) -> Result<()> {
        let (started, target, item) = match event {
            MatchEvent::Started { target, item } => (true, target, item),
            MatchEvent::Stopped { target, item } => (false, target, item),
        };
        match target {
            MatchTarget::IpSet(id) => {
                if started {
                    self.members
                        .on_match_started(&id, &item, &mut self.sequencer)
                } else {
                    self.members
                        .on_match_stopped(&id, &item, &mut self.sequencer)
                }
            }
            MatchTarget::Policy(key) => {
                let LabelledItem::Endpoint(endpoint) = item else {
                    return Ok(());
                };
                if endpoint.hostname() != self.hostname {
                    return Ok(());
                }
                if started {
                    self.resolver.on_policy_match_started(&key, &endpoint);
                    self.active_rules
                        .on_policy_match_started(&key, &mut rules!(self))
                } else {
                    self.resolver.on_policy_match_stopped(&key, &endpoint);
                    self.active_rules
                        .on_policy_match_stopped(&key, &mut rules!(self))
                }
            }
            MatchTarget::PacketCapture(key) => {
                let LabelledItem::Endpoint(EndpointKey::Workload(endpoint)) = item else {
                    return Ok(());
                };
                if endpoint.hostname != self.hostname {
                    return Ok(());
                }
                if started {
                    self.captures
                        .on_match_started(&key, &endpoint, &mut captures!(self))
                } else {
                    self.captures
                        .on_match_stopped(&key, &endpoint, &mut captures!(self))
                }
            }
        }
    }
}

fn report(err: Error) -> Error {
    if err.is_invariant_violation() {
        metrics::record_violation(err.kind());
        error!(error = %err, "calculation graph invariant violated");
    }
    err
}
