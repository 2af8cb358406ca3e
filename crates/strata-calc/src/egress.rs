//! Active egress gateway calculator
//!
//! Local workload endpoints choose an egress gateway through a selector,
//! either their own or one inherited from a profile. Each distinct selector
//! in use gets one `e:` IP set holding the gateways' addresses.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_common::config::EgressIpSupport;
use strata_common::model::{Profile, ProfileKey, WorkloadEndpoint, WorkloadEndpointKey};
use strata_common::selector::SelectorParser;
use strata_common::{Result, EGRESS_IP_SET_PREFIX};
use tracing::debug;

use crate::ipsets::{IpSetCallbacks, IpSetData, IpSetKind};
use crate::refcount::{ActivationCallbacks, RefCountRegistry};

/// Egress gateway annotation for one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EgressData {
    /// IP set of the gateways the endpoint uses, if any
    pub ip_set_id: Option<String>,
}

/// Receives egress calculator output
pub trait EgressCallbacks: IpSetCallbacks {
    /// The endpoint's egress annotation changed
    fn on_endpoint_egress_data(&mut self, key: &WorkloadEndpointKey, data: EgressData) -> Result<()>;
}

struct EgressSets<'a, C: ?Sized>(&'a mut C);

impl<C: IpSetCallbacks + ?Sized> ActivationCallbacks<String, IpSetData> for EgressSets<'_, C> {
    fn on_activated(&mut self, _key: &String, value: &IpSetData) -> Result<()> {
        self.0.on_ip_set_active(value)
    }

    fn on_deactivated(&mut self, _key: &String, value: IpSetData) -> Result<()> {
        self.0.on_ip_set_inactive(&value)
    }
}

#[derive(Debug, Default)]
struct EndpointEgress {
    own_selector: Option<String>,
    profile_ids: Vec<String>,
    active: Option<String>,
}

/// Tracks egress selectors of local workload endpoints
pub struct ActiveEgressCalculator {
    support: EgressIpSupport,
    parser: Arc<dyn SelectorParser>,
    profile_selectors: HashMap<ProfileKey, String>,
    endpoints: HashMap<WorkloadEndpointKey, EndpointEgress>,
    selectors: RefCountRegistry<String, IpSetData>,
}

impl ActiveEgressCalculator {
    /// Create a calculator for the configured support level
    pub fn new(support: EgressIpSupport, parser: Arc<dyn SelectorParser>) -> Self {
        Self {
            support,
            parser,
            profile_selectors: HashMap::new(),
            endpoints: HashMap::new(),
            selectors: RefCountRegistry::new("egress-selectors"),
        }
    }

    /// Whether the calculator does anything at all
    pub fn enabled(&self) -> bool {
        self.support != EgressIpSupport::Disabled
    }

    /// Track a local workload endpoint
    pub fn on_endpoint_update<C: EgressCallbacks + ?Sized>(
        &mut self,
        key: &WorkloadEndpointKey,
        endpoint: Option<&WorkloadEndpoint>,
        cb: &mut C,
    ) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        match endpoint {
            Some(ep) => {
                let entry = self.endpoints.entry(key.clone()).or_default();
                entry.own_selector = ep.egress_selector.clone().filter(|s| !s.trim().is_empty());
                entry.profile_ids = ep.profile_ids.clone();
                self.recompute(key, cb)
            }
            None => {
                let Some(old) = self.endpoints.remove(key) else {
                    return Ok(());
                };
                if let Some(selector) = old.active {
                    cb.on_endpoint_egress_data(key, EgressData::default())?;
                    self.selectors.dec_ref(&selector, &mut EgressSets(cb))?;
                }
                Ok(())
            }
        }
    }

    /// Track a profile's egress selector
    ///
    /// Endpoints are rescanned only when the selector text changed.
    pub fn on_profile_update<C: EgressCallbacks + ?Sized>(
        &mut self,
        key: &ProfileKey,
        profile: Option<&Profile>,
        cb: &mut C,
    ) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let new = profile
            .and_then(|p| p.egress_selector.clone())
            .filter(|s| !s.trim().is_empty());
        if self.profile_selectors.get(key) == new.as_ref() {
            return Ok(());
        }
        match new {
            Some(selector) => self.profile_selectors.insert(key.clone(), selector),
            None => self.profile_selectors.remove(key),
        };

        let affected: Vec<WorkloadEndpointKey> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.profile_ids.iter().any(|id| *id == key.name))
            .map(|(k, _)| k.clone())
            .collect();
        debug!(profile = %key.name, endpoints = affected.len(), "profile egress selector changed");
        for ep in affected {
            self.recompute(&ep, cb)?;
        }
        Ok(())
    }

    /// Number of egress IP sets in use
    pub fn active_ip_sets(&self) -> usize {
        self.selectors.len()
    }

    /// The endpoint's own selector wins, then the first profile supplying one
    fn effective_selector(&self, ep: &EndpointEgress) -> Option<String> {
        let own = match self.support {
            EgressIpSupport::EnabledPerNamespaceOrPerPod => ep.own_selector.clone(),
            _ => None,
        };
        own.or_else(|| {
            ep.profile_ids
                .iter()
                .find_map(|id| self.profile_selectors.get(&ProfileKey::new(id.as_str())))
                .cloned()
        })
    }

    fn recompute<C: EgressCallbacks + ?Sized>(
        &mut self,
        key: &WorkloadEndpointKey,
        cb: &mut C,
    ) -> Result<()> {
        let Some(ep) = self.endpoints.get(key) else {
            return Ok(());
        };
        let new = match self.effective_selector(ep) {
            Some(raw) => Some(self.parser.parse(&raw)?),
            None => None,
        };
        let new_expr = new.as_ref().map(|s| s.expression().to_string());
        let old_expr = ep.active.clone();
        if new_expr == old_expr {
            return Ok(());
        }

        let ip_set_id = match &new {
            Some(selector) => {
                let data = IpSetData {
                    id: selector.id_with_prefix(EGRESS_IP_SET_PREFIX),
                    kind: IpSetKind::Net,
                    selector: Some(selector.clone()),
                };
                let id = data.id.clone();
                self.selectors.inc_ref(
                    &selector.expression().to_string(),
                    |_| Ok(data),
                    &mut EgressSets(&mut *cb),
                )?;
                Some(id)
            }
            None => None,
        };
        if let Some(ep) = self.endpoints.get_mut(key) {
            ep.active = new_expr;
        }
        cb.on_endpoint_egress_data(key, EgressData { ip_set_id })?;
        if let Some(old) = old_expr {
            self.selectors.dec_ref(&old, &mut EgressSets(cb))?;
        }
        Ok(())
    }
}
