//! Active rules calculator
//!
//! Decides which policies and profiles the local dataplane needs. A profile
//! is active while at least one local endpoint lists it; a policy is active
//! while its selector matches at least one local endpoint. Everything else
//! is stored but not announced.

use std::collections::HashMap;
use std::sync::Arc;

use strata_common::model::{EndpointKey, Policy, PolicyKey, Profile, ProfileKey, Rule, RuleAction};
use strata_common::selector::{Selector, SelectorParser};
use strata_common::Result;
use tracing::{debug, warn};

use crate::refcount::RefCountRegistry;

/// Receives activation decisions
pub trait ActiveRulesCallbacks {
    /// Register (Some) or withdraw (None) a policy's endpoint selector
    fn on_policy_selector(&mut self, key: &PolicyKey, selector: Option<&Selector>) -> Result<()>;

    /// A policy became active, or an active policy changed
    fn on_policy_active(&mut self, key: &PolicyKey, policy: &Policy) -> Result<()>;

    /// A policy stopped being active
    fn on_policy_inactive(&mut self, key: &PolicyKey) -> Result<()>;

    /// A profile became active, or an active profile's rules changed
    fn on_profile_active(&mut self, key: &ProfileKey, inbound: &[Rule], outbound: &[Rule]) -> Result<()>;

    /// A profile stopped being active
    fn on_profile_inactive(&mut self, key: &ProfileKey) -> Result<()>;
}

/// Rules announced for a profile that is referenced but not defined
fn missing_profile_rules() -> Vec<Rule> {
    vec![Rule {
        action: RuleAction::Deny,
        ..Default::default()
    }]
}

/// Tracks which policies and profiles are active
pub struct ActiveRulesCalculator {
    parser: Arc<dyn SelectorParser>,
    policies: HashMap<PolicyKey, Policy>,
    profiles: HashMap<ProfileKey, Profile>,
    endpoint_profiles: HashMap<EndpointKey, Vec<ProfileKey>>,
    profile_refs: RefCountRegistry<ProfileKey, ()>,
    policy_matches: RefCountRegistry<PolicyKey, ()>,
}

impl ActiveRulesCalculator {
    /// Create an empty calculator
    pub fn new(parser: Arc<dyn SelectorParser>) -> Self {
        Self {
            parser,
            policies: HashMap::new(),
            profiles: HashMap::new(),
            endpoint_profiles: HashMap::new(),
            profile_refs: RefCountRegistry::new("active-profiles"),
            policy_matches: RefCountRegistry::new("active-policies"),
        }
    }

    /// Store a policy and re-register its selector if it changed
    pub fn on_policy_update<C: ActiveRulesCallbacks + ?Sized>(
        &mut self,
        key: &PolicyKey,
        policy: Option<Policy>,
        cb: &mut C,
    ) -> Result<()> {
        match policy {
            Some(policy) => {
                let old = self.policies.get(key);
                if old == Some(&policy) {
                    debug!(policy = %key, "policy unchanged");
                    return Ok(());
                }
                let selector_changed = old.map_or(true, |p| p.selector != policy.selector);
                if selector_changed {
                    let selector = self.parser.parse(&policy.selector)?;
                    cb.on_policy_selector(key, Some(&selector))?;
                }
                if self.policy_matches.contains(key) {
                    cb.on_policy_active(key, &policy)?;
                }
                self.policies.insert(key.clone(), policy);
            }
            None => {
                if self.policies.remove(key).is_some() {
                    // Stop events from the index deactivate the policy.
                    cb.on_policy_selector(key, None)?;
                }
            }
        }
        Ok(())
    }

    /// Store a profile, refreshing it if active and its rules changed
    pub fn on_profile_update<C: ActiveRulesCallbacks + ?Sized>(
        &mut self,
        key: &ProfileKey,
        profile: Option<Profile>,
        cb: &mut C,
    ) -> Result<()> {
        let old_rules = self
            .profiles
            .get(key)
            .map(|p| (p.inbound_rules.clone(), p.outbound_rules.clone()));
        match profile {
            Some(profile) => {
                let rules_changed = old_rules.as_ref().map_or(true, |(i, o)| {
                    *i != profile.inbound_rules || *o != profile.outbound_rules
                });
                if rules_changed && self.profile_refs.contains(key) {
                    cb.on_profile_active(key, &profile.inbound_rules, &profile.outbound_rules)?;
                }
                self.profiles.insert(key.clone(), profile);
            }
            None => {
                if self.profiles.remove(key).is_some() && self.profile_refs.contains(key) {
                    let deny = missing_profile_rules();
                    cb.on_profile_active(key, &deny, &deny)?;
                }
            }
        }
        Ok(())
    }

    /// Track the profiles of a local endpoint
    pub fn on_endpoint_update<C: ActiveRulesCallbacks + ?Sized>(
        &mut self,
        key: &EndpointKey,
        profile_ids: Option<&[String]>,
        cb: &mut C,
    ) -> Result<()> {
        let mut new: Vec<ProfileKey> = Vec::new();
        for id in profile_ids.unwrap_or_default() {
            let profile = ProfileKey::new(id);
            if !new.contains(&profile) {
                new.push(profile);
            }
        }
        let old = self.endpoint_profiles.remove(key).unwrap_or_default();

        // Take new references before dropping old ones so a profile kept
        // across the update never flaps.
        for profile in new.iter().filter(|p| !old.contains(p)) {
            if self.profile_refs.inc_ref(profile, |_| Ok(()), &mut ())? {
                match self.profiles.get(profile) {
                    Some(p) => cb.on_profile_active(profile, &p.inbound_rules, &p.outbound_rules)?,
                    None => {
                        warn!(profile = %profile.name, endpoint = %key, "endpoint references undefined profile");
                        let deny = missing_profile_rules();
                        cb.on_profile_active(profile, &deny, &deny)?;
                    }
                }
            }
        }
        for profile in old.iter().filter(|p| !new.contains(p)) {
            if self.profile_refs.dec_ref(profile, &mut ())? {
                cb.on_profile_inactive(profile)?;
            }
        }

        if profile_ids.is_some() {
            self.endpoint_profiles.insert(key.clone(), new);
        }
        Ok(())
    }

    /// A local endpoint started matching a policy's selector
    pub fn on_policy_match_started<C: ActiveRulesCallbacks + ?Sized>(
        &mut self,
        key: &PolicyKey,
        cb: &mut C,
    ) -> Result<()> {
        if self.policy_matches.inc_ref(key, |_| Ok(()), &mut ())? {
            match self.policies.get(key) {
                Some(policy) => cb.on_policy_active(key, policy)?,
                None => warn!(policy = %key, "match for unknown policy"),
            }
        }
        Ok(())
    }

    /// A local endpoint stopped matching a policy's selector
    pub fn on_policy_match_stopped<C: ActiveRulesCallbacks + ?Sized>(
        &mut self,
        key: &PolicyKey,
        cb: &mut C,
    ) -> Result<()> {
        if self.policy_matches.dec_ref(key, &mut ())? {
            cb.on_policy_inactive(key)?;
        }
        Ok(())
    }

    /// Whether the policy is currently active
    pub fn is_policy_active(&self, key: &PolicyKey) -> bool {
        self.policy_matches.contains(key)
    }

    /// Whether the profile is currently active
    pub fn is_profile_active(&self, key: &ProfileKey) -> bool {
        self.profile_refs.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::model::{HostEndpointKey, Rule};
    use strata_common::selector::NormalizingParser;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl ActiveRulesCallbacks for Recorder {
        fn on_policy_selector(&mut self, key: &PolicyKey, selector: Option<&Selector>) -> Result<()> {
            match selector {
                Some(s) => self.events.push(format!("sel {} {}", key.name, s)),
                None => self.events.push(format!("unsel {}", key.name)),
            }
            Ok(())
        }

        fn on_policy_active(&mut self, key: &PolicyKey, _policy: &Policy) -> Result<()> {
            self.events.push(format!("+pol {}", key.name));
            Ok(())
        }

        fn on_policy_inactive(&mut self, key: &PolicyKey) -> Result<()> {
            self.events.push(format!("-pol {}", key.name));
            Ok(())
        }

        fn on_profile_active(&mut self, key: &ProfileKey, inbound: &[Rule], _: &[Rule]) -> Result<()> {
            let action = inbound.first().map(|r| r.action.as_str()).unwrap_or("none");
            self.events.push(format!("+prof {} {}", key.name, action));
            Ok(())
        }

        fn on_profile_inactive(&mut self, key: &ProfileKey) -> Result<()> {
            self.events.push(format!("-prof {}", key.name));
            Ok(())
        }
    }

    fn calc() -> ActiveRulesCalculator {
        ActiveRulesCalculator::new(Arc::new(NormalizingParser))
    }

    fn hep(name: &str) -> EndpointKey {
        EndpointKey::Host(HostEndpointKey {
            hostname: "node-1".to_string(),
            endpoint_id: name.to_string(),
        })
    }

    fn allow_profile() -> Profile {
        Profile {
            inbound_rules: vec![Rule::default()],
            ..Default::default()
        }
    }

    #[test]
    fn test_policy_activates_on_first_match_only() {
        let mut calc = calc();
        let mut rec = Recorder::default();
        let key = PolicyKey::new("default", "p");
        calc.on_policy_update(
            &key,
            Some(Policy {
                selector: "all()".to_string(),
                ..Default::default()
            }),
            &mut rec,
        )
        .unwrap();
        assert_eq!(rec.events, vec!["sel p all()"]);

        calc.on_policy_match_started(&key, &mut rec).unwrap();
        calc.on_policy_match_started(&key, &mut rec).unwrap();
        calc.on_policy_match_stopped(&key, &mut rec).unwrap();
        assert!(calc.is_policy_active(&key));
        calc.on_policy_match_stopped(&key, &mut rec).unwrap();
        assert!(!calc.is_policy_active(&key));
        assert_eq!(rec.events, vec!["sel p all()", "+pol p", "-pol p"]);
    }

    #[test]
    fn test_unmatched_stop_is_fatal() {
        let mut calc = calc();
        let mut rec = Recorder::default();
        let key = PolicyKey::new("default", "p");
        assert!(calc.on_policy_match_stopped(&key, &mut rec).is_err());
    }

    #[test]
    fn test_identical_policy_update_is_ignored() {
        let mut calc = calc();
        let mut rec = Recorder::default();
        let key = PolicyKey::new("default", "p");
        let policy = Policy {
            selector: "all()".to_string(),
            ..Default::default()
        };
        calc.on_policy_update(&key, Some(policy.clone()), &mut rec).unwrap();
        calc.on_policy_match_started(&key, &mut rec).unwrap();
        rec.events.clear();
        calc.on_policy_update(&key, Some(policy), &mut rec).unwrap();
        assert!(rec.events.is_empty());
    }

    #[test]
    fn test_active_policy_update_is_reannounced_without_reselecting() {
        let mut calc = calc();
        let mut rec = Recorder::default();
        let key = PolicyKey::new("default", "p");
        let mut policy = Policy {
            selector: "all()".to_string(),
            ..Default::default()
        };
        calc.on_policy_update(&key, Some(policy.clone()), &mut rec).unwrap();
        calc.on_policy_match_started(&key, &mut rec).unwrap();
        rec.events.clear();

        policy.order = Some(10.0);
        calc.on_policy_update(&key, Some(policy), &mut rec).unwrap();
        assert_eq!(rec.events, vec!["+pol p"]);
    }

    #[test]
    fn test_policy_delete_withdraws_selector() {
        let mut calc = calc();
        let mut rec = Recorder::default();
        let key = PolicyKey::new("default", "p");
        calc.on_policy_update(
            &key,
            Some(Policy {
                selector: "all()".to_string(),
                ..Default::default()
            }),
            &mut rec,
        )
        .unwrap();
        calc.on_policy_update(&key, None, &mut rec).unwrap();
        calc.on_policy_update(&key, None, &mut rec).unwrap();
        assert_eq!(rec.events, vec!["sel p all()", "unsel p"]);
    }

    #[test]
    fn test_profile_refcounted_by_endpoints() {
        let mut calc = calc();
        let mut rec = Recorder::default();
        let web = ProfileKey::new("web");
        calc.on_profile_update(&web, Some(allow_profile()), &mut rec).unwrap();
        assert!(rec.events.is_empty());

        let ids = vec!["web".to_string()];
        calc.on_endpoint_update(&hep("a"), Some(ids.as_slice()), &mut rec).unwrap();
        calc.on_endpoint_update(&hep("b"), Some(ids.as_slice()), &mut rec).unwrap();
        calc.on_endpoint_update(&hep("a"), None, &mut rec).unwrap();
        assert!(calc.is_profile_active(&web));
        calc.on_endpoint_update(&hep("b"), None, &mut rec).unwrap();
        assert_eq!(rec.events, vec!["+prof web allow", "-prof web"]);
    }

    #[test]
    fn test_undefined_profile_is_announced_as_deny() {
        let mut calc = calc();
        let mut rec = Recorder::default();
        let ids = vec!["ghost".to_string()];
        calc.on_endpoint_update(&hep("a"), Some(ids.as_slice()), &mut rec).unwrap();
        assert_eq!(rec.events, vec!["+prof ghost deny"]);

        calc.on_profile_update(&ProfileKey::new("ghost"), Some(allow_profile()), &mut rec)
            .unwrap();
        assert_eq!(rec.events.last().unwrap(), "+prof ghost allow");

        calc.on_profile_update(&ProfileKey::new("ghost"), None, &mut rec)
            .unwrap();
        assert_eq!(rec.events.last().unwrap(), "+prof ghost deny");
    }

    #[test]
    fn test_profile_label_change_does_not_reannounce() {
        let mut calc = calc();
        let mut rec = Recorder::default();
        let web = ProfileKey::new("web");
        calc.on_profile_update(&web, Some(allow_profile()), &mut rec).unwrap();
        calc.on_endpoint_update(&hep("a"), Some(&["web".to_string()][..]), &mut rec)
            .unwrap();
        rec.events.clear();

        let mut relabelled = allow_profile();
        relabelled.labels.insert("team".to_string(), "blue".to_string());
        calc.on_profile_update(&web, Some(relabelled), &mut rec).unwrap();
        assert!(rec.events.is_empty());
    }

    #[test]
    fn test_profile_swap_keeps_shared_profile() {
        let mut calc = calc();
        let mut rec = Recorder::default();
        calc.on_endpoint_update(
            &hep("a"),
            Some(&["p1".to_string(), "p2".to_string()][..]),
            &mut rec,
        )
        .unwrap();
        rec.events.clear();
        calc.on_endpoint_update(
            &hep("a"),
            Some(&["p2".to_string(), "p3".to_string()][..]),
            &mut rec,
        )
        .unwrap();
        assert_eq!(rec.events, vec!["+prof p3 deny", "-prof p1"]);
    }

    #[test]
    fn test_repeated_profile_ids_hold_one_reference() {
        let p = ProfileKey::new("p");
        let twice = ["p".to_string(), "p".to_string()];
        let once = ["p".to_string()];

        let mut rules = calc();
        let mut rec = Recorder::default();
        rules.on_endpoint_update(&hep("a"), Some(&twice[..]), &mut rec).unwrap();
        rules.on_endpoint_update(&hep("a"), Some(&once[..]), &mut rec).unwrap();
        rules.on_endpoint_update(&hep("a"), None, &mut rec).unwrap();
        assert!(!rules.is_profile_active(&p));
        assert_eq!(rec.events, vec!["+prof p deny", "-prof p"]);

        let mut rules = calc();
        let mut rec = Recorder::default();
        rules.on_endpoint_update(&hep("a"), Some(&once[..]), &mut rec).unwrap();
        rules.on_endpoint_update(&hep("a"), Some(&twice[..]), &mut rec).unwrap();
        rules.on_endpoint_update(&hep("a"), None, &mut rec).unwrap();
        assert!(!rules.is_profile_active(&p));
        assert_eq!(rec.events, vec!["+prof p deny", "-prof p"]);
    }
}
