//! Rule scanner
//!
//! Extracts the selectors referenced by active policies and profiles and
//! keeps one IP set alive per distinct selector. A policy or profile holds
//! at most one reference per selector however many of its rules use it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use strata_common::model::{Policy, PolicyKey, ProfileKey, Rule, RuleAction};
use strata_common::selector::SelectorParser;
use strata_common::Result;

use crate::ipsets::{IpSetCallbacks, IpSetData, IpSetKind};
use crate::refcount::{ActivationCallbacks, RefCountRegistry};

/// A rule with its selectors replaced by IP set ids
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedRule {
    /// Action taken on match
    pub action: RuleAction,
    /// Protocol name
    pub protocol: Option<String>,
    /// Source CIDRs
    pub src_nets: Vec<IpNet>,
    /// Destination CIDRs
    pub dst_nets: Vec<IpNet>,
    /// Source ports
    pub src_ports: Vec<u16>,
    /// Destination ports
    pub dst_ports: Vec<u16>,
    /// Source must be in these IP sets
    pub src_ip_set_ids: Vec<String>,
    /// Destination must be in these IP sets
    pub dst_ip_set_ids: Vec<String>,
    /// Source must not be in these IP sets
    pub not_src_ip_set_ids: Vec<String>,
    /// Destination must not be in these IP sets
    pub not_dst_ip_set_ids: Vec<String>,
}

/// Parsed rules of a policy or profile
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedRules {
    /// Ingress rules
    pub inbound_rules: Vec<ParsedRule>,
    /// Egress rules
    pub outbound_rules: Vec<ParsedRule>,
    /// Policy applies in the untracked table
    pub untracked: bool,
    /// Policy applies before DNAT
    pub pre_dnat: bool,
}

/// Receives the scanner's output
pub trait RuleScannerCallbacks: IpSetCallbacks {
    /// A policy became active or its rules changed
    fn on_policy_active(&mut self, key: &PolicyKey, rules: ParsedRules) -> Result<()>;

    /// A policy is no longer active
    fn on_policy_inactive(&mut self, key: &PolicyKey) -> Result<()>;

    /// A profile became active or its rules changed
    fn on_profile_active(&mut self, key: &ProfileKey, rules: ParsedRules) -> Result<()>;

    /// A profile is no longer active
    fn on_profile_inactive(&mut self, key: &ProfileKey) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RulesId {
    Policy(PolicyKey),
    Profile(ProfileKey),
}

struct IpSetTransitions<'a, C: ?Sized>(&'a mut C);

impl<C: IpSetCallbacks + ?Sized> ActivationCallbacks<String, IpSetData> for IpSetTransitions<'_, C> {
    fn on_activated(&mut self, _key: &String, value: &IpSetData) -> Result<()> {
        self.0.on_ip_set_active(value)
    }

    fn on_deactivated(&mut self, _key: &String, value: IpSetData) -> Result<()> {
        self.0.on_ip_set_inactive(&value)
    }
}

/// Scans active rules for selectors
pub struct RuleScanner {
    parser: Arc<dyn SelectorParser>,
    selectors: RefCountRegistry<String, IpSetData>,
    uids_by_rules: HashMap<RulesId, HashSet<String>>,
}

impl RuleScanner {
    /// Create a scanner using `parser` to canonicalize selectors
    pub fn new(parser: Arc<dyn SelectorParser>) -> Self {
        Self {
            parser,
            selectors: RefCountRegistry::new("rule-selectors"),
            uids_by_rules: HashMap::new(),
        }
    }

    /// Announce or refresh an active policy
    pub fn on_policy_active<C: RuleScannerCallbacks + ?Sized>(
        &mut self,
        key: &PolicyKey,
        policy: &Policy,
        cb: &mut C,
    ) -> Result<()> {
        let (mut parsed, selectors) =
            self.parse(&policy.inbound_rules, &policy.outbound_rules)?;
        parsed.untracked = policy.do_not_track;
        parsed.pre_dnat = policy.pre_dnat;

        let removed = self.acquire(RulesId::Policy(key.clone()), selectors, cb)?;
        cb.on_policy_active(key, parsed)?;
        self.release(removed, cb)
    }

    /// Withdraw an active policy
    pub fn on_policy_inactive<C: RuleScannerCallbacks + ?Sized>(
        &mut self,
        key: &PolicyKey,
        cb: &mut C,
    ) -> Result<()> {
        cb.on_policy_inactive(key)?;
        let removed = self
            .uids_by_rules
            .remove(&RulesId::Policy(key.clone()))
            .unwrap_or_default();
        self.release(removed.into_iter().collect(), cb)
    }

    /// Announce or refresh an active profile
    pub fn on_profile_active<C: RuleScannerCallbacks + ?Sized>(
        &mut self,
        key: &ProfileKey,
        inbound: &[Rule],
        outbound: &[Rule],
        cb: &mut C,
    ) -> Result<()> {
        let (parsed, selectors) = self.parse(inbound, outbound)?;
        let removed = self.acquire(RulesId::Profile(key.clone()), selectors, cb)?;
        cb.on_profile_active(key, parsed)?;
        self.release(removed, cb)
    }

    /// Withdraw an active profile
    pub fn on_profile_inactive<C: RuleScannerCallbacks + ?Sized>(
        &mut self,
        key: &ProfileKey,
        cb: &mut C,
    ) -> Result<()> {
        cb.on_profile_inactive(key)?;
        let removed = self
            .uids_by_rules
            .remove(&RulesId::Profile(key.clone()))
            .unwrap_or_default();
        self.release(removed.into_iter().collect(), cb)
    }

    /// Number of selector IP sets currently active
    pub fn active_ip_sets(&self) -> usize {
        self.selectors.len()
    }

    /// Take references on selectors new to `id`; returns those it dropped
    fn acquire<C: IpSetCallbacks + ?Sized>(
        &mut self,
        id: RulesId,
        selectors: HashMap<String, IpSetData>,
        cb: &mut C,
    ) -> Result<Vec<String>> {
        let old = self.uids_by_rules.remove(&id).unwrap_or_default();
        let mut transitions = IpSetTransitions(cb);
        for (uid, data) in &selectors {
            if !old.contains(uid) {
                self.selectors
                    .inc_ref(uid, |_| Ok(data.clone()), &mut transitions)?;
            }
        }
        let removed = old
            .iter()
            .filter(|uid| !selectors.contains_key(*uid))
            .cloned()
            .collect();
        if !selectors.is_empty() {
            self.uids_by_rules
                .insert(id, selectors.into_keys().collect());
        }
        Ok(removed)
    }

    fn release<C: IpSetCallbacks + ?Sized>(&mut self, uids: Vec<String>, cb: &mut C) -> Result<()> {
        let mut transitions = IpSetTransitions(cb);
        for uid in uids {
            self.selectors.dec_ref(&uid, &mut transitions)?;
        }
        Ok(())
    }

    fn parse(
        &self,
        inbound: &[Rule],
        outbound: &[Rule],
    ) -> Result<(ParsedRules, HashMap<String, IpSetData>)> {
        let mut selectors = HashMap::new();
        let inbound_rules = inbound
            .iter()
            .map(|r| self.parse_rule(r, &mut selectors))
            .collect::<Result<Vec<_>>>()?;
        let outbound_rules = outbound
            .iter()
            .map(|r| self.parse_rule(r, &mut selectors))
            .collect::<Result<Vec<_>>>()?;
        Ok((
            ParsedRules {
                inbound_rules,
                outbound_rules,
                ..Default::default()
            },
            selectors,
        ))
    }

    fn parse_rule(
        &self,
        rule: &Rule,
        selectors: &mut HashMap<String, IpSetData>,
    ) -> Result<ParsedRule> {
        let mut ids_for = |expr: &Option<String>| -> Result<Vec<String>> {
            let Some(expr) = expr.as_deref().filter(|e| !e.trim().is_empty()) else {
                return Ok(Vec::new());
            };
            let selector = self.parser.parse(expr)?;
            let uid = selector.unique_id().to_string();
            selectors.entry(uid.clone()).or_insert_with(|| IpSetData {
                id: uid.clone(),
                kind: IpSetKind::Net,
                selector: Some(selector),
            });
            Ok(vec![uid])
        };

        Ok(ParsedRule {
            action: rule.action,
            protocol: rule.protocol.clone(),
            src_nets: rule.src_nets.clone(),
            dst_nets: rule.dst_nets.clone(),
            src_ports: rule.src_ports.clone(),
            dst_ports: rule.dst_ports.clone(),
            src_ip_set_ids: ids_for(&rule.src_selector)?,
            dst_ip_set_ids: ids_for(&rule.dst_selector)?,
            not_src_ip_set_ids: ids_for(&rule.not_src_selector)?,
            not_dst_ip_set_ids: ids_for(&rule.not_dst_selector)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::selector::NormalizingParser;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        last_rules: Option<ParsedRules>,
    }

    impl IpSetCallbacks for Recorder {
        fn on_ip_set_active(&mut self, data: &IpSetData) -> Result<()> {
            let sel = data.selector.as_ref().map(|s| s.to_string()).unwrap_or_default();
            self.events.push(format!("+set {sel}"));
            Ok(())
        }

        fn on_ip_set_inactive(&mut self, data: &IpSetData) -> Result<()> {
            let sel = data.selector.as_ref().map(|s| s.to_string()).unwrap_or_default();
            self.events.push(format!("-set {sel}"));
            Ok(())
        }
    }

    impl RuleScannerCallbacks for Recorder {
        fn on_policy_active(&mut self, key: &PolicyKey, rules: ParsedRules) -> Result<()> {
            self.events.push(format!("+pol {}", key.name));
            self.last_rules = Some(rules);
            Ok(())
        }

        fn on_policy_inactive(&mut self, key: &PolicyKey) -> Result<()> {
            self.events.push(format!("-pol {}", key.name));
            Ok(())
        }

        fn on_profile_active(&mut self, key: &ProfileKey, rules: ParsedRules) -> Result<()> {
            self.events.push(format!("+prof {}", key.name));
            self.last_rules = Some(rules);
            Ok(())
        }

        fn on_profile_inactive(&mut self, key: &ProfileKey) -> Result<()> {
            self.events.push(format!("-prof {}", key.name));
            Ok(())
        }
    }

    fn scanner() -> RuleScanner {
        RuleScanner::new(Arc::new(NormalizingParser))
    }

    fn rule_from(selector: &str) -> Rule {
        Rule {
            src_selector: Some(selector.to_string()),
            ..Default::default()
        }
    }

    fn policy(rules: Vec<Rule>) -> Policy {
        Policy {
            selector: "all()".to_string(),
            inbound_rules: rules,
            ..Default::default()
        }
    }

    #[test]
    fn test_selector_becomes_ip_set_before_policy() {
        let mut scanner = scanner();
        let mut rec = Recorder::default();
        let key = PolicyKey::new("default", "allow-db");
        scanner
            .on_policy_active(&key, &policy(vec![rule_from("role == 'db'")]), &mut rec)
            .unwrap();
        assert_eq!(rec.events, vec!["+set role == 'db'", "+pol allow-db"]);

        let rules = rec.last_rules.expect("rules should be emitted");
        assert_eq!(rules.inbound_rules[0].src_ip_set_ids.len(), 1);
        assert!(rules.inbound_rules[0].src_ip_set_ids[0].starts_with("s:"));
    }

    #[test]
    fn test_repeated_selector_holds_one_reference() {
        let mut scanner = scanner();
        let mut rec = Recorder::default();
        let key = PolicyKey::new("default", "p");
        let rules = vec![rule_from("a == 'b'"), rule_from("a  ==  \"b\"")];
        scanner.on_policy_active(&key, &policy(rules), &mut rec).unwrap();
        assert_eq!(scanner.active_ip_sets(), 1);

        scanner.on_policy_inactive(&key, &mut rec).unwrap();
        assert_eq!(scanner.active_ip_sets(), 0);
        assert_eq!(rec.events.last().unwrap(), "-set a == 'b'");
    }

    #[test]
    fn test_shared_selector_survives_one_owner() {
        let mut scanner = scanner();
        let mut rec = Recorder::default();
        let p1 = PolicyKey::new("default", "p1");
        scanner
            .on_policy_active(&p1, &policy(vec![rule_from("a == 'b'")]), &mut rec)
            .unwrap();
        let prof = ProfileKey::new("web");
        scanner
            .on_profile_active(&prof, &[rule_from("a == 'b'")], &[], &mut rec)
            .unwrap();

        scanner.on_policy_inactive(&p1, &mut rec).unwrap();
        assert_eq!(scanner.active_ip_sets(), 1);
        assert!(!rec.events.iter().any(|e| e.starts_with("-set")));
    }

    #[test]
    fn test_rule_edit_swaps_ip_sets_in_order() {
        let mut scanner = scanner();
        let mut rec = Recorder::default();
        let key = PolicyKey::new("default", "p");
        scanner
            .on_policy_active(&key, &policy(vec![rule_from("a == 'old'")]), &mut rec)
            .unwrap();
        rec.events.clear();

        scanner
            .on_policy_active(&key, &policy(vec![rule_from("a == 'new'")]), &mut rec)
            .unwrap();
        assert_eq!(
            rec.events,
            vec!["+set a == 'new'", "+pol p", "-set a == 'old'"]
        );
    }

    #[test]
    fn test_invalid_selector_is_fatal() {
        let mut scanner = scanner();
        let mut rec = Recorder::default();
        let key = PolicyKey::new("default", "p");
        let err = scanner
            .on_policy_active(&key, &policy(vec![rule_from("a == 'unterminated")]), &mut rec)
            .unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(rec.events.is_empty());
    }

    #[test]
    fn test_policy_flags_are_carried() {
        let mut scanner = scanner();
        let mut rec = Recorder::default();
        let key = PolicyKey::new("default", "p");
        let mut pol = policy(Vec::new());
        pol.do_not_track = true;
        scanner.on_policy_active(&key, &pol, &mut rec).unwrap();
        assert!(rec.last_rules.unwrap().untracked);
    }
}
