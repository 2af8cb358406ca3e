//! NFLOG prefix reverse lookups
//!
//! Each policy and profile rule is logged under a fixed-width prefix. This
//! cache maps prefixes back to the rule that produced them. Updates diff the
//! old and new prefix sets of an object so unchanged rules keep their
//! entries.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strata_common::hash::short_hash;
use strata_common::model::{Policy, PolicyKey, Profile, ProfileKey, Rule, RuleAction};
use strata_common::Result;
use tracing::{debug, warn};

use crate::refcount::{ActivationCallbacks, RefCountRegistry};

/// Width of an NFLOG prefix in bytes
pub const NFLOG_PREFIX_LEN: usize = 64;

/// Tier name recorded for profile rules
pub const PROFILE_TIER: &str = "__PROFILE__";

/// Traffic direction of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards the endpoint
    Ingress,
    /// From the endpoint
    Egress,
}

impl Direction {
    fn code(self) -> char {
        match self {
            Self::Ingress => 'I',
            Self::Egress => 'E',
        }
    }
}

/// Position of a rule within its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleIndex {
    /// An explicit rule
    Rule(usize),
    /// The implicit deny at the end of a tier
    EndOfTier,
    /// The implicit deny when no profile matched
    NoMatch,
}

/// Full description of a logged rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId {
    /// Tier name, or [`PROFILE_TIER`] for profile rules
    pub tier: String,
    /// Policy or profile name
    pub name: String,
    /// Namespace of a namespaced policy
    pub namespace: Option<String>,
    /// Rule direction
    pub direction: Direction,
    /// Rule position
    pub index: RuleIndex,
    /// Rule action
    pub action: RuleAction,
}

impl RuleId {
    fn action_code(&self) -> char {
        match self.action {
            RuleAction::Allow => 'A',
            RuleAction::Deny => 'D',
            RuleAction::Pass => 'N',
            RuleAction::Log => 'L',
        }
    }

    fn is_profile(&self) -> bool {
        self.tier == PROFILE_TIER
    }

    fn owner_name(&self) -> String {
        match (&self.namespace, self.is_profile()) {
            (_, true) => self.name.clone(),
            (Some(ns), false) => format!("{ns}/{}.{}", self.tier, self.name),
            (None, false) => format!("{}.{}", self.tier, self.name),
        }
    }

    /// Human-readable prefix text before hashing and padding
    pub fn prefix_text(&self) -> String {
        let owner = if self.is_profile() { 'R' } else { 'P' };
        let dir = self.direction.code();
        match self.index {
            RuleIndex::Rule(i) => format!(
                "{}{owner}{dir}{i}|{}",
                self.action_code(),
                self.owner_name()
            ),
            RuleIndex::EndOfTier => format!("D{owner}{dir}|{}", self.tier),
            RuleIndex::NoMatch => format!("D{owner}{dir}|"),
        }
    }

    /// The fixed-width prefix this rule is logged under
    pub fn prefix(&self) -> NflogPrefix {
        NflogPrefix::new(&self.prefix_text())
    }
}

/// A fixed-width NFLOG prefix
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NflogPrefix([u8; NFLOG_PREFIX_LEN]);

impl NflogPrefix {
    /// Build a prefix from text, hashing its tail if it does not fit
    pub fn new(text: &str) -> Self {
        let mut bytes = [0u8; NFLOG_PREFIX_LEN];
        if text.len() <= NFLOG_PREFIX_LEN {
            bytes[..text.len()].copy_from_slice(text.as_bytes());
            return Self(bytes);
        }
        let hash = short_hash("|", text);
        let mut cut = NFLOG_PREFIX_LEN - hash.len();
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        let shortened = format!("{}{hash}", &text[..cut]);
        bytes[..shortened.len()].copy_from_slice(shortened.as_bytes());
        Self(bytes)
    }

    /// Prefix as reported by the kernel, padding included
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut bytes = [0u8; NFLOG_PREFIX_LEN];
        let len = raw.len().min(NFLOG_PREFIX_LEN);
        bytes[..len].copy_from_slice(&raw[..len]);
        Self(bytes)
    }

    /// Prefix bytes without padding
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(NFLOG_PREFIX_LEN);
        &self.0[..end]
    }
}

impl fmt::Debug for NflogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NflogPrefix({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

#[derive(Debug)]
struct NflogState {
    by_prefix: HashMap<NflogPrefix, RuleId>,
    policy_prefixes: HashMap<PolicyKey, HashSet<NflogPrefix>>,
    profile_prefixes: HashMap<ProfileKey, HashSet<NflogPrefix>>,
    tier_refs: RefCountRegistry<String, Vec<RuleId>>,
    tier_users: HashSet<PolicyKey>,
}

struct TierEntries<'a>(&'a mut HashMap<NflogPrefix, RuleId>);

impl ActivationCallbacks<String, Vec<RuleId>> for TierEntries<'_> {
    fn on_activated(&mut self, _tier: &String, ids: &Vec<RuleId>) -> Result<()> {
        for id in ids {
            self.0.insert(id.prefix(), id.clone());
        }
        Ok(())
    }

    fn on_deactivated(&mut self, _tier: &String, ids: Vec<RuleId>) -> Result<()> {
        for id in ids {
            self.0.remove(&id.prefix());
        }
        Ok(())
    }
}

fn rule_ids(
    tier: &str,
    name: &str,
    namespace: Option<&str>,
    inbound: &[Rule],
    outbound: &[Rule],
) -> Vec<RuleId> {
    let directed = inbound
        .iter()
        .enumerate()
        .map(|(i, r)| (Direction::Ingress, i, r.action))
        .chain(
            outbound
                .iter()
                .enumerate()
                .map(|(i, r)| (Direction::Egress, i, r.action)),
        );
    directed
        .map(|(direction, i, action)| RuleId {
            tier: tier.to_string(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            direction,
            index: RuleIndex::Rule(i),
            action,
        })
        .collect()
}

fn end_of_tier_ids(tier: &str) -> Vec<RuleId> {
    [Direction::Ingress, Direction::Egress]
        .into_iter()
        .map(|direction| RuleId {
            tier: tier.to_string(),
            name: String::new(),
            namespace: None,
            direction,
            index: RuleIndex::EndOfTier,
            action: RuleAction::Deny,
        })
        .collect()
}

/// Replace an owner's entries, touching only prefixes that changed
fn apply_diff(
    by_prefix: &mut HashMap<NflogPrefix, RuleId>,
    stored: Option<HashSet<NflogPrefix>>,
    ids: Vec<RuleId>,
) -> HashSet<NflogPrefix> {
    let old = stored.unwrap_or_default();
    let mut new = HashSet::with_capacity(ids.len());
    for id in ids {
        let prefix = id.prefix();
        if !old.contains(&prefix) || by_prefix.get(&prefix) != Some(&id) {
            by_prefix.insert(prefix, id);
        }
        new.insert(prefix);
    }
    for prefix in old.difference(&new) {
        by_prefix.remove(prefix);
    }
    new
}

/// Prefix to rule lookups; clones share the same cache
#[derive(Debug, Clone)]
pub struct NflogLookupsCache {
    state: Arc<RwLock<NflogState>>,
}

impl Default for NflogLookupsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NflogLookupsCache {
    /// Create a cache seeded with the no-match profile entries
    pub fn new() -> Self {
        let mut state = NflogState {
            by_prefix: HashMap::new(),
            policy_prefixes: HashMap::new(),
            profile_prefixes: HashMap::new(),
            tier_refs: RefCountRegistry::new("nflog-tiers"),
            tier_users: HashSet::new(),
        };
        for direction in [Direction::Ingress, Direction::Egress] {
            let id = RuleId {
                tier: PROFILE_TIER.to_string(),
                name: String::new(),
                namespace: None,
                direction,
                index: RuleIndex::NoMatch,
                action: RuleAction::Deny,
            };
            state.by_prefix.insert(id.prefix(), id);
        }
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// A policy was created, updated or deleted
    ///
    /// Policies with malformed names are skipped, leaving prior entries.
    pub fn on_policy_update(&self, key: &PolicyKey, policy: Option<&Policy>) -> Result<()> {
        let ids = match policy {
            Some(policy) => {
                let (namespace, name) = match key.namespace_and_name() {
                    Ok(parts) => parts,
                    Err(err) => {
                        warn!(policy = %key, error = %err, "skipping NFLOG entries for policy");
                        return Ok(());
                    }
                };
                Some(rule_ids(
                    &key.tier,
                    name,
                    namespace,
                    &policy.inbound_rules,
                    &policy.outbound_rules,
                ))
            }
            None => None,
        };

        let mut guard = self.state.write();
        let state = &mut *guard;
        match ids {
            Some(ids) => {
                let stored = state.policy_prefixes.remove(key);
                let prefixes = apply_diff(&mut state.by_prefix, stored, ids);
                state.policy_prefixes.insert(key.clone(), prefixes);
                if state.tier_users.insert(key.clone()) {
                    state.tier_refs.inc_ref(
                        &key.tier,
                        |tier| Ok(end_of_tier_ids(tier)),
                        &mut TierEntries(&mut state.by_prefix),
                    )?;
                }
            }
            None => {
                if let Some(stored) = state.policy_prefixes.remove(key) {
                    apply_diff(&mut state.by_prefix, Some(stored), Vec::new());
                }
                if state.tier_users.remove(key) {
                    state
                        .tier_refs
                        .dec_ref(&key.tier, &mut TierEntries(&mut state.by_prefix))?;
                }
            }
        }
        debug!(policy = %key, entries = state.by_prefix.len(), "NFLOG entries updated");
        Ok(())
    }

    /// A profile was created, updated or deleted
    pub fn on_profile_update(&self, key: &ProfileKey, profile: Option<&Profile>) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let stored = state.profile_prefixes.remove(key);
        match profile {
            Some(profile) => {
                let ids = rule_ids(
                    PROFILE_TIER,
                    &key.name,
                    None,
                    &profile.inbound_rules,
                    &profile.outbound_rules,
                );
                let prefixes = apply_diff(&mut state.by_prefix, stored, ids);
                state.profile_prefixes.insert(key.clone(), prefixes);
            }
            None => {
                apply_diff(&mut state.by_prefix, stored, Vec::new());
            }
        }
    }

    /// Look up the rule logged under `prefix`
    pub fn get_rule_id(&self, prefix: &[u8]) -> Option<RuleId> {
        self.state
            .read()
            .by_prefix
            .get(&NflogPrefix::from_bytes(prefix))
            .cloned()
    }

    /// Number of prefixes known
    pub fn len(&self) -> usize {
        self.state.read().by_prefix.len()
    }

    /// Whether no prefixes are known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
