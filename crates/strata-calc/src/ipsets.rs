//! IP set identities, members and membership calculation
//!
//! Selector-backed IP sets take their members from the CIDRs of the items
//! the label index reports as matching. Members are reference counted per
//! set, so two matching items that share an address yield one member.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use strata_common::selector::Selector;
use strata_common::Result;
use tracing::debug;

use crate::labels::LabelledItem;
use crate::refcount::{RefCountRegistry, RefKey};

/// Dataplane representation of an IP set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpSetKind {
    /// Host addresses
    Ip,
    /// CIDRs
    Net,
    /// Address, protocol and port triples
    IpAndPort,
    /// Protocol and port pairs, per address family
    Ports,
}

/// Layer-4 protocol of a port member
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Address family of a port-only member
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// One IP set member
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpSetMember {
    /// A CIDR
    Net(IpNet),
    /// An address with protocol and port
    IpAndPort {
        /// Address
        addr: IpAddr,
        /// Protocol
        protocol: Protocol,
        /// Port
        port: u16,
    },
    /// A protocol and port for one address family
    Port {
        /// Address family
        family: AddressFamily,
        /// Protocol
        protocol: Protocol,
        /// Port
        port: u16,
    },
}

impl RefKey for IpSetMember {}

impl fmt::Display for IpSetMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Net(net) => write!(f, "{net}"),
            Self::IpAndPort {
                addr,
                protocol,
                port,
            } => write!(f, "{addr},{protocol}:{port}"),
            Self::Port {
                family,
                protocol,
                port,
            } => {
                let family = match family {
                    AddressFamily::V4 => "v4",
                    AddressFamily::V6 => "v6",
                };
                write!(f, "{family},{protocol}:{port}")
            }
        }
    }
}

/// An IP set the graph has activated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSetData {
    /// Dataplane name
    pub id: String,
    /// Dataplane representation
    pub kind: IpSetKind,
    /// Selector whose matches supply the members, if selector-backed
    pub selector: Option<Selector>,
}

/// Receives IP set activation transitions
pub trait IpSetCallbacks {
    /// The IP set is now referenced
    fn on_ip_set_active(&mut self, data: &IpSetData) -> Result<()>;

    /// The IP set is no longer referenced
    fn on_ip_set_inactive(&mut self, data: &IpSetData) -> Result<()>;
}

/// Receives member deltas
pub trait MemberCallbacks {
    /// `member` joined the set
    fn on_member_added(&mut self, set_id: &str, member: IpSetMember) -> Result<()>;

    /// `member` left the set
    fn on_member_removed(&mut self, set_id: &str, member: IpSetMember) -> Result<()>;
}

struct ActiveSet {
    matched: HashSet<LabelledItem>,
    members: RefCountRegistry<IpSetMember, ()>,
}

impl ActiveSet {
    fn new() -> Self {
        Self {
            matched: HashSet::new(),
            members: RefCountRegistry::new("ip-set-members"),
        }
    }

    fn add<C: MemberCallbacks + ?Sized>(&mut self, id: &str, net: &IpNet, cb: &mut C) -> Result<()> {
        let member = IpSetMember::Net(*net);
        if self.members.inc_ref(&member, |_| Ok(()), &mut ())? {
            cb.on_member_added(id, member)?;
        }
        Ok(())
    }

    fn remove<C: MemberCallbacks + ?Sized>(
        &mut self,
        id: &str,
        net: &IpNet,
        cb: &mut C,
    ) -> Result<()> {
        let member = IpSetMember::Net(*net);
        if self.members.dec_ref(&member, &mut ())? {
            cb.on_member_removed(id, member)?;
        }
        Ok(())
    }
}

/// Converts selector matches into IP set members
#[derive(Default)]
pub struct IpSetMemberCalculator {
    item_nets: HashMap<LabelledItem, BTreeSet<IpNet>>,
    item_sets: HashMap<LabelledItem, HashSet<String>>,
    active_sets: HashMap<String, ActiveSet>,
}

impl IpSetMemberCalculator {
    /// Create an empty calculator
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking matches for a newly active set
    pub fn on_ip_set_active(&mut self, id: &str) {
        self.active_sets
            .entry(id.to_string())
            .or_insert_with(ActiveSet::new);
    }

    /// Forget a set; the caller reports its removal, so no member
    /// deltas are emitted
    pub fn on_ip_set_inactive(&mut self, id: &str) {
        if let Some(set) = self.active_sets.remove(id) {
            for item in set.matched {
                if let Some(sets) = self.item_sets.get_mut(&item) {
                    sets.remove(id);
                    if sets.is_empty() {
                        self.item_sets.remove(&item);
                    }
                }
            }
        }
    }

    /// The item started matching the set's selector
    pub fn on_match_started<C: MemberCallbacks + ?Sized>(
        &mut self,
        id: &str,
        item: &LabelledItem,
        cb: &mut C,
    ) -> Result<()> {
        let Some(set) = self.active_sets.get_mut(id) else {
            debug!(ip_set = %id, "ignoring match for inactive IP set");
            return Ok(());
        };
        if !set.matched.insert(item.clone()) {
            return Ok(());
        }
        self.item_sets
            .entry(item.clone())
            .or_default()
            .insert(id.to_string());
        for net in self.item_nets.get(item).into_iter().flatten() {
            set.add(id, net, cb)?;
        }
        Ok(())
    }

    /// The item stopped matching the set's selector
    pub fn on_match_stopped<C: MemberCallbacks + ?Sized>(
        &mut self,
        id: &str,
        item: &LabelledItem,
        cb: &mut C,
    ) -> Result<()> {
        let Some(set) = self.active_sets.get_mut(id) else {
            return Ok(());
        };
        if !set.matched.remove(item) {
            return Ok(());
        }
        if let Some(sets) = self.item_sets.get_mut(item) {
            sets.remove(id);
            if sets.is_empty() {
                self.item_sets.remove(item);
            }
        }
        for net in self.item_nets.get(item).into_iter().flatten() {
            set.remove(id, net, cb)?;
        }
        Ok(())
    }

    /// Replace an item's CIDRs, updating every set it currently matches
    ///
    /// Repeated CIDRs count once.
    pub fn update_item_nets<C: MemberCallbacks + ?Sized>(
        &mut self,
        item: &LabelledItem,
        nets: Vec<IpNet>,
        cb: &mut C,
    ) -> Result<()> {
        let nets: BTreeSet<IpNet> = nets.into_iter().collect();
        let old = self.item_nets.get(item).cloned().unwrap_or_default();
        if old == nets {
            return Ok(());
        }
        let added: Vec<&IpNet> = nets.difference(&old).collect();
        let removed: Vec<&IpNet> = old.difference(&nets).collect();

        if let Some(set_ids) = self.item_sets.get(item) {
            for id in set_ids {
                let Some(set) = self.active_sets.get_mut(id) else {
                    continue;
                };
                for net in &added {
                    set.add(id, net, cb)?;
                }
                for net in &removed {
                    set.remove(id, net, cb)?;
                }
            }
        }

        if nets.is_empty() {
            self.item_nets.remove(item);
        } else {
            self.item_nets.insert(item.clone(), nets);
        }
        Ok(())
    }

    /// Forget an item, removing its members from every set it matches
    pub fn delete_item<C: MemberCallbacks + ?Sized>(
        &mut self,
        item: &LabelledItem,
        cb: &mut C,
    ) -> Result<()> {
        let set_ids: Vec<String> = self
            .item_sets
            .get(item)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        for id in set_ids {
            self.on_match_stopped(&id, item, cb)?;
        }
        self.item_nets.remove(item);
        Ok(())
    }

    /// Number of distinct members of an active set
    pub fn member_count(&self, id: &str) -> usize {
        self.active_sets.get(id).map_or(0, |s| s.members.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::model::NetworkSetKey;

    #[derive(Default)]
    struct Deltas {
        events: Vec<String>,
    }

    impl MemberCallbacks for Deltas {
        fn on_member_added(&mut self, set_id: &str, member: IpSetMember) -> Result<()> {
            self.events.push(format!("+{set_id} {member}"));
            Ok(())
        }

        fn on_member_removed(&mut self, set_id: &str, member: IpSetMember) -> Result<()> {
            self.events.push(format!("-{set_id} {member}"));
            Ok(())
        }
    }

    fn item(name: &str) -> LabelledItem {
        LabelledItem::NetworkSet(NetworkSetKey {
            name: name.to_string(),
        })
    }

    fn nets(cidrs: &[&str]) -> Vec<IpNet> {
        cidrs.iter().map(|c| c.parse().unwrap()).collect()
    }

    #[test]
    fn test_member_display() {
        assert_eq!(
            IpSetMember::Net("10.0.0.1/32".parse().unwrap()).to_string(),
            "10.0.0.1/32"
        );
        assert_eq!(
            IpSetMember::IpAndPort {
                addr: "10.96.0.10".parse().unwrap(),
                protocol: Protocol::Tcp,
                port: 53,
            }
            .to_string(),
            "10.96.0.10,tcp:53"
        );
        assert_eq!(
            IpSetMember::Port {
                family: AddressFamily::V6,
                protocol: Protocol::Tcp,
                port: 30080,
            }
            .to_string(),
            "v6,tcp:30080"
        );
    }

    #[test]
    fn test_match_adds_and_removes_members() {
        let mut calc = IpSetMemberCalculator::new();
        let mut cb = Deltas::default();
        calc.on_ip_set_active("s:a");
        calc.update_item_nets(&item("x"), nets(&["10.0.0.0/24"]), &mut cb)
            .unwrap();
        assert!(cb.events.is_empty());

        calc.on_match_started("s:a", &item("x"), &mut cb).unwrap();
        calc.on_match_stopped("s:a", &item("x"), &mut cb).unwrap();
        assert_eq!(cb.events, vec!["+s:a 10.0.0.0/24", "-s:a 10.0.0.0/24"]);
    }

    #[test]
    fn test_shared_member_is_refcounted() {
        let mut calc = IpSetMemberCalculator::new();
        let mut cb = Deltas::default();
        calc.on_ip_set_active("s:a");
        calc.update_item_nets(&item("x"), nets(&["10.0.0.1/32"]), &mut cb)
            .unwrap();
        calc.update_item_nets(&item("y"), nets(&["10.0.0.1/32"]), &mut cb)
            .unwrap();

        calc.on_match_started("s:a", &item("x"), &mut cb).unwrap();
        calc.on_match_started("s:a", &item("y"), &mut cb).unwrap();
        assert_eq!(cb.events, vec!["+s:a 10.0.0.1/32"]);
        assert_eq!(calc.member_count("s:a"), 1);

        calc.on_match_stopped("s:a", &item("x"), &mut cb).unwrap();
        assert_eq!(cb.events.len(), 1);
        calc.on_match_stopped("s:a", &item("y"), &mut cb).unwrap();
        assert_eq!(cb.events.last().unwrap(), "-s:a 10.0.0.1/32");
    }

    #[test]
    fn test_net_change_updates_matched_sets() {
        let mut calc = IpSetMemberCalculator::new();
        let mut cb = Deltas::default();
        calc.on_ip_set_active("s:a");
        calc.update_item_nets(&item("x"), nets(&["10.0.0.1/32"]), &mut cb)
            .unwrap();
        calc.on_match_started("s:a", &item("x"), &mut cb).unwrap();
        cb.events.clear();

        calc.update_item_nets(&item("x"), nets(&["10.0.0.1/32", "10.0.0.2/32"]), &mut cb)
            .unwrap();
        calc.update_item_nets(&item("x"), nets(&["10.0.0.2/32"]), &mut cb)
            .unwrap();
        assert_eq!(cb.events, vec!["+s:a 10.0.0.2/32", "-s:a 10.0.0.1/32"]);
    }

    #[test]
    fn test_inactive_set_ignores_matches() {
        let mut calc = IpSetMemberCalculator::new();
        let mut cb = Deltas::default();
        calc.update_item_nets(&item("x"), nets(&["10.0.0.1/32"]), &mut cb)
            .unwrap();
        calc.on_match_started("s:gone", &item("x"), &mut cb).unwrap();
        calc.on_match_stopped("s:gone", &item("x"), &mut cb).unwrap();
        assert!(cb.events.is_empty());
    }

    #[test]
    fn test_deactivation_drops_state_silently() {
        let mut calc = IpSetMemberCalculator::new();
        let mut cb = Deltas::default();
        calc.on_ip_set_active("s:a");
        calc.update_item_nets(&item("x"), nets(&["10.0.0.1/32"]), &mut cb)
            .unwrap();
        calc.on_match_started("s:a", &item("x"), &mut cb).unwrap();
        calc.on_ip_set_inactive("s:a");
        // Late stop event from the index after the set went away.
        calc.on_match_stopped("s:a", &item("x"), &mut cb).unwrap();
        assert_eq!(cb.events, vec!["+s:a 10.0.0.1/32"]);
        assert_eq!(calc.member_count("s:a"), 0);
    }

    #[test]
    fn test_delete_item_removes_members_before_stop_events() {
        let mut calc = IpSetMemberCalculator::new();
        let mut cb = Deltas::default();
        calc.on_ip_set_active("s:a");
        calc.update_item_nets(&item("x"), nets(&["10.0.0.1/32"]), &mut cb)
            .unwrap();
        calc.on_match_started("s:a", &item("x"), &mut cb).unwrap();
        calc.delete_item(&item("x"), &mut cb).unwrap();
        calc.on_match_stopped("s:a", &item("x"), &mut cb).unwrap();
        assert_eq!(cb.events, vec!["+s:a 10.0.0.1/32", "-s:a 10.0.0.1/32"]);
    }

    #[test]
    fn test_repeated_nets_hold_one_member_reference() {
        let mut calc = IpSetMemberCalculator::new();
        let mut cb = Deltas::default();
        calc.on_ip_set_active("s:a");
        calc.update_item_nets(&item("x"), nets(&["10.0.0.0/24", "10.0.0.0/24"]), &mut cb)
            .unwrap();
        calc.on_match_started("s:a", &item("x"), &mut cb).unwrap();
        calc.update_item_nets(&item("x"), nets(&["10.0.0.0/24"]), &mut cb)
            .unwrap();
        calc.delete_item(&item("x"), &mut cb).unwrap();
        assert_eq!(cb.events, vec!["+s:a 10.0.0.0/24", "-s:a 10.0.0.0/24"]);
        assert_eq!(calc.member_count("s:a"), 0);

        let mut cb = Deltas::default();
        calc.update_item_nets(&item("y"), nets(&["10.0.1.0/24"]), &mut cb)
            .unwrap();
        calc.on_match_started("s:a", &item("y"), &mut cb).unwrap();
        calc.update_item_nets(&item("y"), nets(&["10.0.1.0/24", "10.0.1.0/24"]), &mut cb)
            .unwrap();
        calc.delete_item(&item("y"), &mut cb).unwrap();
        assert_eq!(cb.events, vec!["+s:a 10.0.1.0/24", "-s:a 10.0.1.0/24"]);
    }
}
