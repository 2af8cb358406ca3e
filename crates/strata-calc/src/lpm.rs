//! Longest-prefix-match trie
//!
//! A path-compressed binary trie over left-aligned 128-bit address keys,
//! one root per address family. Each exact CIDR node holds a list of
//! owners so overlapping and duplicate CIDRs from different owners
//! coexist. Nodes left with no owners and fewer than two children are
//! removed or merged into their child.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

#[derive(Debug)]
struct Node<V> {
    bits: u128,
    len: u8,
    values: Vec<V>,
    children: [Option<Box<Node<V>>>; 2],
}

impl<V> Node<V> {
    fn leaf(bits: u128, len: u8, value: V) -> Box<Self> {
        Box::new(Self {
            bits,
            len,
            values: vec![value],
            children: [None, None],
        })
    }

    fn branch(bits: u128, len: u8) -> Box<Self> {
        Box::new(Self {
            bits,
            len,
            values: Vec::new(),
            children: [None, None],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn width(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }
}

fn net_key(net: &IpNet) -> (Family, u128, u8) {
    match net {
        IpNet::V4(n) => (
            Family::V4,
            u128::from(u32::from(n.network())) << 96,
            n.prefix_len(),
        ),
        IpNet::V6(n) => (Family::V6, u128::from(n.network()), n.prefix_len()),
    }
}

fn addr_key(addr: IpAddr) -> (Family, u128, u8) {
    match addr {
        IpAddr::V4(a) => (Family::V4, u128::from(u32::from(a)) << 96, 32),
        IpAddr::V6(a) => (Family::V6, u128::from(a), 128),
    }
}

fn mask(bits: u128, len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        bits & (u128::MAX << (128 - u32::from(len)))
    }
}

fn bit_at(bits: u128, pos: u8) -> usize {
    ((bits >> (127 - u32::from(pos))) & 1) as usize
}

fn common_len(a: u128, b: u128, max: u8) -> u8 {
    let differing = (a ^ b).leading_zeros().min(128) as u8;
    differing.min(max)
}

fn to_net(family: Family, bits: u128, len: u8) -> Option<IpNet> {
    match family {
        Family::V4 => Ipv4Net::new(Ipv4Addr::from((bits >> 96) as u32), len)
            .ok()
            .map(IpNet::V4),
        Family::V6 => Ipv6Net::new(Ipv6Addr::from(bits), len)
            .ok()
            .map(IpNet::V6),
    }
}

/// Maps CIDRs to owner lists with longest-prefix lookup
#[derive(Debug)]
pub struct LpmTrie<V> {
    v4: Option<Box<Node<V>>>,
    v6: Option<Box<Node<V>>>,
    entries: usize,
}

impl<V> Default for LpmTrie<V> {
    fn default() -> Self {
        Self {
            v4: None,
            v6: None,
            entries: 0,
        }
    }
}

impl<V: PartialEq> LpmTrie<V> {
    /// Create an empty trie
    pub fn new() -> Self {
        Self::default()
    }

    fn root(&self, family: Family) -> Option<&Node<V>> {
        match family {
            Family::V4 => self.v4.as_deref(),
            Family::V6 => self.v6.as_deref(),
        }
    }

    fn root_mut(&mut self, family: Family) -> &mut Option<Box<Node<V>>> {
        match family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        }
    }

    /// Add `value` as an owner of `net`
    ///
    /// Returns false if `value` already owned exactly this CIDR.
    pub fn insert(&mut self, net: &IpNet, value: V) -> bool {
        let (family, bits, len) = net_key(net);
        let inserted = insert_at(self.root_mut(family), bits, len, value);
        if inserted {
            self.entries += 1;
        }
        inserted
    }

    /// Remove `value` as an owner of `net`
    ///
    /// Returns false if it was not an owner.
    pub fn remove(&mut self, net: &IpNet, value: &V) -> bool {
        let (family, bits, len) = net_key(net);
        let removed = remove_at(self.root_mut(family), bits, len, value);
        if removed {
            self.entries -= 1;
        }
        removed
    }

    /// Owners of the most specific CIDR containing `addr`
    pub fn lookup(&self, addr: IpAddr) -> Option<(IpNet, &[V])> {
        let (family, bits, len) = addr_key(addr);
        self.longest(family, bits, len)
    }

    /// Owners of the most specific CIDR containing all of `net`
    pub fn lookup_net(&self, net: &IpNet) -> Option<(IpNet, &[V])> {
        let (family, bits, len) = net_key(net);
        self.longest(family, bits, len)
    }

    /// Owners of exactly `net`
    pub fn get(&self, net: &IpNet) -> Option<&[V]> {
        let (family, bits, len) = net_key(net);
        let mut cur = self.root(family);
        while let Some(node) = cur {
            if node.len > len || mask(bits, node.len) != node.bits {
                return None;
            }
            if node.len == len {
                return (!node.values.is_empty()).then_some(node.values.as_slice());
            }
            cur = node.children[bit_at(bits, node.len)].as_deref();
        }
        None
    }

    /// Number of (CIDR, owner) pairs
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether the trie holds no owners
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn longest(&self, family: Family, bits: u128, len: u8) -> Option<(IpNet, &[V])> {
        let mut best: Option<&Node<V>> = None;
        let mut cur = self.root(family);
        while let Some(node) = cur {
            if node.len > len || mask(bits, node.len) != node.bits {
                break;
            }
            if !node.values.is_empty() {
                best = Some(node);
            }
            if node.len >= family.width() {
                break;
            }
            cur = node.children[bit_at(bits, node.len)].as_deref();
        }
        let node = best?;
        let net = to_net(family, node.bits, node.len)?;
        Some((net, node.values.as_slice()))
    }

    #[cfg(test)]
    fn node_count(&self) -> usize {
        fn count<V>(node: Option<&Node<V>>) -> usize {
            node.map_or(0, |n| {
                1 + count(n.children[0].as_deref()) + count(n.children[1].as_deref())
            })
        }
        count(self.v4.as_deref()) + count(self.v6.as_deref())
    }
}

fn insert_at<V: PartialEq>(slot: &mut Option<Box<Node<V>>>, bits: u128, len: u8, value: V) -> bool {
    let bits = mask(bits, len);
    let node = match slot {
        None => {
            *slot = Some(Node::leaf(bits, len, value));
            return true;
        }
        Some(node) => node,
    };

    let common = common_len(node.bits, bits, node.len.min(len));
    if common == node.len {
        if len == node.len {
            if node.values.contains(&value) {
                return false;
            }
            node.values.push(value);
            return true;
        }
        let child = bit_at(bits, node.len);
        return insert_at(&mut node.children[child], bits, len, value);
    }

    // The new key diverges from (or is a prefix of) this node: splice in a
    // branch at the common prefix.
    let Some(old) = slot.take() else {
        return false;
    };
    let mut branch = Node::branch(mask(bits, common), common);
    let old_side = bit_at(old.bits, common);
    branch.children[old_side] = Some(old);
    if common == len {
        branch.values.push(value);
    } else {
        branch.children[bit_at(bits, common)] = Some(Node::leaf(bits, len, value));
    }
    *slot = Some(branch);
    true
}

fn remove_at<V: PartialEq>(slot: &mut Option<Box<Node<V>>>, bits: u128, len: u8, value: &V) -> bool {
    let Some(node) = slot.as_mut() else {
        return false;
    };
    if node.len > len || mask(bits, node.len) != node.bits {
        return false;
    }
    let removed = if node.len == len {
        match node.values.iter().position(|v| v == value) {
            Some(idx) => {
                node.values.remove(idx);
                true
            }
            None => false,
        }
    } else {
        let child = bit_at(bits, node.len);
        remove_at(&mut node.children[child], bits, len, value)
    };
    if removed {
        compact(slot);
    }
    removed
}

fn compact<V>(slot: &mut Option<Box<Node<V>>>) {
    let Some(node) = slot.as_mut() else {
        return;
    };
    if !node.values.is_empty() {
        return;
    }
    let replacement = match (node.children[0].is_some(), node.children[1].is_some()) {
        (true, true) => return,
        (true, false) => node.children[0].take(),
        (false, true) => node.children[1].take(),
        (false, false) => None,
    };
    *slot = replacement;
}
