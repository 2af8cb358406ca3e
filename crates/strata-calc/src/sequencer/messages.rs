//! Dataplane messages
//!
//! Everything the sequencer emits. Messages serialize as JSON objects
//! tagged by `type`.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use strata_common::model::{
    HostEndpoint, HostEndpointKey, IpPool, Labels, PacketCapture, PacketCaptureKey, PolicyKey,
    ProfileKey, WorkloadEndpoint, WorkloadEndpointKey,
};

use crate::ipsets::IpSetKind;
use crate::policy::FilteredTier;
use crate::routes::RouteUpdate;
use crate::rule_scanner::ParsedRules;

/// Policies of one tier applying to an endpoint, per direction
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierInfo {
    /// Tier name
    pub name: String,
    /// Ingress policy names in order
    pub ingress_policies: Vec<String>,
    /// Egress policy names in order
    pub egress_policies: Vec<String>,
}

impl TierInfo {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.ingress_policies.is_empty() && self.egress_policies.is_empty()
    }
}

/// Tier lists split by where the dataplane applies them
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SplitTiers {
    /// Normal filter tiers
    pub normal: Vec<TierInfo>,
    /// Untracked (raw table) tiers
    pub untracked: Vec<TierInfo>,
    /// Pre-DNAT tiers, ingress only
    pub pre_dnat: Vec<TierInfo>,
    /// Forwarded-traffic tiers
    pub forward: Vec<TierInfo>,
}

impl SplitTiers {
    /// Split resolved tiers into their dataplane lists
    pub fn from_filtered(tiers: &[FilteredTier]) -> Self {
        let mut split = Self::default();
        for tier in tiers {
            let mut normal = TierInfo::named(&tier.name);
            let mut untracked = TierInfo::named(&tier.name);
            let mut pre_dnat = TierInfo::named(&tier.name);
            let mut forward = TierInfo::named(&tier.name);
            for policy in &tier.policies {
                let meta = &policy.meta;
                let name = &policy.key.name;
                let targets: Vec<(&mut TierInfo, bool)> = if meta.do_not_track {
                    vec![(&mut untracked, true)]
                } else if meta.pre_dnat {
                    vec![(&mut pre_dnat, false)]
                } else if meta.apply_on_forward {
                    vec![(&mut normal, true), (&mut forward, true)]
                } else {
                    vec![(&mut normal, true)]
                };
                for (info, egress_allowed) in targets {
                    if meta.governs_ingress {
                        info.ingress_policies.push(name.clone());
                    }
                    if meta.governs_egress && egress_allowed {
                        info.egress_policies.push(name.clone());
                    }
                }
            }
            for (list, info) in [
                (&mut split.normal, normal),
                (&mut split.untracked, untracked),
                (&mut split.pre_dnat, pre_dnat),
                (&mut split.forward, forward),
            ] {
                if !info.is_empty() {
                    list.push(info);
                }
            }
        }
        split
    }
}

/// A workload endpoint as programmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEndpointMessage {
    /// Administrative state
    pub state: String,
    /// Host-side interface name
    pub name: String,
    /// Interface MAC address
    pub mac: Option<String>,
    /// Profiles in order
    pub profile_ids: Vec<String>,
    /// IPv4 addresses
    pub ipv4_nets: Vec<IpNet>,
    /// IPv6 addresses
    pub ipv6_nets: Vec<IpNet>,
    /// Ordered policy tiers
    pub tiers: Vec<TierInfo>,
    /// Egress gateway IP set, if any
    pub egress_ip_set_id: Option<String>,
}

impl WorkloadEndpointMessage {
    /// Build from the endpoint, its split tiers and egress set
    pub fn new(ep: &WorkloadEndpoint, tiers: SplitTiers, egress_ip_set_id: Option<String>) -> Self {
        Self {
            state: ep.state.clone(),
            name: ep.name.clone(),
            mac: ep.mac.clone(),
            profile_ids: ep.profile_ids.clone(),
            ipv4_nets: ep.ipv4_nets.clone(),
            ipv6_nets: ep.ipv6_nets.clone(),
            tiers: tiers.normal,
            egress_ip_set_id,
        }
    }
}

/// A host endpoint as programmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpointMessage {
    /// Interface name, None for all interfaces
    pub name: Option<String>,
    /// Profiles in order
    pub profile_ids: Vec<String>,
    /// Expected IPv4 addresses
    pub expected_ipv4_addrs: Vec<IpAddr>,
    /// Expected IPv6 addresses
    pub expected_ipv6_addrs: Vec<IpAddr>,
    /// Normal tiers
    pub tiers: Vec<TierInfo>,
    /// Untracked tiers
    pub untracked_tiers: Vec<TierInfo>,
    /// Pre-DNAT tiers
    pub pre_dnat_tiers: Vec<TierInfo>,
    /// Forward tiers
    pub forward_tiers: Vec<TierInfo>,
}

impl HostEndpointMessage {
    /// Build from the endpoint and its split tiers
    pub fn new(ep: &HostEndpoint, tiers: SplitTiers) -> Self {
        Self {
            name: ep.name.clone(),
            profile_ids: ep.profile_ids.clone(),
            expected_ipv4_addrs: ep.expected_ipv4_addrs.clone(),
            expected_ipv6_addrs: ep.expected_ipv6_addrs.clone(),
            tiers: tiers.normal,
            untracked_tiers: tiers.untracked,
            pre_dnat_tiers: tiers.pre_dnat,
            forward_tiers: tiers.forward,
        }
    }
}

/// One instruction to the dataplane driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataplaneMessage {
    /// The datastore snapshot has been fully delivered
    InSync,
    /// The datastore is not ready
    DatastoreNotReady,
    /// Effective raw configuration changed
    ConfigUpdate {
        /// Merged raw parameters
        config: BTreeMap<String, String>,
    },
    /// New IP set with its full membership
    IpSetUpdate {
        /// IP set id
        id: String,
        /// Dataplane representation
        kind: IpSetKind,
        /// Members
        members: Vec<String>,
    },
    /// Membership delta of an existing IP set
    IpSetDeltaUpdate {
        /// IP set id
        id: String,
        /// Members to add
        added_members: Vec<String>,
        /// Members to remove
        removed_members: Vec<String>,
    },
    /// IP set no longer needed
    IpSetRemove {
        /// IP set id
        id: String,
    },
    /// Policy now active or changed
    ActivePolicyUpdate {
        /// Policy key
        id: PolicyKey,
        /// Parsed rules
        policy: ParsedRules,
    },
    /// Policy no longer active
    ActivePolicyRemove {
        /// Policy key
        id: PolicyKey,
    },
    /// Profile now active or changed
    ActiveProfileUpdate {
        /// Profile key
        id: ProfileKey,
        /// Parsed rules
        profile: ParsedRules,
    },
    /// Profile no longer active
    ActiveProfileRemove {
        /// Profile key
        id: ProfileKey,
    },
    /// Local workload endpoint created or changed
    WorkloadEndpointUpdate {
        /// Endpoint key
        id: WorkloadEndpointKey,
        /// Endpoint
        endpoint: WorkloadEndpointMessage,
    },
    /// Local workload endpoint gone
    WorkloadEndpointRemove {
        /// Endpoint key
        id: WorkloadEndpointKey,
    },
    /// Local host endpoint created or changed
    HostEndpointUpdate {
        /// Endpoint key
        id: HostEndpointKey,
        /// Endpoint
        endpoint: HostEndpointMessage,
    },
    /// Local host endpoint gone
    HostEndpointRemove {
        /// Endpoint key
        id: HostEndpointKey,
    },
    /// Route created or changed
    RouteUpdate {
        /// Route
        route: RouteUpdate,
    },
    /// Route gone
    RouteRemove {
        /// Destination CIDR
        dst: IpNet,
    },
    /// Tunnel endpoint appeared
    TunnelAdd {
        /// Tunnel address
        addr: IpAddr,
    },
    /// Tunnel endpoint gone
    TunnelRemove {
        /// Tunnel address
        addr: IpAddr,
    },
    /// Workload addresses now bound to a tunnel
    BindingAdd {
        /// Tunnel address
        tunnel_addr: IpAddr,
        /// Workload addresses
        workload_addrs: Vec<IpAddr>,
    },
    /// Workload addresses no longer bound to a tunnel
    BindingRemove {
        /// Tunnel address
        tunnel_addr: IpAddr,
        /// Workload addresses
        workload_addrs: Vec<IpAddr>,
    },
    /// Workload addresses that must not be sent in the clear
    BlacklistAdd {
        /// Addresses
        addrs: Vec<IpAddr>,
    },
    /// Addresses leaving the blacklist
    BlacklistRemove {
        /// Addresses
        addrs: Vec<IpAddr>,
    },
    /// Packet capture applies to a local endpoint
    PacketCaptureUpdate {
        /// Capture key
        id: PacketCaptureKey,
        /// Endpoint captured on
        endpoint: WorkloadEndpointKey,
        /// Capture spec
        spec: PacketCapture,
    },
    /// Packet capture no longer applies to a local endpoint
    PacketCaptureRemove {
        /// Capture key
        id: PacketCaptureKey,
        /// Endpoint captured on
        endpoint: WorkloadEndpointKey,
    },
    /// Service account labels
    ServiceAccountUpdate {
        /// Namespace
        namespace: String,
        /// Service account name
        name: String,
        /// Labels
        labels: Labels,
    },
    /// Service account gone
    ServiceAccountRemove {
        /// Namespace
        namespace: String,
        /// Service account name
        name: String,
    },
    /// Namespace labels
    NamespaceUpdate {
        /// Namespace name
        name: String,
        /// Labels
        labels: Labels,
    },
    /// Namespace gone
    NamespaceRemove {
        /// Namespace name
        name: String,
    },
    /// A node's host address
    HostMetadataUpdate {
        /// Node name
        hostname: String,
        /// Host address
        addr: IpAddr,
    },
    /// A node's host address cleared
    HostMetadataRemove {
        /// Node name
        hostname: String,
    },
    /// IPAM pool created or changed
    IpamPoolUpdate {
        /// Pool id
        id: String,
        /// Pool
        pool: IpPool,
    },
    /// IPAM pool gone
    IpamPoolRemove {
        /// Pool id
        id: String,
    },
}

impl DataplaneMessage {
    /// Short label for logs and metrics
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::InSync => "in_sync",
            Self::DatastoreNotReady => "datastore_not_ready",
            Self::ConfigUpdate { .. } => "config_update",
            Self::IpSetUpdate { .. } => "ip_set_update",
            Self::IpSetDeltaUpdate { .. } => "ip_set_delta_update",
            Self::IpSetRemove { .. } => "ip_set_remove",
            Self::ActivePolicyUpdate { .. } => "active_policy_update",
            Self::ActivePolicyRemove { .. } => "active_policy_remove",
            Self::ActiveProfileUpdate { .. } => "active_profile_update",
            Self::ActiveProfileRemove { .. } => "active_profile_remove",
            Self::WorkloadEndpointUpdate { .. } => "workload_endpoint_update",
            Self::WorkloadEndpointRemove { .. } => "workload_endpoint_remove",
            Self::HostEndpointUpdate { .. } => "host_endpoint_update",
            Self::HostEndpointRemove { .. } => "host_endpoint_remove",
            Self::RouteUpdate { .. } => "route_update",
            Self::RouteRemove { .. } => "route_remove",
            Self::TunnelAdd { .. } => "tunnel_add",
            Self::TunnelRemove { .. } => "tunnel_remove",
            Self::BindingAdd { .. } => "binding_add",
            Self::BindingRemove { .. } => "binding_remove",
            Self::BlacklistAdd { .. } => "blacklist_add",
            Self::BlacklistRemove { .. } => "blacklist_remove",
            Self::PacketCaptureUpdate { .. } => "packet_capture_update",
            Self::PacketCaptureRemove { .. } => "packet_capture_remove",
            Self::ServiceAccountUpdate { .. } => "service_account_update",
            Self::ServiceAccountRemove { .. } => "service_account_remove",
            Self::NamespaceUpdate { .. } => "namespace_update",
            Self::NamespaceRemove { .. } => "namespace_remove",
            Self::HostMetadataUpdate { .. } => "host_metadata_update",
            Self::HostMetadataRemove { .. } => "host_metadata_remove",
            Self::IpamPoolUpdate { .. } => "ipam_pool_update",
            Self::IpamPoolRemove { .. } => "ipam_pool_remove",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FilteredPolicy, PolicyMeta};

    fn filtered(name: &str, meta: PolicyMeta) -> FilteredPolicy {
        FilteredPolicy {
            key: PolicyKey::new("t", name),
            meta,
        }
    }

    fn meta(ingress: bool, egress: bool) -> PolicyMeta {
        PolicyMeta {
            governs_ingress: ingress,
            governs_egress: egress,
            ..Default::default()
        }
    }

    #[test]
    fn test_split_tiers() {
        let tiers = vec![FilteredTier {
            name: "t".to_string(),
            policies: vec![
                filtered("plain", meta(true, true)),
                filtered(
                    "untracked",
                    PolicyMeta {
                        do_not_track: true,
                        ..meta(true, false)
                    },
                ),
                filtered(
                    "pre-dnat",
                    PolicyMeta {
                        pre_dnat: true,
                        ..meta(true, true)
                    },
                ),
                filtered(
                    "forward",
                    PolicyMeta {
                        apply_on_forward: true,
                        ..meta(false, true)
                    },
                ),
            ],
        }];
        let split = SplitTiers::from_filtered(&tiers);
        assert_eq!(split.normal[0].ingress_policies, vec!["plain"]);
        assert_eq!(split.normal[0].egress_policies, vec!["plain", "forward"]);
        assert_eq!(split.untracked[0].ingress_policies, vec!["untracked"]);
        assert_eq!(split.pre_dnat[0].ingress_policies, vec!["pre-dnat"]);
        assert!(split.pre_dnat[0].egress_policies.is_empty());
        assert_eq!(split.forward[0].egress_policies, vec!["forward"]);
    }

    #[test]
    fn test_empty_tiers_dropped() {
        let tiers = vec![FilteredTier {
            name: "t".to_string(),
            policies: vec![filtered("nothing", meta(false, false))],
        }];
        let split = SplitTiers::from_filtered(&tiers);
        assert!(split.normal.is_empty());
        assert!(split.forward.is_empty());
    }

    #[test]
    fn test_message_json_is_type_tagged() {
        let msg = DataplaneMessage::IpSetRemove {
            id: "s:abc".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ip_set_remove");
        assert_eq!(json["id"], "s:abc");
        assert_eq!(msg.message_type(), "ip_set_remove");

        let back: DataplaneMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
