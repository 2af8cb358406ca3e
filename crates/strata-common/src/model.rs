//! Datastore update model
//!
//! Every update delivered to the calculation graph is one variant of the
//! closed [`Update`] enum: a typed key plus the new value, or `None` when
//! the object was deleted.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, NAMESPACE_PROFILE_PREFIX, SERVICE_ACCOUNT_PROFILE_PREFIX};

/// Key/value labels attached to endpoints, network sets and profiles
pub type Labels = BTreeMap<String, String>;

// =============================================================================
// Keys
// =============================================================================

/// Identifies a workload (pod/VM) interface
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadEndpointKey {
    /// Node hosting the workload
    pub hostname: String,
    /// Orchestrator that owns the workload (e.g. "k8s")
    pub orchestrator_id: String,
    /// Workload name within the orchestrator
    pub workload_id: String,
    /// Interface name within the workload
    pub endpoint_id: String,
}

impl fmt::Display for WorkloadEndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.hostname, self.orchestrator_id, self.workload_id, self.endpoint_id
        )
    }
}

/// Identifies a host interface
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostEndpointKey {
    /// Node owning the interface
    pub hostname: String,
    /// Endpoint name
    pub endpoint_id: String,
}

impl fmt::Display for HostEndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hostname, self.endpoint_id)
    }
}

/// Either kind of endpoint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKey {
    /// A workload interface
    Workload(WorkloadEndpointKey),
    /// A host interface
    Host(HostEndpointKey),
}

impl EndpointKey {
    /// Node the endpoint lives on
    pub fn hostname(&self) -> &str {
        match self {
            Self::Workload(k) => &k.hostname,
            Self::Host(k) => &k.hostname,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workload(k) => write!(f, "wep:{k}"),
            Self::Host(k) => write!(f, "hep:{k}"),
        }
    }
}

impl From<WorkloadEndpointKey> for EndpointKey {
    fn from(key: WorkloadEndpointKey) -> Self {
        Self::Workload(key)
    }
}

impl From<HostEndpointKey> for EndpointKey {
    fn from(key: HostEndpointKey) -> Self {
        Self::Host(key)
    }
}

/// Identifies a tier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TierKey {
    /// Tier name
    pub name: String,
}

/// Identifies a policy within its tier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyKey {
    /// Owning tier
    pub tier: String,
    /// Policy name, `<namespace>/<name>` for namespaced policies
    pub name: String,
}

impl PolicyKey {
    /// Build a key
    pub fn new(tier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            name: name.into(),
        }
    }

    /// Split the name into its namespace (if any) and short name
    pub fn namespace_and_name(&self) -> Result<(Option<&str>, &str)> {
        let mut parts = self.name.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok((None, name)),
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
                Ok((Some(ns), name))
            }
            _ => Err(Error::malformed_name(
                "policy",
                self.name.clone(),
                "expected <name> or <namespace>/<name>",
            )),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier, self.name)
    }
}

/// Identifies a profile
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProfileKey {
    /// Profile name
    pub name: String,
}

/// What a profile name says about the object it was generated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileOrigin<'a> {
    /// A plain profile
    Plain,
    /// Generated from a Kubernetes namespace
    Namespace(&'a str),
    /// Generated from a Kubernetes service account
    ServiceAccount {
        /// Namespace of the service account
        namespace: &'a str,
        /// Service account name
        name: &'a str,
    },
}

impl ProfileKey {
    /// Build a key
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Classify the profile by its generated-name prefix
    pub fn origin(&self) -> Result<ProfileOrigin<'_>> {
        if let Some(ns) = self.name.strip_prefix(NAMESPACE_PROFILE_PREFIX) {
            if ns.is_empty() {
                return Err(Error::malformed_name(
                    "profile",
                    self.name.clone(),
                    "namespace profile without a namespace",
                ));
            }
            return Ok(ProfileOrigin::Namespace(ns));
        }
        if let Some(rest) = self.name.strip_prefix(SERVICE_ACCOUNT_PROFILE_PREFIX) {
            return match rest.split_once('.') {
                Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                    Ok(ProfileOrigin::ServiceAccount { namespace, name })
                }
                _ => Err(Error::malformed_name(
                    "profile",
                    self.name.clone(),
                    "expected ksa.<namespace>.<name>",
                )),
            };
        }
        Ok(ProfileOrigin::Plain)
    }
}

/// Identifies a network set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkSetKey {
    /// Network set name
    pub name: String,
}

/// Identifies an IP pool by its CIDR
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IpPoolKey {
    /// Pool CIDR
    pub cidr: IpNet,
}

impl IpPoolKey {
    /// Dataplane id of the pool: the CIDR with `/` replaced by `-`
    pub fn pool_id(&self) -> String {
        self.cidr.to_string().replace('/', "-")
    }
}

/// Identifies the host IP of a node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostIpKey {
    /// Node name
    pub hostname: String,
}

/// Identifies a Kubernetes service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Service namespace
    pub namespace: String,
    /// Service name
    pub name: String,
}

/// Identifies a packet capture
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PacketCaptureKey {
    /// Namespace the capture is scoped to
    pub namespace: String,
    /// Capture name
    pub name: String,
}

impl fmt::Display for PacketCaptureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identifies a configuration parameter
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    /// Applies to every node
    Global {
        /// Parameter name
        name: String,
    },
    /// Applies to one node
    Host {
        /// Node name
        hostname: String,
        /// Parameter name
        name: String,
    },
}

// =============================================================================
// Values
// =============================================================================

/// A workload interface
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadEndpoint {
    /// Administrative state ("active", ...)
    pub state: String,
    /// Host-side interface name
    pub name: String,
    /// Interface MAC address
    pub mac: Option<String>,
    /// Profiles applied to this endpoint, in order
    pub profile_ids: Vec<String>,
    /// IPv4 addresses
    pub ipv4_nets: Vec<IpNet>,
    /// IPv6 addresses
    pub ipv6_nets: Vec<IpNet>,
    /// Endpoint labels
    pub labels: Labels,
    /// Egress gateway selector set directly on the endpoint
    pub egress_selector: Option<String>,
}

impl WorkloadEndpoint {
    /// All addresses, IPv4 first
    pub fn nets(&self) -> impl Iterator<Item = &IpNet> {
        self.ipv4_nets.iter().chain(self.ipv6_nets.iter())
    }
}

/// A host interface
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostEndpoint {
    /// Interface name, or None for all interfaces
    pub name: Option<String>,
    /// Expected IPv4 addresses
    pub expected_ipv4_addrs: Vec<IpAddr>,
    /// Expected IPv6 addresses
    pub expected_ipv6_addrs: Vec<IpAddr>,
    /// Profiles applied to this endpoint, in order
    pub profile_ids: Vec<String>,
    /// Endpoint labels
    pub labels: Labels,
}

impl HostEndpoint {
    /// Expected addresses as host-length networks
    pub fn nets(&self) -> Vec<IpNet> {
        self.expected_ipv4_addrs
            .iter()
            .chain(self.expected_ipv6_addrs.iter())
            .map(|addr| IpNet::from(*addr))
            .collect()
    }
}

/// Either kind of endpoint value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// A workload interface
    Workload(WorkloadEndpoint),
    /// A host interface
    Host(HostEndpoint),
}

impl Endpoint {
    /// Profiles applied to the endpoint
    pub fn profile_ids(&self) -> &[String] {
        match self {
            Self::Workload(ep) => &ep.profile_ids,
            Self::Host(ep) => &ep.profile_ids,
        }
    }

    /// Endpoint labels
    pub fn labels(&self) -> &Labels {
        match self {
            Self::Workload(ep) => &ep.labels,
            Self::Host(ep) => &ep.labels,
        }
    }

    /// Addresses of the endpoint
    pub fn nets(&self) -> Vec<IpNet> {
        match self {
            Self::Workload(ep) => ep.nets().copied().collect(),
            Self::Host(ep) => ep.nets(),
        }
    }
}

/// A tier of policies
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tier {
    /// Sort order; None sorts last
    pub order: Option<f64>,
}

/// Direction a policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    /// Traffic towards the endpoint
    Ingress,
    /// Traffic from the endpoint
    Egress,
}

/// A tiered network policy
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Sort order within the tier; None sorts last
    pub order: Option<f64>,
    /// Endpoints the policy applies to
    pub selector: String,
    /// Ingress rules
    pub inbound_rules: Vec<Rule>,
    /// Egress rules
    pub outbound_rules: Vec<Rule>,
    /// Applies in the untracked (raw) table
    pub do_not_track: bool,
    /// Applies before DNAT
    pub pre_dnat: bool,
    /// Applies to forwarded traffic
    pub apply_on_forward: bool,
    /// Declared types; empty means inferred from the rules
    pub types: Vec<PolicyType>,
}

impl Policy {
    /// Whether the policy governs ingress traffic
    pub fn governs_ingress(&self) -> bool {
        self.types.is_empty() || self.types.contains(&PolicyType::Ingress)
    }

    /// Whether the policy governs egress traffic
    pub fn governs_egress(&self) -> bool {
        if self.types.is_empty() {
            !self.outbound_rules.is_empty()
        } else {
            self.types.contains(&PolicyType::Egress)
        }
    }
}

/// What a rule does with matching traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Accept the packet
    #[default]
    Allow,
    /// Drop the packet
    Deny,
    /// Skip to the next tier
    Pass,
    /// Log and continue
    Log,
}

impl RuleAction {
    /// Lowercase name used in logging prefixes and lookups
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Pass => "pass",
            Self::Log => "log",
        }
    }
}

/// One policy or profile rule
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    /// Action taken on match
    pub action: RuleAction,
    /// Protocol name ("tcp", "udp", ...)
    pub protocol: Option<String>,
    /// Source CIDRs
    pub src_nets: Vec<IpNet>,
    /// Destination CIDRs
    pub dst_nets: Vec<IpNet>,
    /// Source ports
    pub src_ports: Vec<u16>,
    /// Destination ports
    pub dst_ports: Vec<u16>,
    /// Source endpoints must match this selector
    pub src_selector: Option<String>,
    /// Destination endpoints must match this selector
    pub dst_selector: Option<String>,
    /// Source endpoints must not match this selector
    pub not_src_selector: Option<String>,
    /// Destination endpoints must not match this selector
    pub not_dst_selector: Option<String>,
}

/// A profile: rules, inherited labels and egress gateway selection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Ingress rules
    pub inbound_rules: Vec<Rule>,
    /// Egress rules
    pub outbound_rules: Vec<Rule>,
    /// Labels inherited by endpoints using the profile
    pub labels: Labels,
    /// Egress gateway selector inherited by endpoints without their own
    pub egress_selector: Option<String>,
}

/// IP-in-IP / VXLAN encapsulation mode of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncapMode {
    /// No encapsulation
    #[default]
    Never,
    /// Always encapsulate
    Always,
    /// Encapsulate only across subnets
    CrossSubnet,
}

/// An IP address pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPool {
    /// Pool CIDR
    pub cidr: IpNet,
    /// NAT outgoing traffic from the pool
    #[serde(default)]
    pub masquerade: bool,
    /// IP-in-IP mode
    #[serde(default)]
    pub ipip_mode: EncapMode,
    /// VXLAN mode
    #[serde(default)]
    pub vxlan_mode: EncapMode,
}

/// A labelled set of CIDRs
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSet {
    /// Member CIDRs
    pub nets: Vec<IpNet>,
    /// Labels
    pub labels: Labels,
}

/// One port of a Kubernetes service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Port name
    #[serde(default)]
    pub name: Option<String>,
    /// Protocol ("TCP", "UDP", "SCTP")
    #[serde(default = "default_service_protocol")]
    pub protocol: String,
    /// Service port
    pub port: u16,
    /// Node port, if allocated
    #[serde(default)]
    pub node_port: Option<u16>,
}

fn default_service_protocol() -> String {
    "TCP".to_string()
}

impl ServicePort {
    /// Whether the port carries TCP
    pub fn is_tcp(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("tcp")
    }
}

/// A Kubernetes service
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeService {
    /// Cluster IPs
    pub cluster_ips: Vec<IpAddr>,
    /// External IPs
    pub external_ips: Vec<IpAddr>,
    /// Ports
    pub ports: Vec<ServicePort>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
}

/// A packet capture request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketCapture {
    /// Workloads to capture on, within the capture's namespace
    pub selector: String,
    /// Optional BPF filter expression
    pub bpf_filter: Option<String>,
    /// Capture start time (RFC 3339)
    pub start_time: Option<String>,
    /// Capture end time (RFC 3339)
    pub end_time: Option<String>,
}

// =============================================================================
// Updates
// =============================================================================

/// One datastore change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Update {
    /// Workload endpoint created, updated or deleted
    WorkloadEndpoint {
        /// Endpoint key
        key: WorkloadEndpointKey,
        /// New value, None on delete
        value: Option<WorkloadEndpoint>,
    },
    /// Host endpoint created, updated or deleted
    HostEndpoint {
        /// Endpoint key
        key: HostEndpointKey,
        /// New value, None on delete
        value: Option<HostEndpoint>,
    },
    /// Tier created, updated or deleted
    Tier {
        /// Tier key
        key: TierKey,
        /// New value, None on delete
        value: Option<Tier>,
    },
    /// Policy created, updated or deleted
    Policy {
        /// Policy key
        key: PolicyKey,
        /// New value, None on delete
        value: Option<Policy>,
    },
    /// Profile created, updated or deleted
    Profile {
        /// Profile key
        key: ProfileKey,
        /// New value, None on delete
        value: Option<Profile>,
    },
    /// Node host IP set or cleared
    HostIp {
        /// Node key
        key: HostIpKey,
        /// New address, None on delete
        value: Option<IpAddr>,
    },
    /// IP pool created, updated or deleted
    IpPool {
        /// Pool key
        key: IpPoolKey,
        /// New value, None on delete
        value: Option<IpPool>,
    },
    /// Network set created, updated or deleted
    NetworkSet {
        /// Network set key
        key: NetworkSetKey,
        /// New value, None on delete
        value: Option<NetworkSet>,
    },
    /// Kubernetes service created, updated or deleted
    KubeService {
        /// Service key
        key: ServiceKey,
        /// New value, None on delete
        value: Option<KubeService>,
    },
    /// Packet capture created, updated or deleted
    PacketCapture {
        /// Capture key
        key: PacketCaptureKey,
        /// New value, None on delete
        value: Option<PacketCapture>,
    },
    /// Configuration parameter set or cleared
    Config {
        /// Parameter key
        key: ConfigKey,
        /// New raw value, None on delete
        value: Option<String>,
    },
}

impl Update {
    /// Short kind label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkloadEndpoint { .. } => "workload_endpoint",
            Self::HostEndpoint { .. } => "host_endpoint",
            Self::Tier { .. } => "tier",
            Self::Policy { .. } => "policy",
            Self::Profile { .. } => "profile",
            Self::HostIp { .. } => "host_ip",
            Self::IpPool { .. } => "ip_pool",
            Self::NetworkSet { .. } => "network_set",
            Self::KubeService { .. } => "kube_service",
            Self::PacketCapture { .. } => "packet_capture",
            Self::Config { .. } => "config",
        }
    }

    /// Whether the update deletes its key
    pub fn is_delete(&self) -> bool {
        match self {
            Self::WorkloadEndpoint { value, .. } => value.is_none(),
            Self::HostEndpoint { value, .. } => value.is_none(),
            Self::Tier { value, .. } => value.is_none(),
            Self::Policy { value, .. } => value.is_none(),
            Self::Profile { value, .. } => value.is_none(),
            Self::HostIp { value, .. } => value.is_none(),
            Self::IpPool { value, .. } => value.is_none(),
            Self::NetworkSet { value, .. } => value.is_none(),
            Self::KubeService { value, .. } => value.is_none(),
            Self::PacketCapture { value, .. } => value.is_none(),
            Self::Config { value, .. } => value.is_none(),
        }
    }
}
