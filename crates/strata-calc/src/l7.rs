//! Transparent-proxy service IP sets
//!
//! Services selected for L7 processing contribute their TCP service
//! addresses to `tproxy-services` and their TCP node ports to
//! `tproxy-nodeports`. Both sets exist for as long as the calculator does.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use strata_common::config::TproxyMode;
use strata_common::model::{KubeService, ServiceKey};
use strata_common::Result;
use tracing::debug;

use crate::ipsets::{
    AddressFamily, IpSetCallbacks, IpSetData, IpSetKind, IpSetMember, MemberCallbacks, Protocol,
};
use crate::refcount::RefCountRegistry;

/// IP set of proxied service address/port pairs
pub const TPROXY_SERVICES_IP_SET: &str = "tproxy-services";

/// IP set of proxied node ports
pub const TPROXY_NODEPORTS_IP_SET: &str = "tproxy-nodeports";

/// Service annotation opting a service into L7 logging
pub const L7_LOGGING_ANNOTATION: &str = "projectcalico.org/l7-logging";

#[derive(Debug, Default, Clone, PartialEq)]
struct ServiceMembers {
    services: BTreeSet<IpSetMember>,
    node_ports: BTreeSet<IpSetMember>,
}

/// Maintains the tproxy IP sets from Kubernetes services
#[derive(Debug)]
pub struct L7ServiceCalculator {
    all_services: bool,
    services: HashMap<ServiceKey, ServiceMembers>,
    service_members: RefCountRegistry<IpSetMember, ()>,
    node_port_members: RefCountRegistry<IpSetMember, ()>,
}

impl L7ServiceCalculator {
    /// Create a calculator; None when the mode disables tproxy
    pub fn new(mode: TproxyMode) -> Option<Self> {
        let all_services = match mode {
            TproxyMode::Disabled => return None,
            TproxyMode::Enabled => false,
            TproxyMode::EnabledAllServices => true,
        };
        Some(Self {
            all_services,
            services: HashMap::new(),
            service_members: RefCountRegistry::new("tproxy-services"),
            node_port_members: RefCountRegistry::new("tproxy-nodeports"),
        })
    }

    /// The two IP sets this calculator owns
    pub fn ip_sets() -> [IpSetData; 2] {
        [
            IpSetData {
                id: TPROXY_SERVICES_IP_SET.to_string(),
                kind: IpSetKind::IpAndPort,
                selector: None,
            },
            IpSetData {
                id: TPROXY_NODEPORTS_IP_SET.to_string(),
                kind: IpSetKind::Ports,
                selector: None,
            },
        ]
    }

    /// Announce the calculator's IP sets
    pub fn start<C: IpSetCallbacks + ?Sized>(&self, cb: &mut C) -> Result<()> {
        for data in Self::ip_sets() {
            cb.on_ip_set_active(&data)?;
        }
        Ok(())
    }

    /// A Kubernetes service changed
    pub fn on_service_update<C: MemberCallbacks + ?Sized>(
        &mut self,
        key: &ServiceKey,
        service: Option<&KubeService>,
        cb: &mut C,
    ) -> Result<()> {
        let new = service
            .filter(|svc| self.selected(svc))
            .map(members_of)
            .unwrap_or_default();
        let old = self.services.remove(key).unwrap_or_default();
        if new == old {
            if new != ServiceMembers::default() {
                self.services.insert(key.clone(), new);
            }
            return Ok(());
        }
        debug!(
            service = %format!("{}/{}", key.namespace, key.name),
            members = new.services.len() + new.node_ports.len(),
            "tproxy service members changed"
        );

        for member in new.services.difference(&old.services) {
            if self.service_members.inc_ref(member, |_| Ok(()), &mut ())? {
                cb.on_member_added(TPROXY_SERVICES_IP_SET, member.clone())?;
            }
        }
        for member in new.node_ports.difference(&old.node_ports) {
            if self.node_port_members.inc_ref(member, |_| Ok(()), &mut ())? {
                cb.on_member_added(TPROXY_NODEPORTS_IP_SET, member.clone())?;
            }
        }
        for member in old.services.difference(&new.services) {
            if self.service_members.dec_ref(member, &mut ())? {
                cb.on_member_removed(TPROXY_SERVICES_IP_SET, member.clone())?;
            }
        }
        for member in old.node_ports.difference(&new.node_ports) {
            if self.node_port_members.dec_ref(member, &mut ())? {
                cb.on_member_removed(TPROXY_NODEPORTS_IP_SET, member.clone())?;
            }
        }

        if new != ServiceMembers::default() {
            self.services.insert(key.clone(), new);
        }
        Ok(())
    }

    fn selected(&self, service: &KubeService) -> bool {
        self.all_services
            || service
                .annotations
                .get(L7_LOGGING_ANNOTATION)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

fn members_of(service: &KubeService) -> ServiceMembers {
    let mut members = ServiceMembers::default();
    let addrs: Vec<IpAddr> = service
        .cluster_ips
        .iter()
        .chain(&service.external_ips)
        .copied()
        .collect();
    for port in service.ports.iter().filter(|p| p.is_tcp()) {
        for addr in &addrs {
            members.services.insert(IpSetMember::IpAndPort {
                addr: *addr,
                protocol: Protocol::Tcp,
                port: port.port,
            });
        }
        if let Some(node_port) = port.node_port {
            for family in [AddressFamily::V4, AddressFamily::V6] {
                members.node_ports.insert(IpSetMember::Port {
                    family,
                    protocol: Protocol::Tcp,
                    port: node_port,
                });
            }
        }
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use strata_common::model::ServicePort;

    #[derive(Default)]
    struct Members {
        sets: BTreeMap<String, BTreeSet<String>>,
        events: usize,
    }

    impl MemberCallbacks for Members {
        fn on_member_added(&mut self, set_id: &str, member: IpSetMember) -> Result<()> {
            assert!(self
                .sets
                .entry(set_id.to_string())
                .or_default()
                .insert(member.to_string()));
            self.events += 1;
            Ok(())
        }

        fn on_member_removed(&mut self, set_id: &str, member: IpSetMember) -> Result<()> {
            assert!(self
                .sets
                .entry(set_id.to_string())
                .or_default()
                .remove(&member.to_string()));
            self.events += 1;
            Ok(())
        }
    }

    fn key(name: &str) -> ServiceKey {
        ServiceKey {
            namespace: "default".to_string(),
            name: name.to_string(),
        }
    }

    fn service(ip: &str, annotated: bool, ports: Vec<ServicePort>) -> KubeService {
        let mut annotations = BTreeMap::new();
        if annotated {
            annotations.insert(L7_LOGGING_ANNOTATION.to_string(), "true".to_string());
        }
        KubeService {
            cluster_ips: vec![ip.parse().unwrap()],
            ports,
            annotations,
            ..Default::default()
        }
    }

    fn port(protocol: &str, port: u16, node_port: Option<u16>) -> ServicePort {
        ServicePort {
            name: None,
            protocol: protocol.to_string(),
            port,
            node_port,
        }
    }

    fn members(m: &Members, set: &str) -> Vec<String> {
        m.sets.get(set).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    #[test]
    fn test_disabled_mode_has_no_calculator() {
        assert!(L7ServiceCalculator::new(TproxyMode::Disabled).is_none());
    }

    #[test]
    fn test_only_annotated_tcp_ports_in_enabled_mode() {
        let mut calc = L7ServiceCalculator::new(TproxyMode::Enabled).unwrap();
        let mut m = Members::default();
        calc.on_service_update(
            &key("plain"),
            Some(&service("10.96.0.1", false, vec![port("TCP", 80, None)])),
            &mut m,
        )
        .unwrap();
        calc.on_service_update(
            &key("web"),
            Some(&service(
                "10.96.0.2",
                true,
                vec![port("TCP", 443, Some(30443)), port("UDP", 53, Some(30053))],
            )),
            &mut m,
        )
        .unwrap();
        assert_eq!(members(&m, TPROXY_SERVICES_IP_SET), vec!["10.96.0.2,tcp:443"]);
        assert_eq!(
            members(&m, TPROXY_NODEPORTS_IP_SET),
            vec!["v4,tcp:30443", "v6,tcp:30443"]
        );
    }

    #[test]
    fn test_all_services_mode() {
        let mut calc = L7ServiceCalculator::new(TproxyMode::EnabledAllServices).unwrap();
        let mut m = Members::default();
        calc.on_service_update(
            &key("plain"),
            Some(&service("10.96.0.1", false, vec![port("tcp", 80, None)])),
            &mut m,
        )
        .unwrap();
        assert_eq!(members(&m, TPROXY_SERVICES_IP_SET), vec!["10.96.0.1,tcp:80"]);
    }

    #[test]
    fn test_shared_node_port_refcounted() {
        let mut calc = L7ServiceCalculator::new(TproxyMode::EnabledAllServices).unwrap();
        let mut m = Members::default();
        let a = service("10.96.0.1", false, vec![port("TCP", 80, Some(30080))]);
        let b = service("10.96.0.2", false, vec![port("TCP", 80, Some(30080))]);
        calc.on_service_update(&key("a"), Some(&a), &mut m).unwrap();
        calc.on_service_update(&key("b"), Some(&b), &mut m).unwrap();
        calc.on_service_update(&key("a"), None, &mut m).unwrap();
        assert_eq!(
            members(&m, TPROXY_NODEPORTS_IP_SET),
            vec!["v4,tcp:30080", "v6,tcp:30080"]
        );
        assert_eq!(members(&m, TPROXY_SERVICES_IP_SET), vec!["10.96.0.2,tcp:80"]);

        let events = m.events;
        calc.on_service_update(&key("b"), Some(&b), &mut m).unwrap();
        assert_eq!(m.events, events);
    }

    #[test]
    fn test_annotation_removal_withdraws_members() {
        let mut calc = L7ServiceCalculator::new(TproxyMode::Enabled).unwrap();
        let mut m = Members::default();
        calc.on_service_update(
            &key("web"),
            Some(&service("10.96.0.2", true, vec![port("TCP", 443, None)])),
            &mut m,
        )
        .unwrap();
        calc.on_service_update(
            &key("web"),
            Some(&service("10.96.0.2", false, vec![port("TCP", 443, None)])),
            &mut m,
        )
        .unwrap();
        assert!(members(&m, TPROXY_SERVICES_IP_SET).is_empty());
    }
}
