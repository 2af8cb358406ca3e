//! Packet capture calculator
//!
//! A capture applies to the local workload endpoints matching its selector
//! within the capture's own namespace.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use strata_common::model::{PacketCapture, PacketCaptureKey, WorkloadEndpointKey};
use strata_common::selector::{Selector, SelectorParser};
use strata_common::{Result, NAMESPACE_LABEL};
use tracing::debug;

/// Receives capture output
pub trait CaptureCallbacks {
    /// Register (Some) or withdraw (None) the capture's selector
    fn on_capture_selector(&mut self, key: &PacketCaptureKey, selector: Option<&Selector>) -> Result<()>;

    /// The capture applies to the endpoint, or its spec changed
    fn on_capture_active(
        &mut self,
        key: &PacketCaptureKey,
        endpoint: &WorkloadEndpointKey,
        spec: &PacketCapture,
    ) -> Result<()>;

    /// The capture no longer applies to the endpoint
    fn on_capture_inactive(&mut self, key: &PacketCaptureKey, endpoint: &WorkloadEndpointKey) -> Result<()>;
}

struct CaptureState {
    spec: PacketCapture,
    matches: BTreeSet<WorkloadEndpointKey>,
}

/// Tracks captures and the local endpoints they apply to
pub struct PacketCaptureCalculator {
    parser: Arc<dyn SelectorParser>,
    captures: HashMap<PacketCaptureKey, CaptureState>,
}

/// Restrict a capture selector to its namespace
pub fn namespaced_selector(namespace: &str, selector: &str) -> String {
    let selector = match selector.trim() {
        "" => "all()",
        s => s,
    };
    format!("({selector}) && {NAMESPACE_LABEL} == '{namespace}'")
}

impl PacketCaptureCalculator {
    /// Create an empty calculator
    pub fn new(parser: Arc<dyn SelectorParser>) -> Self {
        Self {
            parser,
            captures: HashMap::new(),
        }
    }

    /// A capture was created, updated or deleted
    pub fn on_capture_update<C: CaptureCallbacks + ?Sized>(
        &mut self,
        key: &PacketCaptureKey,
        spec: Option<&PacketCapture>,
        cb: &mut C,
    ) -> Result<()> {
        let Some(spec) = spec else {
            if let Some(state) = self.captures.remove(key) {
                for ep in &state.matches {
                    cb.on_capture_inactive(key, ep)?;
                }
                cb.on_capture_selector(key, None)?;
            }
            return Ok(());
        };

        let selector_changed = match self.captures.get_mut(key) {
            Some(state) => {
                if state.spec == *spec {
                    return Ok(());
                }
                let changed = state.spec.selector != spec.selector;
                state.spec = spec.clone();
                for ep in &state.matches {
                    cb.on_capture_active(key, ep, &state.spec)?;
                }
                changed
            }
            None => {
                self.captures.insert(
                    key.clone(),
                    CaptureState {
                        spec: spec.clone(),
                        matches: BTreeSet::new(),
                    },
                );
                true
            }
        };
        if selector_changed {
            let selector = self
                .parser
                .parse(&namespaced_selector(&key.namespace, &spec.selector))?;
            debug!(capture = %key, %selector, "capture selector registered");
            cb.on_capture_selector(key, Some(&selector))?;
        }
        Ok(())
    }

    /// A local workload endpoint started matching the capture
    pub fn on_match_started<C: CaptureCallbacks + ?Sized>(
        &mut self,
        key: &PacketCaptureKey,
        endpoint: &WorkloadEndpointKey,
        cb: &mut C,
    ) -> Result<()> {
        let Some(state) = self.captures.get_mut(key) else {
            return Ok(());
        };
        if state.matches.insert(endpoint.clone()) {
            cb.on_capture_active(key, endpoint, &state.spec)?;
        }
        Ok(())
    }

    /// A local workload endpoint stopped matching the capture
    pub fn on_match_stopped<C: CaptureCallbacks + ?Sized>(
        &mut self,
        key: &PacketCaptureKey,
        endpoint: &WorkloadEndpointKey,
        cb: &mut C,
    ) -> Result<()> {
        let Some(state) = self.captures.get_mut(key) else {
            return Ok(());
        };
        if state.matches.remove(endpoint) {
            cb.on_capture_inactive(key, endpoint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::selector::NormalizingParser;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl CaptureCallbacks for Recorder {
        fn on_capture_selector(&mut self, key: &PacketCaptureKey, selector: Option<&Selector>) -> Result<()> {
            match selector {
                Some(s) => self.events.push(format!("sel {} {s}", key.name)),
                None => self.events.push(format!("unsel {}", key.name)),
            }
            Ok(())
        }

        fn on_capture_active(
            &mut self,
            key: &PacketCaptureKey,
            endpoint: &WorkloadEndpointKey,
            spec: &PacketCapture,
        ) -> Result<()> {
            let filter = spec.bpf_filter.as_deref().unwrap_or("-");
            self.events
                .push(format!("+cap {} {} {filter}", key.name, endpoint.workload_id));
            Ok(())
        }

        fn on_capture_inactive(&mut self, key: &PacketCaptureKey, endpoint: &WorkloadEndpointKey) -> Result<()> {
            self.events
                .push(format!("-cap {} {}", key.name, endpoint.workload_id));
            Ok(())
        }
    }

    fn key() -> PacketCaptureKey {
        PacketCaptureKey {
            namespace: "prod".to_string(),
            name: "dump".to_string(),
        }
    }

    fn wep(name: &str) -> WorkloadEndpointKey {
        WorkloadEndpointKey {
            hostname: "node-1".to_string(),
            orchestrator_id: "k8s".to_string(),
            workload_id: name.to_string(),
            endpoint_id: "eth0".to_string(),
        }
    }

    fn spec(selector: &str, filter: Option<&str>) -> PacketCapture {
        PacketCapture {
            selector: selector.to_string(),
            bpf_filter: filter.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_namespaced_selector() {
        assert_eq!(
            namespaced_selector("prod", "app == 'web'"),
            "(app == 'web') && projectcalico.org/namespace == 'prod'"
        );
        assert_eq!(
            namespaced_selector("prod", " "),
            "(all()) && projectcalico.org/namespace == 'prod'"
        );
    }

    #[test]
    fn test_capture_lifecycle() {
        let mut calc = PacketCaptureCalculator::new(Arc::new(NormalizingParser));
        let mut rec = Recorder::default();
        calc.on_capture_update(&key(), Some(&spec("app == 'web'", None)), &mut rec)
            .unwrap();
        calc.on_match_started(&key(), &wep("a"), &mut rec).unwrap();
        calc.on_match_started(&key(), &wep("a"), &mut rec).unwrap();
        calc.on_capture_update(&key(), Some(&spec("app == 'web'", Some("port 53"))), &mut rec)
            .unwrap();
        calc.on_capture_update(&key(), None, &mut rec).unwrap();
        calc.on_match_stopped(&key(), &wep("a"), &mut rec).unwrap();

        assert_eq!(
            rec.events,
            vec![
                "sel dump (app == 'web') && projectcalico.org/namespace == 'prod'",
                "+cap dump a -",
                "+cap dump a port 53",
                "-cap dump a",
                "unsel dump",
            ]
        );
    }

    #[test]
    fn test_selector_change_reregisters() {
        let mut calc = PacketCaptureCalculator::new(Arc::new(NormalizingParser));
        let mut rec = Recorder::default();
        calc.on_capture_update(&key(), Some(&spec("a == 'x'", None)), &mut rec)
            .unwrap();
        calc.on_capture_update(&key(), Some(&spec("a == 'x'", None)), &mut rec)
            .unwrap();
        calc.on_capture_update(&key(), Some(&spec("a == 'y'", None)), &mut rec)
            .unwrap();
        assert_eq!(rec.events.len(), 2);
        assert!(rec.events[1].contains("a == 'y'"));
    }

    #[test]
    fn test_match_for_unknown_capture_ignored() {
        let mut calc = PacketCaptureCalculator::new(Arc::new(NormalizingParser));
        let mut rec = Recorder::default();
        calc.on_match_started(&key(), &wep("a"), &mut rec).unwrap();
        calc.on_match_stopped(&key(), &wep("a"), &mut rec).unwrap();
        assert!(rec.events.is_empty());
    }
}
