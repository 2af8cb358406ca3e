//! Seam to the external label-match index
//!
//! The index evaluates selectors against labelled items and reports when a
//! (selector, item) pair starts or stops matching. It appends those events
//! to a caller-provided buffer; the graph drains the buffer before the
//! current update returns.

use serde::{Deserialize, Serialize};
use strata_common::model::{EndpointKey, Labels, NetworkSetKey, PacketCaptureKey, PolicyKey};
use strata_common::selector::Selector;

/// What a registered selector is used for
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTarget {
    /// Members of an IP set
    IpSet(String),
    /// Endpoints a policy applies to
    Policy(PolicyKey),
    /// Workloads a packet capture runs on
    PacketCapture(PacketCaptureKey),
}

/// Something carrying labels
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelledItem {
    /// A workload or host endpoint
    Endpoint(EndpointKey),
    /// A network set
    NetworkSet(NetworkSetKey),
}

/// A flip in match state for one (selector, item) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchEvent {
    /// The item now matches
    Started {
        /// Selector owner
        target: MatchTarget,
        /// Matching item
        item: LabelledItem,
    },
    /// The item no longer matches
    Stopped {
        /// Selector owner
        target: MatchTarget,
        /// Previously matching item
        item: LabelledItem,
    },
}

/// Label-match index capability
#[cfg_attr(test, mockall::automock)]
pub trait LabelIndex: Send {
    /// Register or replace the selector for `target`
    fn update_selector(
        &mut self,
        target: MatchTarget,
        selector: &Selector,
        events: &mut Vec<MatchEvent>,
    );

    /// Remove the selector for `target`
    fn delete_selector(&mut self, target: &MatchTarget, events: &mut Vec<MatchEvent>);

    /// Set an item's own labels and its ordered parents
    fn update_labels(
        &mut self,
        item: LabelledItem,
        labels: &Labels,
        parents: &[String],
        events: &mut Vec<MatchEvent>,
    );

    /// Forget an item
    fn delete_labels(&mut self, item: &LabelledItem, events: &mut Vec<MatchEvent>);

    /// Set labels inherited by items naming `parent`
    fn update_parent_labels(&mut self, parent: &str, labels: &Labels, events: &mut Vec<MatchEvent>);

    /// Forget a parent's labels
    fn delete_parent_labels(&mut self, parent: &str, events: &mut Vec<MatchEvent>);
}

/// Index that never reports matches
///
/// Used when match events are delivered as explicit inputs instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveLabelIndex;

impl LabelIndex for PassiveLabelIndex {
    fn update_selector(&mut self, _: MatchTarget, _: &Selector, _: &mut Vec<MatchEvent>) {}

    fn delete_selector(&mut self, _: &MatchTarget, _: &mut Vec<MatchEvent>) {}

    fn update_labels(&mut self, _: LabelledItem, _: &Labels, _: &[String], _: &mut Vec<MatchEvent>) {}

    fn delete_labels(&mut self, _: &LabelledItem, _: &mut Vec<MatchEvent>) {}

    fn update_parent_labels(&mut self, _: &str, _: &Labels, _: &mut Vec<MatchEvent>) {}

    fn delete_parent_labels(&mut self, _: &str, _: &mut Vec<MatchEvent>) {}
}
