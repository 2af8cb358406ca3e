//! Strata calculation graph
//!
//! Turns a stream of datastore updates into the minimal, correctly ordered
//! set of messages a node-local dataplane needs to enforce policy.
//!
//! # Modules
//!
//! - [`graph`] - Dispatches updates and wires the calculators together
//! - [`active_rules`] - Which policies and profiles are in use locally
//! - [`rule_scanner`] - Rewrites rule selectors into IP set references
//! - [`ipsets`] - IP set membership from selector matches
//! - [`policy`] - Tier and policy ordering per local endpoint
//! - [`egress`] - Egress gateway IP sets
//! - [`routes`] - Workload routes
//! - [`bindings`] - IPsec tunnel bindings and blacklist
//! - [`capture`] - Packet captures on local workloads
//! - [`l7`] - Transparent-proxy service IP sets
//! - [`config_batcher`] - Datastore configuration batching
//! - [`sequencer`] - Coalescing and ordering of dataplane messages
//! - [`lookups`] - Address and NFLOG prefix caches for other threads
//! - [`async_graph`] - Running the graph on a tokio task

#![deny(missing_docs)]

pub mod active_rules;
pub mod async_graph;
pub mod bindings;
pub mod capture;
pub mod config_batcher;
pub mod egress;
pub mod graph;
pub mod ipsets;
pub mod l7;
pub mod labels;
pub mod lookups;
pub mod lpm;
pub mod policy;
pub mod refcount;
pub mod routes;
pub mod rule_scanner;
pub mod sequencer;

#[cfg(test)]
mod testutil;

pub use graph::{CalcGraph, GraphConfig, GraphInput};
pub use sequencer::{DataplaneMessage, DataplaneSink, EventSequencer};
