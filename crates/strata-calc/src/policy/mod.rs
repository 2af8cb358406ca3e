//! Policy ordering
//!
//! The sorter keeps the global tier and policy order; the resolver
//! intersects it with each local endpoint's matched policies.

pub mod resolver;
pub mod sorter;

pub use resolver::{FilteredPolicy, FilteredTier, PolicyResolver, PolicyResolverCallbacks};
pub use sorter::{compare_order, PolicyMeta, PolicySorter, SortedTier};
