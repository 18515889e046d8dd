//! Metrics emitted through the `metrics` facade.
//!
//! Nothing is exported unless the embedding application installs a recorder;
//! without one every call here is a no-op.

pub mod counters;
pub mod histograms;
pub mod labels;
