//! Authentication mechanisms

pub mod scram;

pub use scram::{ScramClient, ScramError, ScramState};
