//! Observation: container runtime inspection, kernel telemetry documents,
//! and the per-cycle host summary.

pub mod containers;
pub mod host;
pub mod telemetry;
