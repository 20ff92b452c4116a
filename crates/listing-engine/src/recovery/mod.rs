//! Timer-driven passes that correct state no single worker can be trusted
//! to have left consistent.

pub mod reaper;
pub mod reconciler;

pub use reaper::{ReapReport, StaleJobReaper};
pub use reconciler::{PhaseReconciler, ReconcileReport};
