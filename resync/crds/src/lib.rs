pub mod v1beta1;

/// Annotation watched by the external-secrets controller. Setting it to a
/// fresh value makes the controller re-run reconciliation for the resource
/// outside its regular refresh schedule.
pub const FORCE_SYNC_ANNOTATION: &str = "force-sync";

/// Condition type carrying the readiness verdict of the latest
/// reconciliation attempt.
pub const READY_CONDITION: &str = "Ready";
