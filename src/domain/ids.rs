//! Identifier generation.
//!
//! Ids are prefixed strings so that a raw fact log stays readable:
//! `exec_…` for executions, `pexec_…` for pipeline executions and
//! `sexec_…` for step executions.

use uuid::Uuid;

/// New id for a top-level execution
pub fn new_execution_id() -> String {
    format!("exec_{}", Uuid::new_v4().simple())
}

/// New id for one run of one pipeline (root or nested)
pub fn new_pipeline_execution_id() -> String {
    format!("pexec_{}", Uuid::new_v4().simple())
}

/// New id for one attempt of one step
pub fn new_step_execution_id() -> String {
    format!("sexec_{}", Uuid::new_v4().simple())
}

/// New id for a single error instance
pub fn new_error_instance_id() -> String {
    format!("err_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes() {
        assert!(new_execution_id().starts_with("exec_"));
        assert!(new_pipeline_execution_id().starts_with("pexec_"));
        assert!(new_step_execution_id().starts_with("sexec_"));
        assert!(new_error_instance_id().starts_with("err_"));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(new_step_execution_id(), new_step_execution_id());
    }
}
