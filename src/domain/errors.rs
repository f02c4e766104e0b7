//! Step-level errors and their aggregation into pipeline-level error state.
//!
//! Errors are deduplicated by `instance_id`, keeping first-seen order, so
//! replaying the same fact any number of times yields the same list.

use serde::{Deserialize, Serialize};

use super::ids::new_error_instance_id;

/// Error code used when a handler panicked or hit an unexpected fault
pub const ERROR_CODE_INTERNAL: &str = "internal";

/// Error code for planning and definition lookup failures
pub const ERROR_CODE_BAD_REQUEST: &str = "bad_request";

/// Error code for step runner failures
pub const ERROR_CODE_EXECUTION: &str = "execution";

/// Error code used when a child pipeline was canceled under a live parent
pub const ERROR_CODE_CANCELED: &str = "canceled";

/// One error reported by a step (or synthesized by the engine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// Unique id of this error occurrence (dedup key)
    pub instance_id: String,

    /// Human-readable message
    pub message: String,

    /// Machine-readable error category
    pub error_code: String,
}

impl StepError {
    /// Create an error with a fresh instance id
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            instance_id: new_error_instance_id(),
            message: message.into(),
            error_code: error_code.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ERROR_CODE_INTERNAL, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ERROR_CODE_EXECUTION, message)
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_code, self.message)
    }
}

/// How a step failure affects its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// The failure fails the pipeline
    #[default]
    Fatal,

    /// The step counts as finished despite carrying errors
    Ignored,
}

/// Merge `incoming` into `target`, skipping errors whose instance id is
/// already present. Returns the number of errors actually added.
pub fn merge_errors<I>(target: &mut Vec<StepError>, incoming: I) -> usize
where
    I: IntoIterator<Item = StepError>,
{
    let mut added = 0;
    for error in incoming {
        if target.iter().any(|e| e.instance_id == error.instance_id) {
            continue;
        }
        target.push(error);
        added += 1;
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(id: &str) -> StepError {
        StepError {
            instance_id: id.to_string(),
            message: format!("failure {}", id),
            error_code: ERROR_CODE_EXECUTION.to_string(),
        }
    }

    #[test]
    fn test_merge_dedups_by_instance_id() {
        let mut errors = vec![error("a")];
        let added = merge_errors(&mut errors, vec![error("a"), error("b"), error("b")]);

        assert_eq!(added, 1);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].instance_id, "a");
        assert_eq!(errors[1].instance_id, "b");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut errors = Vec::new();
        merge_errors(&mut errors, vec![error("x")]);
        merge_errors(&mut errors, vec![error("x")]);
        assert_eq!(errors, vec![error("x")]);
    }

    #[test]
    fn test_failure_mode_default_is_fatal() {
        assert_eq!(FailureMode::default(), FailureMode::Fatal);
        let parsed: FailureMode = serde_json::from_str("\"ignored\"").unwrap();
        assert_eq!(parsed, FailureMode::Ignored);
    }
}
