//! Planning decisions.
//!
//! Everything here is a pure function of the current aggregate and the
//! pipeline definition: it decides which commands to issue next but never
//! touches the log. The dispatch layer records whatever these return.

use serde_json::{json, Map, Value};

use crate::domain::events::{PipelineFail, PipelineFinish, PipelinePlan, StepForEachPlan, StepQueue};
use crate::domain::ids::new_step_execution_id;
use crate::domain::{Command, FailureMode, PipelineExecution, StepExecution, StepForEach, StepInput, StepLoop, StepOutput, StepRetry};

use super::dispatch::DispatchError;
use super::pipeline::{PipelineDefinition, StepDefinition};

/// Steps whose dependencies are all complete and that were never planned.
///
/// Nothing is eligible while the pipeline is not running or already
/// carries failures.
pub fn eligible_steps(pe: &PipelineExecution, definition: &PipelineDefinition) -> Vec<String> {
    if !pe.is_runnable() || pe.has_failures() {
        return Vec::new();
    }

    definition
        .steps
        .iter()
        .filter(|step| !pe.is_step_planned(&step.name))
        .filter(|step| step.depends_on.iter().all(|dep| pe.is_step_complete(dep)))
        .map(|step| step.name.clone())
        .collect()
}

/// React to a `pipeline_planned` fact.
///
/// A non-empty step list queues each step (or plans its fan-out); an empty
/// list re-checks completion and finishes or fails the pipeline once every
/// planned step reports full progress.
pub fn plan(pe: &PipelineExecution, definition: &PipelineDefinition, next_steps: &[String]) -> Result<Vec<Command>, DispatchError> {
    if !pe.is_runnable() {
        return Ok(Vec::new());
    }

    if next_steps.is_empty() {
        return Ok(recheck(pe).into_iter().collect());
    }

    let mut commands = Vec::with_capacity(next_steps.len());
    for name in next_steps {
        let step = step_definition(definition, name)?;
        if step.is_for_each() {
            commands.push(
                StepForEachPlan {
                    pipeline_execution_id: pe.id.clone(),
                    step_name: step.name.clone(),
                }
                .into(),
            );
        } else {
            commands.push(first_attempt(pe, step, None).into());
        }
    }
    Ok(commands)
}

/// Steps that were planned but never reached a queued attempt.
///
/// A `pipeline_planned` or `step_for_each_planned` fact handled while the
/// pipeline was paused leaves its steps with no status entries or with
/// only initializing ones. Resuming issues their first attempts again.
pub fn stalled_steps(pe: &PipelineExecution, definition: &PipelineDefinition) -> Result<Vec<Command>, DispatchError> {
    if !pe.is_runnable() {
        return Ok(Vec::new());
    }

    let mut commands = Vec::new();
    for (name, keys) in &pe.step_status {
        if !keys.values().all(|status| status.initializing) {
            continue;
        }
        let step = step_definition(definition, name)?;
        if step.is_for_each() {
            commands.push(
                StepForEachPlan {
                    pipeline_execution_id: pe.id.clone(),
                    step_name: step.name.clone(),
                }
                .into(),
            );
        } else {
            commands.push(first_attempt(pe, step, None).into());
        }
    }
    Ok(commands)
}

/// Completion check: `None` means keep waiting
pub fn recheck(pe: &PipelineExecution) -> Option<Command> {
    if !pe.all_steps_complete() {
        return None;
    }

    if pe.has_failures() {
        Some(
            PipelineFail {
                pipeline_execution_id: pe.id.clone(),
                errors: pe.errors.clone(),
            }
            .into(),
        )
    } else {
        Some(
            PipelineFinish {
                pipeline_execution_id: pe.id.clone(),
            }
            .into(),
        )
    }
}

/// React to a `step_for_each_planned` fact
pub fn plan_for_each(pe: &PipelineExecution, definition: &PipelineDefinition, step_name: &str, items: &[StepForEach]) -> Result<Vec<Command>, DispatchError> {
    if !pe.is_runnable() {
        return Ok(Vec::new());
    }

    if items.is_empty() {
        return Ok(vec![PipelinePlan {
            pipeline_execution_id: pe.id.clone(),
        }
        .into()]);
    }

    let step = step_definition(definition, step_name)?;
    Ok(items
        .iter()
        .map(|item| first_attempt(pe, step, Some(item.clone())).into())
        .collect())
}

/// React to a `step_finished` fact: retry, loop again, or re-plan
pub fn after_step_finished(
    pe: &PipelineExecution,
    definition: &PipelineDefinition,
    finished: &StepExecution,
    step_loop: Option<StepLoop>,
    step_retry: Option<StepRetry>,
) -> Result<Vec<Command>, DispatchError> {
    if pe.is_terminal() {
        return Ok(Vec::new());
    }

    let step = step_definition(definition, &finished.name)?;

    if let Some(retry) = step_retry.filter(|r| !r.retry_completed) {
        let next_attempt = retry.attempt + 1;
        let delay_ms = step
            .retry
            .as_ref()
            .map(|policy| policy.delay_for_attempt(retry.attempt).as_millis() as u64)
            .unwrap_or(0);

        return Ok(vec![StepQueue {
            pipeline_execution_id: pe.id.clone(),
            step_execution_id: new_step_execution_id(),
            step_name: step.name.clone(),
            step_input: finished.input.clone(),
            step_for_each: finished.step_for_each.clone(),
            step_loop: finished.step_loop.map(|l| StepLoop {
                loop_completed: false,
                ..l
            }),
            step_retry: Some(StepRetry {
                attempt: next_attempt,
                retry_completed: false,
            }),
            delay_ms,
        }
        .into()]);
    }

    if let Some(lp) = step_loop.filter(|l| !l.loop_completed) {
        let iteration = lp.iteration + 1;
        return Ok(vec![StepQueue {
            pipeline_execution_id: pe.id.clone(),
            step_execution_id: new_step_execution_id(),
            step_name: step.name.clone(),
            step_input: step_input(step, finished.step_for_each.as_ref(), Some(iteration)),
            step_for_each: finished.step_for_each.clone(),
            step_loop: Some(StepLoop {
                iteration,
                loop_completed: false,
            }),
            step_retry: initial_retry(step),
            delay_ms: 0,
        }
        .into()]);
    }

    Ok(vec![PipelinePlan {
        pipeline_execution_id: pe.id.clone(),
    }
    .into()])
}

/// Decide loop and retry continuation for a finished attempt.
///
/// Only a fatal failure is retried. A failed attempt ends its loop.
pub fn continuation(
    step: &StepDefinition,
    step_loop: Option<StepLoop>,
    step_retry: Option<StepRetry>,
    output: &StepOutput,
) -> (Option<StepLoop>, Option<StepRetry>) {
    let failed = output.has_errors() && step.failure_mode == FailureMode::Fatal;

    let retry = step.retry.as_ref().map(|policy| {
        let attempt = step_retry.map(|r| r.attempt).unwrap_or(1);
        StepRetry {
            attempt,
            retry_completed: !(failed && policy.should_retry(attempt)),
        }
    });

    let lp = step.loop_config.as_ref().map(|config| {
        let iteration = step_loop.map(|l| l.iteration).unwrap_or(0);
        StepLoop {
            iteration,
            loop_completed: failed || config.is_completed(iteration, &output.output_variables),
        }
    });

    (lp, retry)
}

/// Runner input for one attempt: the declared input plus fan-out and loop context
pub fn step_input(step: &StepDefinition, for_each: Option<&StepForEach>, iteration: Option<u32>) -> StepInput {
    let mut input = step.input.clone();
    if let Some(item) = for_each {
        input.insert("each".to_string(), json!({"key": item.key, "value": item.value}));
    }
    if let Some(iteration) = iteration {
        input.insert("loop_index".to_string(), Value::from(iteration));
    }
    input
}

/// Arguments for a child pipeline launched by a `pipeline` step
pub fn child_args(step: &StepDefinition, input: &StepInput) -> Map<String, Value> {
    let mut args = step.args.clone();
    if let Some(each) = input.get("each") {
        args.insert("each".to_string(), each.clone());
    }
    args
}

fn first_attempt(pe: &PipelineExecution, step: &StepDefinition, for_each: Option<StepForEach>) -> StepQueue {
    let step_loop = step.loop_config.as_ref().map(|_| StepLoop {
        iteration: 0,
        loop_completed: false,
    });

    StepQueue {
        pipeline_execution_id: pe.id.clone(),
        step_execution_id: new_step_execution_id(),
        step_name: step.name.clone(),
        step_input: step_input(step, for_each.as_ref(), step_loop.map(|l| l.iteration)),
        step_for_each: for_each,
        step_loop,
        step_retry: initial_retry(step),
        delay_ms: 0,
    }
}

fn initial_retry(step: &StepDefinition) -> Option<StepRetry> {
    step.retry.as_ref().map(|_| StepRetry {
        attempt: 1,
        retry_completed: false,
    })
}

fn step_definition<'a>(definition: &'a PipelineDefinition, name: &str) -> Result<&'a StepDefinition, DispatchError> {
    definition.get_step(name).ok_or_else(|| DispatchError::MissingStep {
        pipeline: definition.name.clone(),
        step: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StepError;

    const YAML: &str = r#"
name: demo
steps:
  - name: a
    type: http
  - name: b
    type: exec
  - name: c
    type: exec
    depends_on: [a, b]
    retry:
      max_attempts: 2
      initial_delay_ms: 10
  - name: d
    type: exec
    for_each: ["x", "y"]
    loop:
      max_iterations: 2
"#;

    fn definition() -> PipelineDefinition {
        PipelineDefinition::from_yaml(YAML).unwrap()
    }

    #[test]
    fn test_continuation_retries_fatal_failure() {
        let def = definition();
        let step = def.get_step("c").unwrap();
        let failed = StepOutput::failed(vec![StepError::execution("boom")]);

        let (_, retry) = continuation(step, None, None, &failed);
        assert_eq!(
            retry,
            Some(StepRetry {
                attempt: 1,
                retry_completed: false
            })
        );

        let last = Some(StepRetry {
            attempt: 2,
            retry_completed: false,
        });
        let (_, retry) = continuation(step, None, last, &failed);
        assert!(retry.unwrap().retry_completed);

        let (_, retry) = continuation(step, None, None, &StepOutput::finished(Map::new()));
        assert!(retry.unwrap().retry_completed);
    }

    #[test]
    fn test_continuation_loops_until_budget() {
        let def = definition();
        let step = def.get_step("d").unwrap();
        let ok = StepOutput::finished(Map::new());

        let (lp, retry) = continuation(step, Some(StepLoop { iteration: 0, loop_completed: false }), None, &ok);
        assert_eq!(retry, None);
        assert!(!lp.unwrap().loop_completed);

        let (lp, _) = continuation(step, Some(StepLoop { iteration: 1, loop_completed: false }), None, &ok);
        assert!(lp.unwrap().loop_completed);
    }

    #[test]
    fn test_step_input_carries_context() {
        let def = definition();
        let step = def.get_step("d").unwrap();
        let item = StepForEach::new("1", Value::from("y"));

        let input = step_input(step, Some(&item), Some(0));
        assert_eq!(input["each"]["key"], Value::from("1"));
        assert_eq!(input["each"]["value"], Value::from("y"));
        assert_eq!(input["loop_index"], Value::from(0));
    }
}
