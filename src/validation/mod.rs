//! Flow document validation (§4.9 "Validation", §7 `config_invalid`):
//! structural checks over a parsed [`Flow`] that the loader runs before a
//! flow is ever scheduled. Separate from [`crate::config::validate_limits`],
//! which is a resource guard rather than a correctness check.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::errors::{Result, RunnerError};
use crate::protocol::Flow;

/// Runs every structural check and returns the full list of problems found
/// rather than stopping at the first one, so a single `Validate` CLI
/// invocation reports everything wrong with a flow at once. Mixes both
/// categories `validate_or_err` keeps apart (schema-shaped problems and
/// dependency-graph problems) since this entry point is for human-readable
/// reporting, not for picking an error `kind`.
pub fn validate(flow: &Flow) -> Vec<String> {
    let mut errors = structural_errors(flow);
    errors.extend(dependency_errors(flow).messages);
    errors
}

/// Duplicate/missing step ids, empty agents, gate steps with an out-of-range
/// `max_retries`: schema/type problems that map to `config_invalid` (§7)
/// rather than the flow's dependency graph.
fn structural_errors(flow: &Flow) -> Vec<String> {
    let mut errors = Vec::new();

    let step_ids: HashSet<&str> = flow.steps.iter().map(|s| s.id.as_str()).collect();
    if step_ids.len() != flow.steps.len() {
        errors.push("flow declares duplicate step ids".to_string());
    }

    if flow.steps.is_empty() {
        errors.push("flow declares no steps".to_string());
    }

    for step in &flow.steps {
        if step.agent.trim().is_empty() {
            errors.push(format!("step '{}' has an empty agent", step.id));
        }
        if let Some(gate) = &step.gate {
            if gate.max_retries < 1 {
                errors.push(format!(
                    "step '{}' gate has max_retries={} but must be >= 1",
                    step.id, gate.max_retries
                ));
            }
        }
    }

    errors
}

/// Collected dependency-graph problems: dangling `depends_on`/`input.step_id`/
/// `output.from` references and cycles. These are exactly the cases §4.9(b,c)
/// and the §7 taxonomy name as `invalid_dependencies` ("DAG cycle or dangling
/// edge"), kept separate from `cycle_nodes` so `validate_or_err` can populate
/// `RunnerError::InvalidDependencies::cycles` without re-parsing messages.
struct DependencyIssues {
    messages: Vec<String>,
    cycle_nodes: Vec<String>,
}

fn dependency_errors(flow: &Flow) -> DependencyIssues {
    let mut messages = Vec::new();
    let step_ids: HashSet<&str> = flow.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &flow.steps {
        for dep in &step.depends_on {
            if !step_ids.contains(dep.as_str()) {
                messages.push(format!("step '{}' depends on unknown step '{dep}'", step.id));
            }
        }
        if let crate::protocol::InputSource::Step = step.input.source {
            match &step.input.step_id {
                Some(id) if step_ids.contains(id.as_str()) => {}
                Some(id) => messages.push(format!(
                    "step '{}' wires input from unknown step '{id}'",
                    step.id
                )),
                None => messages.push(format!(
                    "step '{}' has input.source=step but no step_id",
                    step.id
                )),
            }
        }
    }

    if !step_ids.contains(flow.output.from.as_str()) {
        messages.push(format!(
            "output.from references unknown step '{}'",
            flow.output.from
        ));
    }

    let cycle_nodes = match check_acyclic(&flow.steps) {
        Err(cycle) => {
            messages.push(format!(
                "flow has a circular dependency involving step(s): {}",
                cycle.join(", ")
            ));
            cycle
        }
        Ok(()) => Vec::new(),
    };

    DependencyIssues { messages, cycle_nodes }
}

/// Validates and returns a typed error so callers that just want a pass/fail
/// boolean can use `?`. Dependency-graph problems (cycles, dangling
/// `depends_on`/`input.step_id`/`output.from` references) are reported as
/// `invalid_dependencies`; everything else (duplicate/missing ids, empty
/// agents) is `config_invalid` (§7 taxonomy). Dependency problems take
/// precedence when both are present, since they're checked first below.
pub fn validate_or_err(flow: &Flow) -> Result<()> {
    let dependency_issues = dependency_errors(flow);
    if !dependency_issues.messages.is_empty() {
        return Err(RunnerError::InvalidDependencies {
            message: dependency_issues.messages.join("; "),
            cycles: dependency_issues.cycle_nodes,
        });
    }

    let structural_issues = structural_errors(flow);
    if !structural_issues.is_empty() {
        return Err(RunnerError::ConfigInvalid {
            message: structural_issues.join("; "),
        });
    }

    Ok(())
}

/// Kahn's algorithm: repeatedly removes zero-in-degree nodes. Any node
/// still remaining once no more can be removed is part of a cycle.
fn check_acyclic(steps: &[crate::protocol::Step]) -> std::result::Result<(), Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in steps {
        in_degree.entry(step.id.as_str()).or_insert(0);
        for dep in &step.depends_on {
            // an unknown dependency is reported separately by `validate`;
            // here we only care about nodes that exist in the step set.
            if steps.iter().any(|s| s.id == *dep) {
                *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut visited = 0usize;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        if let Some(succs) = dependents.get(node) {
            for &succ in succs {
                let entry = in_degree.get_mut(succ).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(succ);
                }
            }
        }
    }

    if visited == in_degree.len() {
        Ok(())
    } else {
        let remaining: Vec<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg > 0)
            .map(|(&id, _)| id.to_string())
            .collect();
        Err(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FlowOutput, FlowSettings, InputSource, OutputFormat, RetryPolicy, Step, StepInput, StepType};

    fn step(id: &str, depends_on: Vec<&str>) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            step_type: StepType::Agent,
            agent: "reviewer".to_string(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            input: StepInput {
                source: InputSource::Request,
                step_id: None,
                transform: "passthrough".to_string(),
                literal: None,
            },
            retry: RetryPolicy::default(),
            gate: None,
            timeout_ms: None,
        }
    }

    fn flow(steps: Vec<Step>, output_from: &str) -> Flow {
        Flow {
            id: "f".to_string(),
            name: "f".to_string(),
            version: "1".to_string(),
            steps,
            output: FlowOutput {
                from: output_from.to_string(),
                format: OutputFormat::Markdown,
            },
            settings: FlowSettings::default(),
        }
    }

    #[test]
    fn accepts_a_valid_linear_flow() {
        let f = flow(vec![step("a", vec![]), step("b", vec!["a"])], "b");
        assert!(validate(&f).is_empty());
    }

    #[test]
    fn rejects_empty_agent() {
        let mut s = step("a", vec![]);
        s.agent = "".to_string();
        let f = flow(vec![s], "a");
        assert!(!validate(&f).is_empty());
    }

    #[test]
    fn rejects_dangling_dependency() {
        let f = flow(vec![step("a", vec!["ghost"])], "a");
        let errors = validate(&f);
        assert!(errors.iter().any(|e| e.contains("unknown step")));
    }

    #[test]
    fn rejects_dangling_output_from() {
        let f = flow(vec![step("a", vec![])], "ghost");
        let errors = validate(&f);
        assert!(errors.iter().any(|e| e.contains("output.from")));
    }

    #[test]
    fn rejects_self_cycle() {
        let f = flow(vec![step("a", vec!["a"])], "a");
        let errors = validate(&f);
        assert!(errors.iter().any(|e| e.contains("circular")));
    }

    #[test]
    fn rejects_two_node_cycle() {
        let f = flow(vec![step("a", vec!["b"]), step("b", vec!["a"])], "a");
        let errors = validate(&f);
        assert!(errors.iter().any(|e| e.contains("circular")));
    }

    #[test]
    fn accepts_diamond_dependency_shape() {
        let f = flow(
            vec![
                step("a", vec![]),
                step("b", vec!["a"]),
                step("c", vec!["a"]),
                step("d", vec!["b", "c"]),
            ],
            "d",
        );
        assert!(validate(&f).is_empty());
    }

    #[test]
    fn validate_or_err_joins_multiple_dependency_problems() {
        let f = flow(vec![step("a", vec!["ghost"])], "missing");
        let err = validate_or_err(&f).unwrap_err();
        assert_eq!(err.kind(), "invalid_dependencies");
    }

    #[test]
    fn validate_or_err_reports_cycle_as_invalid_dependencies_with_cycle_nodes() {
        let f = flow(vec![step("a", vec!["b"]), step("b", vec!["a"])], "a");
        match validate_or_err(&f).unwrap_err() {
            RunnerError::InvalidDependencies { cycles, .. } => {
                assert!(cycles.contains(&"a".to_string()));
                assert!(cycles.contains(&"b".to_string()));
            }
            other => panic!("expected InvalidDependencies, got {other:?}"),
        }
    }

    #[test]
    fn rejects_gate_with_zero_max_retries() {
        let mut s = step("a", vec![]);
        s.gate = Some(crate::protocol::GateConfig {
            criteria: vec![],
            threshold: 0.8,
            on_fail: crate::protocol::OnFail::Retry,
            max_retries: 0,
        });
        let f = flow(vec![s], "a");
        let err = validate_or_err(&f).unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
    }

    #[test]
    fn validate_or_err_reports_structural_problems_as_config_invalid() {
        let mut s = step("a", vec![]);
        s.agent = "".to_string();
        let f = flow(vec![s], "a");
        let err = validate_or_err(&f).unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
    }
}
