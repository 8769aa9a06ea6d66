//! Router (§4.10): resolves a [`Request`] to either a flow run or a
//! single-agent run, journaling the decision it made.

use std::collections::HashSet;

use serde_json::json;

use crate::errors::{Result, RunnerError};
use crate::journal::ActivityJournal;
use crate::protocol::{ActivityLevel, ActivityEntry, Request, RouteDecision};

/// `known_flows` lets the router answer "does this flow id exist" without
/// depending on the loader directly — the caller (the binary/CLI) already
/// has the flow registry in hand by the time it routes a request.
pub fn route(request: &Request, known_flows: &HashSet<String>, default_agent: &str, journal: &ActivityJournal) -> Result<RouteDecision> {
    if request.has_conflicting_selectors() {
        return Err(RunnerError::ConflictingSelectors);
    }

    if let Some(flow_id) = &request.metadata.flow {
        if known_flows.contains(flow_id) {
            journal.log(ActivityEntry::new(
                request.trace_id,
                "router",
                "request.routing.flow",
                json!({"flow_id": flow_id}),
                ActivityLevel::Info,
            ));
            return Ok(RouteDecision::Flow {
                flow_id: flow_id.clone(),
            });
        }
        return Err(RunnerError::FlowNotFound {
            flow_id: flow_id.clone(),
        });
    }

    if let Some(agent_id) = &request.metadata.agent {
        journal.log(ActivityEntry::new(
            request.trace_id,
            "router",
            "request.routing.agent",
            json!({"agent_id": agent_id}),
            ActivityLevel::Info,
        ));
        return Ok(RouteDecision::Agent {
            agent_id: agent_id.clone(),
        });
    }

    journal.log(ActivityEntry::new(
        request.trace_id,
        "router",
        "request.routing.default",
        json!({"agent_id": default_agent}),
        ActivityLevel::Info,
    ));
    Ok(RouteDecision::Agent {
        agent_id: default_agent.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestMetadata;

    fn journal() -> ActivityJournal {
        ActivityJournal::in_memory(50, 250).unwrap()
    }

    fn request(metadata: RequestMetadata) -> Request {
        Request::new("do something", metadata)
    }

    #[test]
    fn routes_to_existing_flow() {
        let known: HashSet<String> = ["review".to_string()].into_iter().collect();
        let req = request(RequestMetadata {
            flow: Some("review".into()),
            ..Default::default()
        });
        let decision = route(&req, &known, "assistant", &journal()).unwrap();
        assert_eq!(decision, RouteDecision::Flow { flow_id: "review".into() });
    }

    #[test]
    fn unknown_flow_is_not_found() {
        let known = HashSet::new();
        let req = request(RequestMetadata {
            flow: Some("missing".into()),
            ..Default::default()
        });
        let err = route(&req, &known, "assistant", &journal()).unwrap_err();
        assert_eq!(err.kind(), "flow_not_found");
    }

    #[test]
    fn routes_to_named_agent() {
        let known = HashSet::new();
        let req = request(RequestMetadata {
            agent: Some("reviewer".into()),
            ..Default::default()
        });
        let decision = route(&req, &known, "assistant", &journal()).unwrap();
        assert_eq!(decision, RouteDecision::Agent { agent_id: "reviewer".into() });
    }

    #[test]
    fn falls_back_to_default_agent() {
        let known = HashSet::new();
        let req = request(RequestMetadata::default());
        let decision = route(&req, &known, "assistant", &journal()).unwrap();
        assert_eq!(decision, RouteDecision::Agent { agent_id: "assistant".into() });
    }

    #[test]
    fn conflicting_selectors_are_rejected() {
        let known = HashSet::new();
        let req = request(RequestMetadata {
            flow: Some("f".into()),
            agent: Some("a".into()),
            ..Default::default()
        });
        let err = route(&req, &known, "assistant", &journal()).unwrap_err();
        assert_eq!(err.kind(), "conflicting_selectors");
    }
}
