use std::time::Duration;

use crate::graph::GraphError;

/// Failures that end one inbound message cycle.
///
/// A missing transition is not listed here: it is an expected outcome and
/// surfaces as [`crate::orchestrator::CycleOutcome::NoMatchingTransition`].
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("no tenant is bound to inbound address `{0}`")]
    TenantNotFound(String),
    #[error("collaborator `{collaborator}` unavailable: {reason}")]
    CollaboratorUnavailable {
        collaborator: &'static str,
        reason: String,
    },
    #[error("conversation graph for tenant `{tenant}` is invalid: {source}")]
    GraphInvalid {
        tenant: String,
        #[source]
        source: GraphError,
    },
    #[error("could not render node `{node}`: {reason}")]
    Render { node: String, reason: String },
}

impl FlowError {
    pub fn unavailable(collaborator: &'static str, err: anyhow::Error) -> Self {
        FlowError::CollaboratorUnavailable {
            collaborator,
            reason: format!("{err:#}"),
        }
    }

    pub fn timed_out(collaborator: &'static str, after: Duration) -> Self {
        FlowError::CollaboratorUnavailable {
            collaborator,
            reason: format!("timed out after {} ms", after.as_millis()),
        }
    }

    /// True for failures that are worth retrying at the transport layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, FlowError::CollaboratorUnavailable { .. })
    }
}
