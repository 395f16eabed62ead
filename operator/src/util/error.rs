use arl_types::WorkspacePhase;

use crate::sidecar::SidecarError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// A kube error annotated with the object and operation in flight.
    #[error("{operation} {object}: {source}")]
    Api {
        object: String,
        operation: &'static str,
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    #[error("Invalid phase transition for {object}: {from:?} -> {to}")]
    InvalidPhaseTransition {
        object: String,
        from: Option<WorkspacePhase>,
        to: WorkspacePhase,
    },

    #[error("Sidecar call failed: {source}")]
    Sidecar {
        #[from]
        source: SidecarError,
    },

    #[error("Middleware '{hook}' rejected reconciliation of {object}: {message}")]
    Middleware {
        hook: String,
        object: String,
        message: String,
    },
}

impl Error {
    /// Wrap a kube error with the namespaced object and the operation that
    /// was being attempted, as every returned error must carry both.
    pub fn api(operation: &'static str, namespace: &str, name: &str, source: kube::Error) -> Self {
        Error::Api {
            object: format!("{namespace}/{name}"),
            operation,
            source,
        }
    }

    /// Transient optimistic-concurrency conflict; the caller should requeue
    /// and re-read rather than surface a failure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } | Error::Api {
                source: kube::Error::Api(ae),
                ..
            } if ae.code == 409
        )
    }
}
