use std::time::Duration;

use thiserror::Error;

pub use vertdb_k8s_util::error::DispatchErrorKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} (kube error: {1})")]
    KubeError(String, #[source] kube::Error),

    #[error("{0}: {1}")]
    // boxed to break the recursive type: finalizer::Error is generic over this Error
    FinalizerError(
        String,
        #[source] Box<kube::runtime::finalizer::Error<Error>>,
    ),

    #[error("dispatcher error ({kind:?}): {message}")]
    DispatcherError {
        kind: DispatchErrorKind,
        message: String,
    },

    #[error("pod exec error: {0}")]
    PodExecError(String),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("cert error: {0}")]
    CertError(String),

    /// Not a failure: a typed "abort this iteration, come back later" signal.
    #[error("requeue after {0:?}")]
    RequeueAfter(Duration),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("{0}: {1}")]
    FormattingError(String, #[source] std::fmt::Error),

    #[error("receive output error: {0}")]
    ReceiveOutput(String),

    #[error("invalid trace ID")]
    InvalidTraceId,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
