use std::time::Duration;

use thiserror::Error;

/// Closed taxonomy the Dispatcher maps its backend failures onto (see SPEC_FULL.md §4.3/§7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchErrorKind {
    CommunalPathNotEmpty,
    WrongRegion,
    BucketMissing,
    EndpointBad,
    ClusterLeaseNotExpired,
    PermissionDenied,
    NodeCountMismatch,
    DatabaseNotFound,
    KerberosFailure,
    UnsupportedOperation,
    Unknown,
}

impl DispatchErrorKind {
    /// The event `reason` a warning event for this kind should carry (SPEC_FULL.md §4.9).
    pub fn event_reason(&self) -> &'static str {
        match self {
            DispatchErrorKind::CommunalPathNotEmpty => "CommunalPathNotEmpty",
            DispatchErrorKind::WrongRegion => "S3WrongRegion",
            DispatchErrorKind::BucketMissing => "S3BucketDoesNotExist",
            DispatchErrorKind::EndpointBad => "CommunalEndpointBad",
            DispatchErrorKind::ClusterLeaseNotExpired => "ClusterLeaseNotExpired",
            DispatchErrorKind::PermissionDenied => "CommunalPermissionDenied",
            DispatchErrorKind::NodeCountMismatch => "NodeCountMismatch",
            DispatchErrorKind::DatabaseNotFound => "DatabaseNotFound",
            DispatchErrorKind::KerberosFailure => "KerberosAuthError",
            DispatchErrorKind::UnsupportedOperation => "DispatcherUnsupportedOperation",
            DispatchErrorKind::Unknown => "DispatcherUnknownError",
        }
    }

    /// Whether the reconcile driver should treat this as a domain failure (logged, requeued,
    /// never surfaced as a hard error) rather than bubbling up as unexpected.
    pub fn is_retryable_domain_failure(&self) -> bool {
        !matches!(self, DispatchErrorKind::Unknown)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1:?}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("kube exec error: {0}")]
    KubeExecError(String),

    #[error("{0}: {1}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(
        String,
        #[source] Box<kube::runtime::finalizer::Error<Error>>,
    ),

    #[error("{0}: {1}")]
    FormattingError(String, #[source] std::fmt::Error),

    #[error("dispatcher error ({kind:?}): {message}")]
    DispatchError {
        kind: DispatchErrorKind,
        message: String,
    },

    /// Not a failure: a typed "abort this iteration, come back later" signal (SPEC_FULL.md §0.2).
    #[error("requeue after {0:?}")]
    RequeueAfter(Duration),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("invalid trace ID")]
    InvalidTraceId,

    #[error("{0}")]
    MissingData(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("cert error: {0}")]
    CertError(String),

    #[error("receive output error: {0}")]
    ReceiveOutput(String),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    UrlParseError(String, #[source] url::ParseError),

    #[error("{0}: {1}")]
    Utf8Error(String, #[source] std::str::Utf8Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
