use crate::pdu::{AbortSource, RejectReason};
use crate::status::Status;

/// Error which might happen while operating an association.
#[derive(thiserror::Error, Debug)]
pub enum DimseError {
    #[error("timed out while establishing the association")]
    ConnectTimeout,

    #[error("association rejected: {reason}")]
    AssociationRejected { permanent: bool, reason: RejectReason },

    #[error("malformed PDU: {0}")]
    MalformedPdu(String),

    #[error("unexpected {pdu} PDU while association is {state}")]
    UnexpectedPdu { pdu: &'static str, state: &'static str },

    #[error("no accepted presentation context for abstract syntax {abstract_syntax}")]
    UnsupportedPresentationContext { abstract_syntax: String },

    #[error("no response for message {message_id} within the request timeout")]
    RequestTimeout { message_id: u16 },

    #[error("peer did not answer the release request in time")]
    ReleaseTimeout,

    #[error("association aborted by {abort_source} (reason {reason})")]
    PeerAbort { abort_source: AbortSource, reason: u8 },

    #[error("DIMSE service returned status {code}")]
    ServiceStatus { code: Status },

    #[error("sub-operations failed: {counts}")]
    SubOperationFailure { counts: crate::message::SubOperationCounts },

    #[error("association aborted: {0}")]
    Aborted(String),

    #[error("invalid command set: {0}")]
    InvalidCommand(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

impl DimseError {
    /// A copy of this error suitable for every exchange still waiting on a closed association.
    pub(crate) fn to_terminal(&self) -> DimseError {
        match self {
            DimseError::PeerAbort {
                abort_source,
                reason,
            } => DimseError::PeerAbort {
                abort_source: *abort_source,
                reason: *reason,
            },
            DimseError::MalformedPdu(msg) => DimseError::MalformedPdu(msg.clone()),
            DimseError::UnexpectedPdu { pdu, state } => DimseError::UnexpectedPdu { pdu, state },
            other => DimseError::Aborted(other.to_string()),
        }
    }

    /// Whether the error was raised by the transport or the Upper Layer protocol, as opposed to
    /// a DIMSE service outcome. Such errors always end the association.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            DimseError::MalformedPdu(_)
                | DimseError::UnexpectedPdu { .. }
                | DimseError::PeerAbort { .. }
                | DimseError::Aborted(_)
                | DimseError::Io(_)
        )
    }
}

/// Failure of the external dataset codec.
#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("unsupported transfer syntax \"{0}\"")]
    UnsupportedTransferSyntax(String),

    #[error("could not decode dataset: {0}")]
    Decode(String),

    #[error("could not encode dataset: {0}")]
    Encode(String),

    #[error("dataset does not have the required tag: \"{0}\"")]
    MissingTag(&'static str),
}

/// Failure reported by a [crate::services::StorePersister].
#[derive(thiserror::Error, Debug)]
#[error("{message}")]
pub struct PersistError {
    /// Status to report to the peer, defaults to "processing failure".
    pub status: Option<Status>,
    pub message: String,
}

impl PersistError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string()).with_status(Status::OUT_OF_RESOURCES)
    }
}

impl From<DatasetError> for PersistError {
    fn from(e: DatasetError) -> Self {
        Self::new(e.to_string()).with_status(Status::CANNOT_UNDERSTAND)
    }
}

/// Failure reported by a [crate::services::QuerySource].
#[derive(thiserror::Error, Debug)]
#[error("{message}")]
pub struct QueryError {
    pub status: Option<Status>,
    pub message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for QueryError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<DatasetError> for QueryError {
    fn from(e: DatasetError) -> Self {
        Self {
            status: Some(Status::IDENTIFIER_DOES_NOT_MATCH),
            message: e.to_string(),
        }
    }
}
