#[macro_use]
mod value;

pub use value::{fields_eq, fields_from_json, fields_to_json, Fields, Value};

pub type NodeId = u64;

/// A versioned document stored under `(collection, id)`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
    /// 1 on first write, +1 per successful mutation. Never reused.
    pub version: u64,
    pub created_at_ns: i64,
    pub modified_at_ns: i64,
}

impl Document {
    /// A document that has not been stored yet. Version and timestamps are
    /// assigned by the store.
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Document { id: id.into(), fields, version: 0, created_at_ns: 0, modified_at_ns: 0 }
    }
}

/// `expected == None` means "the document must not exist".
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CasRequest {
    pub key: String,
    pub expected: Option<Fields>,
    pub value: Fields,
}

/// Outcome of a compare-and-swap. On failure `current_value`/`version`
/// describe the document as it is now (`None`/0 if absent).
#[derive(Debug, Clone, PartialEq)]
pub struct CasResult {
    pub success: bool,
    pub current_value: Option<Fields>,
    pub version: u64,
}

/// Write operations carried by the replicated log.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Operation {
    Insert { collection: String, id: String, fields: Fields },
    Update { collection: String, id: String, fields: Fields },
    Delete { collection: String, id: String },
    Cas { collection: String, request: CasRequest },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Cas { .. } => "cas",
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Operation::Insert { collection, .. }
            | Operation::Update { collection, .. }
            | Operation::Delete { collection, .. }
            | Operation::Cas { collection, .. } => collection,
        }
    }
}

/// Replicated log record (implements openraft::AppData in keel-consensus).
///
/// `timestamp_ns` is fixed when the entry is created so every replica stamps
/// documents identically. `request_id` is recorded for tracing only; the log
/// does not deduplicate on it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub operation: Operation,
    pub timestamp_ns: i64,
    pub request_id: String,
}

/// Domain-level failures that are a normal result of applying an entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ApplyError {
    AlreadyExists { collection: String, id: String },
    NotFound { collection: String, id: String },
    Invalid(String),
}

impl From<ApplyError> for KeelError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::AlreadyExists { collection, id } => {
                KeelError::AlreadyExists { collection, id }
            }
            ApplyError::NotFound { collection, id } => KeelError::NotFound { collection, id },
            ApplyError::Invalid(reason) => KeelError::InvalidArgument(reason),
        }
    }
}

/// Result of applying one [`LogEntry`].
///
/// `document` is the state after the operation: the written document on
/// success, the current document for a losing CAS, `None` after a delete.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ApplyResponse {
    pub success: bool,
    pub document: Option<Document>,
    pub error: Option<ApplyError>,
}

impl ApplyResponse {
    pub fn written(document: Option<Document>) -> Self {
        ApplyResponse { success: true, document, error: None }
    }

    pub fn rejected(error: ApplyError) -> Self {
        ApplyResponse { success: false, document: None, error: Some(error) }
    }

    /// No-op response for entries that carry no document operation.
    pub fn empty() -> Self {
        ApplyResponse { success: true, document: None, error: None }
    }

    pub fn value(&self) -> Option<&Fields> {
        self.document.as_ref().map(|d| &d.fields)
    }

    pub fn version(&self) -> u64 {
        self.document.as_ref().map(|d| d.version).unwrap_or(0)
    }

    /// Surface a carried domain error as `Err`, otherwise the document.
    pub fn into_result(self) -> Result<Option<Document>, KeelError> {
        match self.error {
            Some(e) => Err(e.into()),
            None => Ok(self.document),
        }
    }

    pub fn into_cas_result(self) -> Result<CasResult, KeelError> {
        if let Some(e) = self.error {
            return Err(e.into());
        }
        let version = self.version();
        Ok(CasResult {
            success: self.success,
            current_value: self.document.map(|d| d.fields),
            version,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadConsistency {
    /// Served from this node's store; may lag the leader.
    #[default]
    Local,
    /// Served only by the leader.
    Strong,
}

/// Consensus role of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
    Candidate,
    Learner,
    Shutdown,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Learner => "learner",
            Role::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum KeelError {
    #[error("document {collection}:{id} already exists")]
    AlreadyExists { collection: String, id: String },
    #[error("document {collection}:{id} not found")]
    NotFound { collection: String, id: String },
    #[error("storage error: {0}")]
    Io(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("operation timed out")]
    Timeout,
    #[error("apply failed: {0}")]
    ApplyFailed(String),
    #[error("cluster is not ready")]
    NotReady,
    #[error("strong read requires the leader")]
    LeaderRequired,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("consensus error: {0}")]
    Consensus(String),
}

impl KeelError {
    /// The log-carried form of a domain error, or `None` for faults that
    /// must not be folded into an apply result.
    pub fn to_apply_error(&self) -> Option<ApplyError> {
        match self {
            KeelError::AlreadyExists { collection, id } => Some(ApplyError::AlreadyExists {
                collection: collection.clone(),
                id: id.clone(),
            }),
            KeelError::NotFound { collection, id } => {
                Some(ApplyError::NotFound { collection: collection.clone(), id: id.clone() })
            }
            KeelError::InvalidArgument(reason) => Some(ApplyError::Invalid(reason.clone())),
            _ => None,
        }
    }

    /// Transient errors the caller should retry, possibly against the leader.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeelError::NotReady
                | KeelError::NotLeader { .. }
                | KeelError::Timeout
                | KeelError::LeaderRequired
        )
    }
}
