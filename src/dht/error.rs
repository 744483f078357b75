use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("rate limited")]
    RateLimited,

    #[error("no transport can reach {0}")]
    Unreachable(SocketAddr),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("no token cached for this hash")]
    NoToken,

    #[error("no value to publish")]
    NoValue,

    #[error("data rejected: {0}")]
    Data(#[from] DataError),

    #[error("bucket too small to split")]
    BucketTooSmall,

    #[error("local id is not inside the bucket being split")]
    SplitOffPath,

    #[error("routing table corrupted: {0}")]
    Corrupted(String),
}

impl DhtError {
    /// Failures of the network path rather than of the remote node's answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DhtError::Io(_) | DhtError::Timeout | DhtError::Unreachable(_)
        )
    }

    /// Remote rejections caused by a concurrent writer rather than by a bad request.
    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            DhtError::Remote { code, .. }
                if *code == KrpcError::CAS_MISMATCH || *code == KrpcError::SEQ_TOO_LOW
        )
    }
}

/// Reasons an item is refused by [`DhtData`](super::DhtData) or [`Storage`](super::Storage).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("item hash does not match target")]
    HashMismatch,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidKey,

    #[error("cannot disable sequencing of a sequenced item")]
    SequenceDisabled,

    #[error("sequence number {offered:?} does not exceed {current:?}")]
    StaleSequence {
        current: Option<i64>,
        offered: Option<i64>,
    },

    #[error("cas mismatch: expected {expected}, current {current:?}")]
    CasMismatch { expected: i64, current: Option<i64> },

    #[error("value too large")]
    ValueTooLarge,

    #[error("salt too large")]
    SaltTooLarge,

    #[error("no signing key for this item")]
    NotSigner,
}

/// A KRPC error reply (`y = e`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("krpc error {code}: {message}")]
pub struct KrpcError {
    pub code: i64,
    pub message: String,
}

impl KrpcError {
    pub const GENERIC: i64 = 201;
    pub const SERVER: i64 = 202;
    pub const PROTOCOL: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;
    pub const MESSAGE_TOO_BIG: i64 = 205;
    pub const INVALID_SIGNATURE: i64 = 206;
    pub const SALT_TOO_BIG: i64 = 207;
    pub const CAS_MISMATCH: i64 = 301;
    pub const SEQ_TOO_LOW: i64 = 302;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(Self::PROTOCOL, message)
    }
}

impl From<DataError> for KrpcError {
    fn from(err: DataError) -> Self {
        let code = match err {
            DataError::InvalidSignature | DataError::InvalidKey => KrpcError::INVALID_SIGNATURE,
            DataError::ValueTooLarge => KrpcError::MESSAGE_TOO_BIG,
            DataError::SaltTooLarge => KrpcError::SALT_TOO_BIG,
            DataError::CasMismatch { .. } => KrpcError::CAS_MISMATCH,
            DataError::StaleSequence { .. } => KrpcError::SEQ_TOO_LOW,
            DataError::HashMismatch | DataError::SequenceDisabled | DataError::NotSigner => {
                KrpcError::PROTOCOL
            }
        };
        KrpcError::new(code, err.to_string())
    }
}

impl From<DhtError> for KrpcError {
    fn from(err: DhtError) -> Self {
        match err {
            DhtError::Data(data) => data.into(),
            DhtError::InvalidMessage(msg) => KrpcError::protocol(msg),
            DhtError::InvalidNodeId => KrpcError::protocol("invalid id"),
            other => KrpcError::new(KrpcError::SERVER, other.to_string()),
        }
    }
}
