use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid JID: {0}")]
    InvalidJid(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("sender-key distribution is missing a group id")]
    MissingGroupId,

    #[error("operation requires an authenticated identity")]
    AuthenticationMissing,

    #[error("PN/LID mapping mismatch: {0}")]
    MappingMismatch(String),

    #[error("no Signal session for {0}")]
    SessionMissing(String),

    #[error("media retry failed with status {status}")]
    MediaRetryFailure { status: u16 },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("key store error: {0}")]
    Store(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session encoding error: {0}")]
    Encoding(#[from] Box<bincode::ErrorKind>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("element missing: {0}")]
    ElementMissing(String),

    #[error("IQ error - code: {code}, text: {text}")]
    IQ { code: u16, text: String },
}
