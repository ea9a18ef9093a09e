/// Failures of the byte-moving layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("room already has a host")]
    HostTaken,

    #[error("transport closed")]
    Closed,
}

/// Failures surfaced by the session service.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("not connected to a room")]
    NotConnected,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a guess is rejected before it reaches the history.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuessError {
    #[error("not a number")]
    NotANumber,

    #[error("already guessed {0}")]
    AlreadyGuessed(i32),

    #[error("round already solved")]
    RoundOver,

    #[error("no round in progress")]
    NotPlaying,

    #[error("input frozen by opponent")]
    InputFrozen,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PowerError {
    #[error("power-ups are not enabled for this round")]
    Unavailable,

    #[error("no loadout selected")]
    NoLoadout,

    #[error("ability already used this round")]
    AlreadyUsed,

    #[error("visible range cannot shrink any further")]
    RangeTooNarrow,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid PORT: {0}")]
    InvalidPort(String),
}
