use thiserror::Error;

/// Error taxonomy for the collector core.
///
/// Each variant corresponds to one of the five policy classes the core
/// distinguishes: a transient downstream outage is retried by the reconnect
/// loop, a protocol violation tears down the offending session, a malformed
/// body drops a single message, a fatal driver invariant is returned to an
/// outer supervisor instead of aborting the process, and a configuration
/// error just pins a component in its failed `ConnectionState`.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Store write timeout/queue-full, operational store DOWN, pub/sub DOWN.
    #[error("transient failure in {0}")]
    Transient(&'static str),

    /// Session mismatch, empty mandatory ctrl fields, session without owner.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Parse failure of the message tree, bad tag attribute, unsupported
    /// stat value variant.
    #[error("malformed body: {0}")]
    Malformed(String),

    /// A condition the core cannot continue past (misconfigured driver
    /// invariant). Surfaced to the caller rather than aborting in-place.
    #[error("fatal driver invariant violated: {0}")]
    Fatal(String),

    /// Missing broker, unresolvable address, or similar setup failure.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Generic error wrapper for everything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CollectorError>;
