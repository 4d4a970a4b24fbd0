use thiserror::Error;

/// Error kinds for the dispensing control loop, one per row of the error
/// handling table. Leaf components return these; `Supervisor` and `main`
/// wrap them in `anyhow::Result` at the point where only logging and a
/// policy decision (retry, close the valve, abort, exit) remain.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("1-Wire bus I/O failed: {0}")]
    BusIo(String),

    #[error("flow controller I/O failed: {0}")]
    FlowIo(String),

    /// Tick delta outside the sane range (`< 0` or `> 500`). Never
    /// propagated with `?`; call sites match on it and downgrade to a
    /// warning, per §7.
    #[error("tick delta {0} out of sane range")]
    TickAnomaly(i64),

    /// `last_flow_ticks` did not match the controller's reading at the
    /// start of a new session. Logged as a security warning; the pour
    /// continues.
    #[error("audit mismatch: expected {expected}, device reads {actual}")]
    AuditMismatch { expected: u32, actual: u32 },

    /// The user has no usable grants. Normal termination path, not a
    /// fault.
    #[error("no usable grants for user {0}")]
    NoGrants(i64),

    #[error("configuration error: {0}")]
    Config(String),

    /// Fridge-on requested inside the minimum inter-transition window.
    #[error("short-cycle refused: {remaining}s remain of {minimum}s minimum")]
    ShortCycle { remaining: i64, minimum: i64 },
}

pub type CoreResult<T> = Result<T, CoreError>;
