use crate::stack::StackDiff;

/// Error type for everything above the wire format.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Format(#[from] cs2script::Error),

    #[error("attempted stack division of {diff} by {divisor} leading to remainder")]
    StackRemainder { diff: StackDiff, divisor: i32 },

    #[error("missing pop values on stack")]
    StackUnderflow,

    #[error("stack error: {0}")]
    Stack(String),

    /// Contradicting evidence while calibrating; aborts calibration.
    #[error("calibration conflict: {0}")]
    Calibration(String),

    #[error("opcode registry is for build {found}, expected {expected}")]
    BuildMismatch { expected: u32, found: u32 },

    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    /// Broken tree invariant; indicates a bug in a rewrite pass.
    #[error("structure error: {0}")]
    Structure(String),

    #[error("conflicting types old:{old}, new:{new} ({key} <- {link})")]
    SubtypeConflict {
        old: String,
        new: String,
        key: String,
        link: String,
    },

    #[error("compile error: {0}")]
    Compile(String),

    #[error("interpreter error: {0}")]
    Interpreter(String),

    #[error("cache source error: {0}")]
    Source(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
