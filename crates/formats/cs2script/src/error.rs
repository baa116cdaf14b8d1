use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unexpected end of data at offset {offset:#x} (need {need} bytes, have {have})")]
    UnexpectedEof {
        offset: usize,
        need: usize,
        have: usize,
    },

    #[error("{count} trailing bytes after the last instruction at offset {offset:#x}")]
    TrailingBytes { offset: usize, count: usize },

    #[error("invalid switch payload tag {tag} at offset {offset:#x}")]
    InvalidConstTag { offset: usize, tag: u8 },

    #[error("{field} is {value}, which does not fit the script header (max {max})")]
    LimitExceeded {
        field: &'static str,
        value: usize,
        max: usize,
    },

    #[error("{context}: {message}")]
    Parse { context: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
