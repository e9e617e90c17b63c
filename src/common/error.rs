use std::fmt;

#[derive(Debug)]
pub enum LoopError {
    IoError(std::io::Error),
    ConfigError(String),
    ProtocolError(String),
    ExitError(String),
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::IoError(e) => write!(f, "IO error: {}", e),
            LoopError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            LoopError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
            LoopError::ExitError(msg) => write!(f, "Loop exit with error: {}", msg),
        }
    }
}

impl std::error::Error for LoopError {}

impl From<std::io::Error> for LoopError {
    fn from(err: std::io::Error) -> Self {
        LoopError::IoError(err)
    }
}

pub type Result<T> = std::result::Result<T, LoopError>;
