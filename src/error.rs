//! Crate-wide error taxonomy (spec §7 / §0.4): a plain, exhaustively
//! matched enum rather than a dynamic `Box<dyn Error>` tree, the way the
//! teacher's `avreceiver`/`cec` modules expose their own error enums.

#[derive(Debug)]
pub enum BridgeError {
    Malformed(String),
    NotInitialized,
    AdapterOpenFailure(String),
    Transport(std::io::Error),
    Fatal(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BridgeError::Malformed(text) => write!(f, "malformed frame: {}", text),
            BridgeError::NotInitialized => write!(f, "adapter not initialized"),
            BridgeError::AdapterOpenFailure(reason) => {
                write!(f, "could not open CEC adapter: {}", reason)
            }
            BridgeError::Transport(e) => write!(f, "transport error: {}", e),
            BridgeError::Fatal(reason) => write!(f, "fatal error: {}", reason),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Transport(e)
    }
}

impl From<crate::cec::CECError> for BridgeError {
    fn from(e: crate::cec::CECError) -> Self {
        match e {
            crate::cec::CECError::NotInitialized => BridgeError::NotInitialized,
            crate::cec::CECError::AdapterNotFound => {
                BridgeError::AdapterOpenFailure(String::from("no CEC adapter found"))
            }
            crate::cec::CECError::OpenFailed => {
                BridgeError::AdapterOpenFailure(String::from("failed to open CEC adapter"))
            }
            crate::cec::CECError::CommandFailed => {
                BridgeError::Fatal(String::from("CEC command failed"))
            }
            crate::cec::CECError::InvalidConfiguration(reason) => {
                BridgeError::Fatal(String::from(reason))
            }
        }
    }
}
