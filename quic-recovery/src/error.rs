//! Transport errors raised by loss recovery and flow control
//!
//! Every fatal condition detected by this crate is returned to the caller as a
//! [`TransportError`]. The connection owner is responsible for closing the
//! connection with [`TransportError::code`].

use thiserror::Error;

/// Transport error codes (RFC 9000 §20.1) used by this crate.
pub mod code {
    /// INTERNAL_ERROR
    pub const INTERNAL_ERROR: u64 = 0x01;
    /// FLOW_CONTROL_ERROR
    pub const FLOW_CONTROL_ERROR: u64 = 0x03;
    /// FINAL_SIZE_ERROR
    pub const FINAL_SIZE_ERROR: u64 = 0x06;
    /// PROTOCOL_VIOLATION
    pub const PROTOCOL_VIOLATION: u64 = 0x0a;
}

/// Connection-terminating transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer sent more data than the advertised window allows.
    #[error("flow control error: {0}")]
    FlowControl(String),

    /// The peer reported inconsistent final sizes for a stream.
    #[error("final size error: {0}")]
    FinalSize(String),

    /// The peer violated the protocol, e.g. acknowledged a packet that was never sent.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The local endpoint misused the API.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Wire error code to send in CONNECTION_CLOSE.
    pub fn code(&self) -> u64 {
        match self {
            TransportError::FlowControl(_) => code::FLOW_CONTROL_ERROR,
            TransportError::FinalSize(_) => code::FINAL_SIZE_ERROR,
            TransportError::ProtocolViolation(_) => code::PROTOCOL_VIOLATION,
            TransportError::Internal(_) => code::INTERNAL_ERROR,
        }
    }

    /// Human readable reason phrase.
    pub fn reason(&self) -> &str {
        match self {
            TransportError::FlowControl(msg)
            | TransportError::FinalSize(msg)
            | TransportError::ProtocolViolation(msg)
            | TransportError::Internal(msg) => msg,
        }
    }
}
