//! Error taxonomy for the TFTP engine.
//!
//! Every fallible operation in this crate returns one of the kinds below,
//! never a bare `io::Error` or `String`. The kinds mirror the TFTP ERROR
//! opcode table (RFC 1350 §5) closely enough that [`TftpError::as_error_code`]
//! is a near 1:1 mapping, but a few kinds (Timeout, Peer) have no direct wire
//! representation and only ever surface locally.

use std::fmt;
use std::io;

use thiserror::Error;

/// The TFTP ERROR packet error codes (RFC 1350 §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
	NotDefined = 0,
	FileNotFound = 1,
	AccessViolation = 2,
	DiskFull = 3,
	IllegalOperation = 4,
	UnknownTid = 5,
	FileAlreadyExists = 6,
	NoSuchUser = 7,
	FailedNegotiation = 8,
}

impl ErrorCode {
	pub fn message(self) -> &'static str {
		match self {
			Self::NotDefined => "Not defined, see error message (if any)",
			Self::FileNotFound => "File not found",
			Self::AccessViolation => "Access violation",
			Self::DiskFull => "Disk full or allocation exceeded",
			Self::IllegalOperation => "Illegal TFTP operation",
			Self::UnknownTid => "Unknown transfer ID",
			Self::FileAlreadyExists => "File already exists",
			Self::NoSuchUser => "No such user",
			Self::FailedNegotiation => "Failed to negotiate options",
		}
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", *self as u16, self.message())
	}
}

impl TryFrom<u16> for ErrorCode {
	type Error = ();

	fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
		Ok(match value {
			0 => Self::NotDefined,
			1 => Self::FileNotFound,
			2 => Self::AccessViolation,
			3 => Self::DiskFull,
			4 => Self::IllegalOperation,
			5 => Self::UnknownTid,
			6 => Self::FileAlreadyExists,
			7 => Self::NoSuchUser,
			8 => Self::FailedNegotiation,
			_ => return Err(()),
		})
	}
}

/// The error taxonomy shared by the codec, options negotiation, the state
/// machine, the client driver and the server dispatcher.
#[derive(Debug, Error)]
pub enum TftpError {
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("options error: {0}")]
	Options(String),

	#[error("timed out waiting for traffic")]
	Timeout,

	#[error("file not found: {0}")]
	FileNotFound(String),

	#[error("access violation: {0}")]
	AccessViolation(String),

	#[error("i/o error: {0}")]
	Io(#[from] io::Error),

	/// An ERROR packet received from the peer. Terminates the transfer but
	/// is not itself replied to.
	#[error("peer sent error {code}: {message}")]
	Peer { code: u16, message: String },
}

impl TftpError {
	/// Maps this error onto the wire error code that should accompany an
	/// outbound ERROR packet, when one is warranted. `Peer` and `Timeout`
	/// never produce an outbound ERROR packet (§7: a fault already reported
	/// by the peer, or a timeout, get no reply).
	pub fn as_error_code(&self) -> Option<ErrorCode> {
		match self {
			Self::Protocol(_) => Some(ErrorCode::IllegalOperation),
			Self::Options(_) => Some(ErrorCode::FailedNegotiation),
			Self::FileNotFound(_) => Some(ErrorCode::FileNotFound),
			Self::AccessViolation(_) => Some(ErrorCode::AccessViolation),
			Self::Io(_) => Some(ErrorCode::DiskFull),
			Self::Timeout | Self::Peer { .. } => None,
		}
	}
}

pub type Result<T> = std::result::Result<T, TftpError>;
