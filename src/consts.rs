//! Shared constants for the TFTP engine (RFC 1350, RFC 2347-2349).

use std::time::Duration;

pub const MIN_BLKSIZE: u16 = 8;
pub const DEF_BLKSIZE: u16 = 512;
pub const MAX_BLKSIZE: u16 = 65464;

pub const SOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_DUPS: u32 = 20;
pub const TIMEOUT_RETRIES: u8 = 5;

pub const DEF_TFTP_PORT: u16 = 69;

pub const OPT_BLOCKSIZE_IDENT: &str = "blksize";
pub const OPT_TRANSFERSIZE_IDENT: &str = "tsize";

pub const OPCODE_RRQ: u16 = 1;
pub const OPCODE_WRQ: u16 = 2;
pub const OPCODE_DATA: u16 = 3;
pub const OPCODE_ACK: u16 = 4;
pub const OPCODE_ERROR: u16 = 5;
pub const OPCODE_OACK: u16 = 6;

/// Upload directories are created with this mode, matching tftpy's
/// `make_subdirs` (0o700, never above the configured root).
pub const UPLOAD_DIR_MODE: u32 = 0o700;
