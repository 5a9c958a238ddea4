//! Options negotiation (RFC 2347-2349): validation of `blksize`/`tsize`,
//! silent rejection of anything else.

use crate::consts::{DEF_BLKSIZE, MAX_BLKSIZE, MIN_BLKSIZE, OPT_BLOCKSIZE_IDENT, OPT_TRANSFERSIZE_IDENT};
use crate::error::TftpError;
use crate::packet::OptionList;

/// A session's negotiated options. Unrecognized option names never reach
/// this struct - they're dropped during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedOptions {
	pub blksize: u16,
	pub tsize: Option<u32>,
}

impl Default for NegotiatedOptions {
	fn default() -> Self {
		Self { blksize: DEF_BLKSIZE, tsize: None }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParsedOption {
	Blksize(i64),
	Tsize(i64),
}

/// Parses the recognized options out of a raw request/OACK option list.
/// Unknown option names are dropped silently; a *recognized* name with a
/// value that doesn't parse as an integer is an [`TftpError::Options`].
fn parse_recognized(raw: &OptionList) -> Result<Vec<ParsedOption>, TftpError> {
	let mut parsed = Vec::with_capacity(raw.len());
	for (key, value) in raw {
		match key.as_str() {
			OPT_BLOCKSIZE_IDENT => {
				let v: i64 = value
					.parse()
					.map_err(|_| TftpError::Options(format!("invalid blksize value {value:?}")))?;
				parsed.push(ParsedOption::Blksize(v));
			}
			OPT_TRANSFERSIZE_IDENT => {
				let v: i64 = value
					.parse()
					.map_err(|_| TftpError::Options(format!("invalid tsize value {value:?}")))?;
				parsed.push(ParsedOption::Tsize(v));
			}
			_ => { /* unrecognized options are dropped, never negated, never echoed */ }
		}
	}
	Ok(parsed)
}

fn clamp_blksize(requested: i64) -> u16 {
	requested.clamp(MIN_BLKSIZE as i64, MAX_BLKSIZE as i64) as u16
}

/// Server-side negotiation for a request's option list.
///
/// Returns the options to echo in an OACK (empty means "send a bare
/// ACK/Data instead, don't negotiate") and the resulting session options.
/// For a read request, `tsize` - if requested - is always overridden with
/// the actual file size, regardless of what the client sent.
pub fn negotiate_server_options(raw: &OptionList, is_read: bool, file_size: u64) -> Result<(OptionList, NegotiatedOptions), TftpError> {
	if raw.is_empty() {
		return Ok((OptionList::new(), NegotiatedOptions::default()));
	}

	let parsed = parse_recognized(raw)?;
	let mut negotiated = NegotiatedOptions::default();
	let mut accepted = OptionList::new();

	for option in parsed {
		match option {
			ParsedOption::Blksize(v) => {
				let clamped = clamp_blksize(v);
				negotiated.blksize = clamped;
				accepted.push((OPT_BLOCKSIZE_IDENT.to_string(), clamped.to_string()));
			}
			ParsedOption::Tsize(v) => {
				if v < 0 {
					return Err(TftpError::Options("tsize must not be negative".into()));
				}
				let tsize = if is_read { file_size as u32 } else { v as u32 };
				negotiated.tsize = Some(tsize);
				accepted.push((OPT_TRANSFERSIZE_IDENT.to_string(), tsize.to_string()));
			}
		}
	}

	Ok((accepted, negotiated))
}

/// Client-side: accepts the server's OACK contents as the session's options.
pub fn accept_server_options(oack: &OptionList) -> Result<NegotiatedOptions, TftpError> {
	if oack.is_empty() {
		return Err(TftpError::Options("OACK carried no options".into()));
	}

	let parsed = parse_recognized(oack)?;
	let mut negotiated = NegotiatedOptions::default();
	for option in parsed {
		match option {
			ParsedOption::Blksize(v) => negotiated.blksize = clamp_blksize(v),
			ParsedOption::Tsize(v) => {
				if v >= 0 {
					negotiated.tsize = Some(v as u32);
				}
			}
		}
	}
	Ok(negotiated)
}
