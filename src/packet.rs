//! Wire-format codec for the six TFTP packet types (RFC 1350 §5, RFC 2347).
//!
//! Packets are modeled as a single tagged enum rather than a class hierarchy;
//! `Packet::decode` is the factory that demultiplexes on the two-byte opcode,
//! and `Packet::encode` is the single place that knows how to serialize any
//! variant. Option-bearing variants (`ReadRq`, `WriteRq`, `OptionAck`) share
//! their option encode/decode logic through free functions instead of a
//! shared base type.

use std::fmt;

use crate::consts;
use crate::error::TftpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	Octet,
	NetAscii,
}

impl Mode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Octet => "octet",
			Self::NetAscii => "netascii",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s.to_ascii_lowercase().as_str() {
			"octet" => Some(Self::Octet),
			"netascii" => Some(Self::NetAscii),
			_ => None,
		}
	}
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// An option list in client-sent (or server-chosen) order. A handful of
/// entries at most, so linear lookup is preferable to a hash map here -
/// it also keeps encode order equal to negotiation order, which RFC 2347
/// does not require on receive but this spec requires on send.
pub type OptionList = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
	ReadRq { filename: String, mode: Mode, options: OptionList },
	WriteRq { filename: String, mode: Mode, options: OptionList },
	Data { block: u16, data: Vec<u8> },
	Ack { block: u16 },
	Error { code: u16, message: String },
	OptionAck { options: OptionList },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
	ReadRq,
	WriteRq,
	Data,
	Ack,
	Error,
	OptionAck,
}

impl fmt::Display for PacketKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::ReadRq => "RRQ",
			Self::WriteRq => "WRQ",
			Self::Data => "DATA",
			Self::Ack => "ACK",
			Self::Error => "ERROR",
			Self::OptionAck => "OACK",
		};
		f.write_str(s)
	}
}

impl Packet {
	pub fn kind(&self) -> PacketKind {
		match self {
			Self::ReadRq { .. } => PacketKind::ReadRq,
			Self::WriteRq { .. } => PacketKind::WriteRq,
			Self::Data { .. } => PacketKind::Data,
			Self::Ack { .. } => PacketKind::Ack,
			Self::Error { .. } => PacketKind::Error,
			Self::OptionAck { .. } => PacketKind::OptionAck,
		}
	}

	/// Demultiplexes on the two-byte opcode and decodes the rest of the
	/// buffer according to that packet's wire format.
	pub fn decode(buf: &[u8]) -> Result<Self, TftpError> {
		if buf.len() < 2 {
			return Err(TftpError::Protocol("packet shorter than opcode".into()));
		}
		let opcode = u16::from_be_bytes([buf[0], buf[1]]);
		match opcode {
			consts::OPCODE_RRQ => decode_request(&buf[2..]).map(|(filename, mode, options)| Self::ReadRq { filename, mode, options }),
			consts::OPCODE_WRQ => decode_request(&buf[2..]).map(|(filename, mode, options)| Self::WriteRq { filename, mode, options }),
			consts::OPCODE_DATA => decode_data(&buf[2..]),
			consts::OPCODE_ACK => decode_ack(&buf[2..]),
			consts::OPCODE_ERROR => decode_error(&buf[2..]),
			consts::OPCODE_OACK => decode_options_only(&buf[2..]).map(|options| Self::OptionAck { options }),
			other => Err(TftpError::Protocol(format!("unknown opcode {other}"))),
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		match self {
			Self::ReadRq { filename, mode, options } => {
				out.extend_from_slice(&consts::OPCODE_RRQ.to_be_bytes());
				encode_request_body(&mut out, filename, *mode, options);
			}
			Self::WriteRq { filename, mode, options } => {
				out.extend_from_slice(&consts::OPCODE_WRQ.to_be_bytes());
				encode_request_body(&mut out, filename, *mode, options);
			}
			Self::Data { block, data } => {
				out.extend_from_slice(&consts::OPCODE_DATA.to_be_bytes());
				out.extend_from_slice(&block.to_be_bytes());
				out.extend_from_slice(data);
			}
			Self::Ack { block } => {
				out.extend_from_slice(&consts::OPCODE_ACK.to_be_bytes());
				out.extend_from_slice(&block.to_be_bytes());
			}
			Self::Error { code, message } => {
				out.extend_from_slice(&consts::OPCODE_ERROR.to_be_bytes());
				out.extend_from_slice(&code.to_be_bytes());
				out.extend_from_slice(message.as_bytes());
				out.push(0);
			}
			Self::OptionAck { options } => {
				out.extend_from_slice(&consts::OPCODE_OACK.to_be_bytes());
				encode_options(&mut out, options);
			}
		}
		out
	}
}

fn encode_request_body(out: &mut Vec<u8>, filename: &str, mode: Mode, options: &OptionList) {
	out.extend_from_slice(filename.as_bytes());
	out.push(0);
	out.extend_from_slice(mode.as_str().as_bytes());
	out.push(0);
	encode_options(out, options);
}

fn encode_options(out: &mut Vec<u8>, options: &OptionList) {
	for (key, value) in options {
		out.extend_from_slice(key.as_bytes());
		out.push(0);
		out.extend_from_slice(value.as_bytes());
		out.push(0);
	}
}

/// Splits `buf` on NUL bytes into owned, lossily-decoded strings. TFTP
/// strings are specified as ASCII but real-world peers sometimes aren't
/// strict about it, so we decode leniently (lossy UTF-8) rather than
/// rejecting the whole packet over a single stray byte.
fn split_nul_strings(buf: &[u8]) -> Vec<String> {
	buf.split(|&b| b == 0)
		.map(|chunk| String::from_utf8_lossy(chunk).into_owned())
		.collect()
}

fn decode_request(buf: &[u8]) -> Result<(String, Mode, OptionList), TftpError> {
	// A well-formed RRQ/WRQ body always ends in a NUL; an unterminated final
	// field (the last option value missing its NUL) is a malformed packet,
	// not a value to accept as-is.
	if buf.last() != Some(&0) {
		return Err(TftpError::Protocol("malformed request: not NUL-terminated".into()));
	}
	let mut fields = split_nul_strings(buf);
	fields.pop();
	if fields.len() < 2 {
		return Err(TftpError::Protocol("malformed request: missing filename or mode".into()));
	}

	let filename = fields.remove(0);
	let mode_str = fields.remove(0);
	let mode = Mode::parse(&mode_str).ok_or_else(|| TftpError::Protocol(format!("unknown transfer mode {mode_str:?}")))?;

	if fields.len() % 2 != 0 {
		return Err(TftpError::Protocol("malformed request: odd number of option fields".into()));
	}
	let mut options = OptionList::with_capacity(fields.len() / 2);
	let mut it = fields.into_iter();
	while let (Some(key), Some(value)) = (it.next(), it.next()) {
		if key.is_empty() {
			return Err(TftpError::Protocol("malformed request: empty option name".into()));
		}
		options.push((key.to_ascii_lowercase(), value));
	}

	Ok((filename, mode, options))
}

fn decode_options_only(buf: &[u8]) -> Result<OptionList, TftpError> {
	if buf.is_empty() {
		return Ok(OptionList::new());
	}
	if buf.last() != Some(&0) {
		return Err(TftpError::Protocol("malformed OACK: not NUL-terminated".into()));
	}
	let mut fields = split_nul_strings(buf);
	fields.pop();
	if fields.len() % 2 != 0 {
		return Err(TftpError::Protocol("malformed OACK: odd number of option fields".into()));
	}
	let mut options = OptionList::with_capacity(fields.len() / 2);
	let mut it = fields.into_iter();
	while let (Some(key), Some(value)) = (it.next(), it.next()) {
		if key.is_empty() {
			return Err(TftpError::Protocol("malformed OACK: empty option name".into()));
		}
		options.push((key.to_ascii_lowercase(), value));
	}
	Ok(options)
}

fn decode_data(buf: &[u8]) -> Result<Packet, TftpError> {
	if buf.len() < 2 {
		return Err(TftpError::Protocol("malformed DATA: missing block number".into()));
	}
	let block = u16::from_be_bytes([buf[0], buf[1]]);
	Ok(Packet::Data { block, data: buf[2..].to_vec() })
}

fn decode_ack(buf: &[u8]) -> Result<Packet, TftpError> {
	if buf.len() < 2 {
		return Err(TftpError::Protocol("malformed ACK: missing block number".into()));
	}
	// Tolerate an over-long ACK (MUST be accepted truncated to 4 bytes).
	let block = u16::from_be_bytes([buf[0], buf[1]]);
	Ok(Packet::Ack { block })
}

fn decode_error(buf: &[u8]) -> Result<Packet, TftpError> {
	if buf.len() < 2 {
		return Err(TftpError::Protocol("malformed ERROR: missing error code".into()));
	}
	let code = u16::from_be_bytes([buf[0], buf[1]]);
	// Tolerate a 4-byte ERROR packet with no message at all.
	let message = if buf.len() > 2 {
		let msg_buf = &buf[2..];
		let end = msg_buf.iter().position(|&b| b == 0).unwrap_or(msg_buf.len());
		String::from_utf8_lossy(&msg_buf[..end]).into_owned()
	} else {
		String::new()
	};
	Ok(Packet::Error { code, message })
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(pkt: Packet) {
		let encoded = pkt.encode();
		let decoded = Packet::decode(&encoded).expect("decode should succeed");
		assert_eq!(pkt, decoded);
	}

	#[test]
	fn roundtrip_read_request_no_options() {
		roundtrip(Packet::ReadRq { filename: "640KBFILE".into(), mode: Mode::Octet, options: vec![] });
	}

	#[test]
	fn roundtrip_write_request_with_options() {
		roundtrip(Packet::WriteRq {
			filename: "dir/sub/file.bin".into(),
			mode: Mode::Octet,
			options: vec![("blksize".into(), "1024".into()), ("tsize".into(), "655360".into())],
		});
	}

	#[test]
	fn roundtrip_data_empty_and_full() {
		roundtrip(Packet::Data { block: 1, data: vec![] });
		roundtrip(Packet::Data { block: 65535, data: vec![7u8; 512] });
	}

	#[test]
	fn roundtrip_ack() {
		roundtrip(Packet::Ack { block: 0 });
		roundtrip(Packet::Ack { block: 65535 });
	}

	#[test]
	fn roundtrip_error_with_message() {
		roundtrip(Packet::Error { code: 1, message: "File not found".into() });
	}

	#[test]
	fn roundtrip_oack() {
		roundtrip(Packet::OptionAck { options: vec![("blksize".into(), "1024".into())] });
	}

	#[test]
	fn ack_tolerates_overlong_buffer() {
		// RFC-compliant receivers MUST accept an ACK truncated to 4 bytes
		// even when the buffer handed to decode is longer.
		let mut buf = Packet::Ack { block: 5 }.encode();
		buf.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
		let decoded = Packet::decode(&buf).unwrap();
		assert_eq!(decoded, Packet::Ack { block: 5 });
	}

	#[test]
	fn error_tolerates_missing_message() {
		let buf = [consts::OPCODE_ERROR.to_be_bytes()[0], consts::OPCODE_ERROR.to_be_bytes()[1], 0, 4];
		let decoded = Packet::decode(&buf).unwrap();
		assert_eq!(decoded, Packet::Error { code: 4, message: String::new() });
	}

	#[test]
	fn mode_and_option_names_are_lowercased_on_decode() {
		let mut raw = Vec::new();
		raw.extend_from_slice(&consts::OPCODE_RRQ.to_be_bytes());
		raw.extend_from_slice(b"FILE.TXT\0OCTET\0BLKSIZE\01024\0");
		let decoded = Packet::decode(&raw).unwrap();
		match decoded {
			Packet::ReadRq { filename, mode, options } => {
				assert_eq!(filename, "FILE.TXT");
				assert_eq!(mode, Mode::Octet);
				assert_eq!(options, vec![("blksize".to_string(), "1024".to_string())]);
			}
			_ => panic!("expected ReadRq"),
		}
	}

	#[test]
	fn unknown_opcode_is_rejected() {
		let buf = [0, 99];
		assert!(Packet::decode(&buf).is_err());
	}

	#[test]
	fn unknown_mode_is_rejected() {
		let mut raw = Vec::new();
		raw.extend_from_slice(&consts::OPCODE_RRQ.to_be_bytes());
		raw.extend_from_slice(b"file\0mail\0");
		assert!(Packet::decode(&raw).is_err());
	}

	#[test]
	fn request_with_unterminated_option_value_is_rejected() {
		let mut raw = Vec::new();
		raw.extend_from_slice(&consts::OPCODE_RRQ.to_be_bytes());
		// final "1024" is missing its terminating NUL
		raw.extend_from_slice(b"file\0octet\0blksize\01024");
		assert!(Packet::decode(&raw).is_err());
	}

	#[test]
	fn request_with_empty_option_name_is_rejected() {
		let mut raw = Vec::new();
		raw.extend_from_slice(&consts::OPCODE_RRQ.to_be_bytes());
		raw.extend_from_slice(b"file\0octet\0\01024\0");
		assert!(Packet::decode(&raw).is_err());
	}

	#[test]
	fn oack_with_no_options_decodes_to_empty_list() {
		let mut raw = Vec::new();
		raw.extend_from_slice(&consts::OPCODE_OACK.to_be_bytes());
		let decoded = Packet::decode(&raw).unwrap();
		assert_eq!(decoded, Packet::OptionAck { options: vec![] });
	}

	#[test]
	fn oack_with_unterminated_option_value_is_rejected() {
		let mut raw = Vec::new();
		raw.extend_from_slice(&consts::OPCODE_OACK.to_be_bytes());
		raw.extend_from_slice(b"blksize\01024");
		assert!(Packet::decode(&raw).is_err());
	}
}
