//! The persistent transfer states (§4.3/§4.5), grounded in
//! `tftpy.states.states.{request,acknowledge}` and `tftpy.states.base`.
//!
//! `ServerStart`/`ServerRecvRRQ`/`ServerRecvWRQ` don't get `State` variants
//! of their own here - they run once, inline, while a server session is
//! being created (see `server.rs`), then hand off into `ExpectAck` or
//! `ExpectData` like every other transfer.

use std::net::SocketAddr;

use crate::context::Context;
use crate::context::TftpSocket;
use crate::error::{ErrorCode, TftpError};
use crate::options;
use crate::packet::{OptionList, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	/// Client has sent RRQ, waiting for the first DATA or an OACK.
	SentReadRq,
	/// Client has sent WRQ, waiting for ACK(0) or an OACK.
	SentWriteRq,
	/// Waiting to receive the next DATA block.
	ExpectData,
	/// Waiting to receive the next ACK.
	ExpectAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockCmp {
	InOrder,
	Duplicate,
	Future,
}

/// Classifies an incoming block number against the one we're expecting,
/// using wraparound-aware comparison: block numbers cycle through the
/// 16-bit space and back to zero, so a plain `<`/`>` comparison would
/// misclassify the wrap. A duplicate of block zero is not special-cased -
/// it's just the predecessor of block one, same as any other duplicate.
fn classify_block(expected: u16, got: u16) -> BlockCmp {
	if got == expected {
		BlockCmp::InOrder
	} else if got == expected.wrapping_sub(1) {
		BlockCmp::Duplicate
	} else {
		BlockCmp::Future
	}
}

/// Verifies `from` against the locked TID, locking it to this reply's port
/// if it isn't locked yet. Returns `false` for a mismatched address or port
/// - the caller discards the packet and does not change state (§4.6's TID
/// locking rule), rather than treating it as a fatal protocol error.
fn check_tid<S: TftpSocket>(ctx: &mut Context<S>, from: SocketAddr) -> bool {
	if from.ip() != ctx.remote_ip {
		return false;
	}
	match ctx.tidport {
		Some(locked) => locked == from.port(),
		None => {
			ctx.tidport = Some(from.port());
			true
		}
	}
}

/// Applies an incoming DATA packet to a receiving session: acks in-order
/// data, re-acks a duplicate of the previous block, and leaves a block
/// further ahead than expected unacknowledged - the timeout/retry path is
/// what realigns a peer that got ahead of us, not an error here.
fn handle_dat<S: TftpSocket>(ctx: &mut Context<S>, block: u16, data: &[u8]) -> Result<bool, TftpError> {
	match classify_block(ctx.next_block, block) {
		BlockCmp::InOrder => {
			ctx.write_received(data)?;
			ctx.send_ack(block)?;
			let finished = data.len() < ctx.options.blksize as usize;
			ctx.next_block = block.wrapping_add(1);
			Ok(finished)
		}
		BlockCmp::Duplicate => {
			ctx.resend_last()?;
			Ok(false)
		}
		BlockCmp::Future => {
			ctx.metrics.out_of_order();
			Ok(false)
		}
	}
}

/// Applies an incoming ACK to a sending session: an ack of the block we
/// just sent advances to the next one (or ends the transfer); an ack of
/// the previous block is a duplicate that's resent rather than re-sent as
/// new data; an ack further ahead than expected is a non-fatal anomaly
/// that's simply discarded.
fn handle_ack<S: TftpSocket>(ctx: &mut Context<S>, block: u16) -> Result<bool, TftpError> {
	match classify_block(ctx.next_block, block) {
		BlockCmp::InOrder => {
			// The ack of the block we flagged as final (short) completes
			// the transfer here - there's nothing left to send.
			if ctx.pending_complete {
				return Ok(true);
			}
			ctx.next_block = block.wrapping_add(1);
			let finished = ctx.send_data()?;
			ctx.pending_complete = finished;
			Ok(false)
		}
		BlockCmp::Duplicate => {
			ctx.resend_last()?;
			Ok(false)
		}
		BlockCmp::Future => {
			ctx.metrics.errors += 1;
			Ok(false)
		}
	}
}

fn illegal_operation<S: TftpSocket>(ctx: &mut Context<S>, what: &str) -> TftpError {
	ctx.send_error(ErrorCode::IllegalOperation, what);
	TftpError::Protocol(what.to_string())
}

impl State {
	/// Advances the state machine on an incoming packet. `Ok(None)` means
	/// the transfer is complete; `Ok(Some(next))` carries the next
	/// persistent state. A legitimate peer ERROR packet ends the transfer
	/// without an outbound reply - see `TftpError::Peer`, never echoed. A
	/// packet from a non-matching (address, port) is discarded before any
	/// state-specific handling runs: it never changes state.
	pub fn handle<S: TftpSocket>(self, ctx: &mut Context<S>, pkt: Packet, from: SocketAddr) -> Result<Option<State>, TftpError> {
		if !check_tid(ctx, from) {
			ctx.metrics.errors += 1;
			return Ok(Some(self));
		}

		if let Packet::Error { code, message } = pkt {
			return Err(TftpError::Peer { code, message });
		}

		match self {
			State::SentReadRq => match pkt {
				Packet::Data { block, data } => {
					if block != 1 {
						return Err(illegal_operation(ctx, "first data block must be block 1"));
					}
					ctx.next_block = 1;
					let finished = handle_dat(ctx, block, &data)?;
					Ok(if finished { None } else { Some(State::ExpectData) })
				}
				Packet::OptionAck { options: oack } => {
					ctx.options = options::accept_server_options(&oack)?;
					ctx.send_ack(0)?;
					ctx.next_block = 1;
					Ok(Some(State::ExpectData))
				}
				_ => Err(illegal_operation(ctx, "expected DATA or OACK after RRQ")),
			},

			State::SentWriteRq => match pkt {
				Packet::Ack { block: 0 } => {
					ctx.next_block = 1;
					ctx.pending_complete = ctx.send_data()?;
					Ok(Some(State::ExpectAck))
				}
				Packet::OptionAck { options: oack } => {
					ctx.options = options::accept_server_options(&oack)?;
					ctx.next_block = 1;
					ctx.pending_complete = ctx.send_data()?;
					Ok(Some(State::ExpectAck))
				}
				_ => Err(illegal_operation(ctx, "expected ACK(0) or OACK after WRQ")),
			},

			State::ExpectData => match pkt {
				Packet::Data { block, data } => {
					let finished = handle_dat(ctx, block, &data)?;
					Ok(if finished { None } else { Some(State::ExpectData) })
				}
				_ => Err(illegal_operation(ctx, "expected DATA")),
			},

			State::ExpectAck => match pkt {
				Packet::Ack { block } => {
					let finished = handle_ack(ctx, block)?;
					Ok(if finished { None } else { Some(State::ExpectAck) })
				}
				// Unlike every other state, an unexpected packet here is
				// discarded rather than treated as fatal - no ERROR reply,
				// stay put and wait for the ACK we're actually expecting.
				_ => Ok(Some(State::ExpectAck)),
			},
		}
	}
}

/// Runs the transient server-side negotiation for an incoming RRQ: opens
/// the source, negotiates options against its actual size, and sends
/// either an OACK or the first DATA block directly, mirroring
/// `tftpy.states.server.server.receive_rrq`'s "oack if negotiated,
/// otherwise just start sending" branch.
pub fn begin_server_rrq<S: TftpSocket>(ctx: &mut Context<S>, raw_options: &OptionList, file_size: u64) -> Result<State, TftpError> {
	let (accepted, negotiated) = options::negotiate_server_options(raw_options, true, file_size)?;
	ctx.options = negotiated;
	if accepted.is_empty() {
		ctx.next_block = 1;
		ctx.pending_complete = ctx.send_data()?;
	} else {
		ctx.send_oack(accepted)?;
	}
	Ok(State::ExpectAck)
}

/// Runs the transient server-side negotiation for an incoming WRQ: sends
/// either an OACK or a bare ACK(0) to invite the first DATA block.
pub fn begin_server_wrq<S: TftpSocket>(ctx: &mut Context<S>, raw_options: &OptionList) -> Result<State, TftpError> {
	let (accepted, negotiated) = options::negotiate_server_options(raw_options, false, 0)?;
	ctx.options = negotiated;
	if accepted.is_empty() {
		ctx.send_ack(0)?;
	} else {
		ctx.send_oack(accepted)?;
	}
	ctx.next_block = 1;
	Ok(State::ExpectData)
}

/// Drives a session to completion: receive, advance the state machine,
/// and resend the last packet on timeout up to [`TIMEOUT_RETRIES`] times.
/// Shared by the client driver and the server's per-session handling -
/// both just differ in how the `Context` and starting `State` were built.
pub fn run_to_completion<S: TftpSocket>(ctx: &mut Context<S>, mut state: State) -> Result<(), TftpError> {
	use crate::consts::{MAX_BLKSIZE, TIMEOUT_RETRIES};

	let mut buf = vec![0u8; 4 + MAX_BLKSIZE as usize];
	let mut retries = 0u8;
	loop {
		match ctx.recv(&mut buf) {
			Ok((pkt, from)) => {
				retries = 0;
				match state.handle(ctx, pkt, from)? {
					Some(next) => state = next,
					None => return Ok(()),
				}
			}
			Err(TftpError::Timeout) => {
				retries += 1;
				if retries >= TIMEOUT_RETRIES {
					return Err(TftpError::Timeout);
				}
				ctx.resend_last()?;
			}
			Err(e) => return Err(e),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classify_handles_wraparound_at_zero() {
		assert_eq!(classify_block(0, 0), BlockCmp::InOrder);
		assert_eq!(classify_block(0, 65535), BlockCmp::Duplicate);
		assert_eq!(classify_block(1, 0), BlockCmp::Duplicate);
		assert_eq!(classify_block(5, 7), BlockCmp::Future);
	}
}
