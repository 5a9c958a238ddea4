//! Per-transfer session state, grounded in `tftpy.context.base.Context`
//! (field names below mirror it closely: `host`/`address`, `tidport`,
//! `next_block`, `last_pkt`, `pending_complete`, ...).

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::error::{ErrorCode, TftpError};
use crate::fileio::{ByteSink, ByteSource};
use crate::metrics::Metrics;
use crate::options::NegotiatedOptions;
use crate::packet::{Mode, Packet, PacketKind};

/// The socket operations a [`Context`] needs. Implemented for both
/// `std::net::UdpSocket` (the client driver's single blocking socket) and
/// `mio::net::UdpSocket` (one per session on the server, registered with a
/// `mio::Poll`) - the state machine and retry logic are written once and
/// shared by both.
pub trait TftpSocket {
	fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
	fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl TftpSocket for std::net::UdpSocket {
	fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
		std::net::UdpSocket::send_to(self, buf, target)
	}
	fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		std::net::UdpSocket::recv_from(self, buf)
	}
}

impl TftpSocket for mio::net::UdpSocket {
	fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
		mio::net::UdpSocket::send_to(self, buf, target)
	}
	fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		mio::net::UdpSocket::recv_from(self, buf)
	}
}

/// The file object backing a transfer: a source on upload/server-RRQ, a
/// sink on download/server-WRQ.
pub enum FileSlot {
	Source(ByteSource),
	Sink(ByteSink),
	Empty,
}

impl FileSlot {
	fn close(&mut self) -> io::Result<()> {
		match self {
			Self::Sink(s) => s.close(),
			Self::Source(_) | Self::Empty => Ok(()),
		}
	}
}

/// A hook invoked just before a DATA packet carrying `block` is sent,
/// letting tests inject delay/drop behavior without a global flag (§9
/// design note supersedes the source's `DELAY_BLOCK` global).
pub type DelayHook = std::sync::Arc<dyn Fn(u16) + Send + Sync>;

pub struct Context<S: TftpSocket> {
	pub remote_ip: IpAddr,
	/// The initial remote port: 69 for server-bound client requests, or
	/// whatever port the server asked the client to reply to.
	pub port: u16,
	/// The peer's TID, fixed once the first reply is seen.
	pub tidport: Option<u16>,
	pub sock: S,

	pub mode: Mode,
	pub file_to_transfer: String,
	pub options: NegotiatedOptions,

	pub next_block: u16,
	pub last_pkt: Option<Packet>,
	pub last_update: Instant,
	pub timeout: Duration,

	pub file: FileSlot,
	pub metrics: Metrics,
	pub pending_complete: bool,

	pub delay_hook: Option<DelayHook>,
	ended: bool,
}

impl<S: TftpSocket> Context<S> {
	pub fn new(sock: S, remote_ip: IpAddr, port: u16, timeout: Duration) -> Self {
		let mut metrics = Metrics::default();
		metrics.start();
		Self {
			remote_ip,
			port,
			tidport: None,
			sock,
			mode: Mode::Octet,
			file_to_transfer: String::new(),
			options: NegotiatedOptions::default(),
			next_block: 0,
			last_pkt: None,
			last_update: Instant::now(),
			timeout,
			file: FileSlot::Empty,
			metrics,
			pending_complete: false,
			delay_hook: None,
			ended: false,
		}
	}

	/// The address every outbound packet should target: the peer's TID
	/// once known, else the request port.
	fn target(&self) -> SocketAddr {
		SocketAddr::new(self.remote_ip, self.tidport.unwrap_or(self.port))
	}

	fn advance_block(&mut self) {
		self.next_block = if self.next_block == 0 { 1 } else { self.next_block.wrapping_add(1) };
	}

	/// Sends the initial request packet (RRQ/WRQ) before a TID is known,
	/// and bumps `next_block` as a side effect - mirroring
	/// `tftpy.context.base.Context.send`, which every first send goes
	/// through.
	pub fn send_initial(&mut self, pkt: &Packet) -> Result<(), TftpError> {
		let target = SocketAddr::new(self.remote_ip, self.port);
		self.sock.send_to(&pkt.encode(), target)?;
		self.advance_block();
		self.last_pkt = Some(pkt.clone());
		Ok(())
	}

	/// Low-level send used once a TID is established: transmits `pkt` and
	/// records it as `last_pkt`, but does not touch `next_block` - the
	/// state machine manages block numbers explicitly past this point.
	pub fn transmit(&mut self, pkt: &Packet) -> Result<(), TftpError> {
		let target = self.target();
		self.sock.send_to(&pkt.encode(), target)?;
		self.last_pkt = Some(pkt.clone());
		Ok(())
	}

	pub fn send_ack(&mut self, block: u16) -> Result<(), TftpError> {
		self.transmit(&Packet::Ack { block })
	}

	pub fn send_oack(&mut self, options: crate::packet::OptionList) -> Result<(), TftpError> {
		self.transmit(&Packet::OptionAck { options })
	}

	/// Sends an ERROR packet, unless the TID hasn't been established yet -
	/// in which case there's no session to report to, so the send is
	/// silently skipped (matches `tftpy.states.base.TftpState.send_error`).
	pub fn send_error(&mut self, code: ErrorCode, message: &str) {
		if self.tidport.is_none() && self.port == 0 {
			return;
		}
		let _ = self.transmit(&Packet::Error { code: code as u16, message: message.to_string() });
	}

	/// Reads the next chunk from the source, sends it as the DATA packet
	/// for `next_block`, and reports whether this was the final
	/// (short-or-empty) packet of the transfer.
	pub fn send_data(&mut self) -> Result<bool, TftpError> {
		if let Some(hook) = &self.delay_hook {
			hook(self.next_block);
		}

		let blksize = self.options.blksize as usize;
		let chunk = match &mut self.file {
			FileSlot::Source(src) => src.read_chunk(blksize)?,
			_ => return Err(TftpError::Protocol("send_data called without an open source".into())),
		};
		let finished = chunk.len() < blksize;
		self.metrics.bytes += chunk.len() as u64;

		let block = self.next_block;
		self.transmit(&Packet::Data { block, data: chunk })?;
		Ok(finished)
	}

	/// Writes a received DATA payload to the sink.
	pub fn write_received(&mut self, data: &[u8]) -> Result<(), TftpError> {
		match &mut self.file {
			FileSlot::Sink(sink) => {
				sink.write_chunk(data)?;
				self.metrics.bytes += data.len() as u64;
				Ok(())
			}
			_ => Err(TftpError::Protocol("write_received called without an open sink".into())),
		}
	}

	pub fn recv(&mut self, buf: &mut [u8]) -> Result<(Packet, SocketAddr), TftpError> {
		match self.sock.recv_from(buf) {
			Ok((n, from)) => {
				self.last_update = Instant::now();
				let pkt = Packet::decode(&buf[..n])?;
				Ok((pkt, from))
			}
			Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Err(TftpError::Timeout),
			Err(e) => Err(e.into()),
		}
	}

	pub fn check_timeout(&self, now: Instant) -> Result<(), TftpError> {
		if now.saturating_duration_since(self.last_update) > self.timeout {
			Err(TftpError::Timeout)
		} else {
			Ok(())
		}
	}

	/// Resends `last_pkt` to the peer's current address, accounting the
	/// resend in metrics. Invoked by the retry policy (§4.8).
	pub fn resend_last(&mut self) -> Result<(), TftpError> {
		let Some(pkt) = self.last_pkt.clone() else {
			return Ok(());
		};
		let encoded = pkt.encode();
		self.sock.send_to(&encoded, self.target())?;
		self.metrics.resent_bytes += encoded.len() as u64;
		self.metrics.add_dup(dup_key(&pkt))?;
		Ok(())
	}

	/// Closes the file object and finalizes metrics. Idempotent - safe to
	/// call more than once as sessions are torn down.
	pub fn end(&mut self) {
		if self.ended {
			return;
		}
		self.ended = true;
		let _ = self.file.close();
		self.metrics.end_time = Some(Instant::now());
		self.metrics.compute();
	}
}

pub fn dup_key(pkt: &Packet) -> String {
	match pkt {
		Packet::Data { block, .. } => format!("{}:{block}", PacketKind::Data),
		Packet::Ack { block } => format!("{}:{block}", PacketKind::Ack),
		other => format!("{}", other.kind()),
	}
}

impl<S: TftpSocket> Drop for Context<S> {
	fn drop(&mut self) {
		self.end();
	}
}
