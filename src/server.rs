use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};
use tokio_util::sync::CancellationToken;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::consts::{MAX_BLKSIZE, SOCK_TIMEOUT};
use crate::context::Context;
use crate::error::{ErrorCode, Result, TftpError};
use crate::fileio::{self, ByteSink, ByteSource};
use crate::packet::{OptionList, Packet};
use crate::state::{self, State};

const LISTEN_TOKEN: Token = Token(0);
/// How often the poll loop wakes up on its own to sweep for timed-out
/// sessions and check the cancellation token, even with nothing to read.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Dynamic content hook for reads: `dyn_file_func(filename, raddress, rport)`.
/// `None` means the hook declines the request, surfaced to the peer as
/// ERROR 1 (FileNotFound) rather than falling back to the filesystem.
pub type ReadHook = Arc<dyn Fn(&str, IpAddr, u16) -> Option<ByteSource> + Send + Sync>;
/// Upload hook for writes: `upload_open(full_path, raddress, rport)`.
/// `None` means the hook rejects the upload, surfaced as ERROR 2
/// (AccessViolation).
pub type WriteHook = Arc<dyn Fn(&Path, IpAddr, u16) -> Option<ByteSink> + Send + Sync>;

struct Session {
	ctx: Context<MioUdpSocket>,
	state: Option<State>,
	retries: u8,
}

/// A single-threaded, readiness-multiplexed TFTP server: one listen socket
/// plus one socket per in-flight session, all polled through a single
/// `mio::Poll`. No per-session OS thread or async task is ever spawned -
/// every session advances only when its own socket becomes readable.
pub struct TftpServer {
	listen: MioUdpSocket,
	root: PathBuf,
	poll: Poll,
	sessions: HashMap<Token, Session>,
	next_token: usize,
	read_hook: Option<ReadHook>,
	write_hook: Option<WriteHook>,
}

impl TftpServer {
	pub fn new(listen_addr: SocketAddr, root: PathBuf) -> Result<Self> {
		let mut listen = MioUdpSocket::bind(listen_addr)?;
		let poll = Poll::new()?;
		poll.registry().register(&mut listen, LISTEN_TOKEN, Interest::READABLE)?;

		Ok(Self { listen, root, poll, sessions: HashMap::new(), next_token: 1, read_hook: None, write_hook: None })
	}

	/// Installs a dynamic content hook for reads, replacing the default
	/// filesystem open for every RRQ this server handles.
	pub fn with_read_hook(mut self, hook: ReadHook) -> Self {
		self.read_hook = Some(hook);
		self
	}

	/// Installs an upload hook for writes, replacing the default
	/// filesystem open (and subdirectory creation) for every WRQ.
	pub fn with_write_hook(mut self, hook: WriteHook) -> Self {
		self.write_hook = Some(hook);
		self
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		Ok(self.listen.local_addr()?)
	}

	pub fn run(&mut self, cancel: CancellationToken) -> Result<()> {
		let mut events = Events::with_capacity(128);
		loop {
			if cancel.is_cancelled() {
				info!("server shutting down");
				return Ok(());
			}

			match self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e.into()),
			}

			for event in events.iter() {
				if event.token() == LISTEN_TOKEN {
					self.accept_requests();
				} else {
					self.service_session(event.token());
				}
			}

			self.sweep_timeouts();
		}
	}

	/// Drains every pending datagram on the listen socket. Each one must be
	/// a fresh RRQ/WRQ - anything else arriving here has no session yet and
	/// is simply logged and discarded, mirroring `tftpy`'s server dispatch
	/// loop which only ever expects initial requests on the well-known port.
	fn accept_requests(&mut self) {
		let mut buf = vec![0u8; 4 + MAX_BLKSIZE as usize];
		loop {
			let (n, from) = match self.listen.recv_from(&mut buf) {
				Ok(pair) => pair,
				Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
				Err(e) => {
					warn!("listen socket error: {e}");
					return;
				}
			};

			match Packet::decode(&buf[..n]) {
				Ok(Packet::ReadRq { filename, options, .. }) => self.start_session(from, &filename, options, true),
				Ok(Packet::WriteRq { filename, options, .. }) => self.start_session(from, &filename, options, false),
				Ok(other) => debug!("discarding unexpected {} from {from} with no session", other.kind()),
				Err(e) => debug!("discarding malformed datagram from {from}: {e}"),
			}
		}
	}

	fn start_session(&mut self, from: SocketAddr, filename: &str, options: OptionList, is_read: bool) {
		match self.try_start_session(from, filename, options, is_read) {
			Ok(()) => {}
			Err(e) => warn!("request from {from} for {filename:?} rejected: {e}"),
		}
	}

	/// Binds the session socket first, so that any rejection from here on -
	/// a path that escapes the root, a missing file, a permissions error -
	/// can be reported back to the client as an ERROR packet instead of
	/// silently dropping the request (§4.6: `ServerRecvRRQ`/`ServerRecvWRQ`
	/// "send ERROR, raise" on failure).
	fn try_start_session(&mut self, from: SocketAddr, filename: &str, options: OptionList, is_read: bool) -> Result<()> {
		let mut sock = MioUdpSocket::bind(SocketAddr::new(self.listen.local_addr()?.ip(), 0))?;
		let token = Token(self.next_token);
		self.next_token += 1;
		self.poll.registry().register(&mut sock, token, Interest::READABLE)?;

		let mut ctx = Context::new(sock, from.ip(), from.port(), SOCK_TIMEOUT);
		ctx.tidport = Some(from.port());
		ctx.file_to_transfer = filename.to_string();

		let outcome = self.prepare_transfer(&mut ctx, filename, &options, is_read);
		let state = match outcome {
			Ok(s) => s,
			Err(e) => {
				ctx.send_error(e.as_error_code().unwrap_or(ErrorCode::NotDefined), &e.to_string());
				let _ = self.poll.registry().deregister(&mut ctx.sock);
				return Err(e);
			}
		};

		info!("{} {filename:?} from {from}", if is_read { "RRQ" } else { "WRQ" });
		self.sessions.insert(token, Session { ctx, state: Some(state), retries: 0 });
		Ok(())
	}

	fn prepare_transfer(&self, ctx: &mut Context<MioUdpSocket>, filename: &str, options: &OptionList, is_read: bool) -> Result<State> {
		let path = fileio::resolve_server_path(&self.root, filename)?;
		if is_read {
			let source = match &self.read_hook {
				Some(hook) => hook(filename, ctx.remote_ip, ctx.port).ok_or_else(|| TftpError::FileNotFound(filename.to_string()))?,
				None => ByteSource::open_path(&path).map_err(|e| map_open_error(e, &path))?,
			};
			let file_size = source.len_hint().unwrap_or(0);
			ctx.file = crate::context::FileSlot::Source(source);
			state::begin_server_rrq(ctx, options, file_size)
		} else {
			let sink = match &self.write_hook {
				Some(hook) => hook(&path, ctx.remote_ip, ctx.port).ok_or_else(|| TftpError::AccessViolation(path.display().to_string()))?,
				None => {
					fileio::create_upload_dirs(&self.root, &path)?;
					ByteSink::create_path(&path).map_err(TftpError::Io)?
				}
			};
			ctx.file = crate::context::FileSlot::Sink(sink);
			state::begin_server_wrq(ctx, options)
		}
	}

	fn service_session(&mut self, token: Token) {
		let Some(session) = self.sessions.get_mut(&token) else { return };
		let mut buf = vec![0u8; 4 + MAX_BLKSIZE as usize];

		loop {
			match session.ctx.recv(&mut buf) {
				Ok((pkt, from)) => {
					session.retries = 0;
					let state = session.state.take().expect("session polled after completion");
					match state.handle(&mut session.ctx, pkt, from) {
						Ok(Some(next)) => session.state = Some(next),
						Ok(None) => {
							self.finish_session(token);
							return;
						}
						Err(e) => {
							warn!("session {} ended: {e}", session.ctx.file_to_transfer);
							self.finish_session(token);
							return;
						}
					}
				}
				Err(TftpError::Timeout) => return,
				Err(e) => {
					warn!("session socket error: {e}");
					self.finish_session(token);
					return;
				}
			}
		}
	}

	fn finish_session(&mut self, token: Token) {
		if let Some(mut session) = self.sessions.remove(&token) {
			let _ = self.poll.registry().deregister(&mut session.ctx.sock);
			session.ctx.end();
		}
	}

	/// Resends the last packet for any session that's gone quiet past its
	/// timeout, up to `TIMEOUT_RETRIES` times, then gives up on it -
	/// mirroring the client's own retry policy (§4.8) on the server side.
	fn sweep_timeouts(&mut self) {
		use crate::consts::TIMEOUT_RETRIES;

		let now = Instant::now();
		let timed_out: Vec<Token> = self.sessions.iter().filter(|(_, s)| s.ctx.check_timeout(now).is_err()).map(|(t, _)| *t).collect();

		for token in timed_out {
			let Some(session) = self.sessions.get_mut(&token) else { continue };
			session.retries += 1;
			if session.retries >= TIMEOUT_RETRIES {
				warn!("session timed out waiting for peer");
				self.finish_session(token);
				continue;
			}
			if session.ctx.resend_last().is_err() {
				self.finish_session(token);
				continue;
			}
			session.ctx.last_update = now;
		}
	}
}

fn map_open_error(e: std::io::Error, path: &std::path::Path) -> TftpError {
	match e.kind() {
		std::io::ErrorKind::NotFound => TftpError::FileNotFound(path.display().to_string()),
		std::io::ErrorKind::PermissionDenied => TftpError::AccessViolation(path.display().to_string()),
		_ => TftpError::Io(e),
	}
}

pub fn run_server(bind: SocketAddr, root: PathBuf, cancel: CancellationToken) -> Result<()> {
	let mut server = TftpServer::new(bind, root)?;
	server.run(cancel)
}
