use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::cli::{self, ClientOpts};
use crate::context::{Context, FileSlot};
use crate::error::{Result, TftpError};
use crate::fileio::{ByteSink, ByteSource};
use crate::metrics::Metrics;
use crate::packet::{Mode, Packet};
use crate::state::{self, State};

/// The client side of the engine: a single blocking socket, driven through
/// `run_to_completion` the same way a server session is.
pub struct TftpClient {
	local_addr: IpAddr,
}

impl TftpClient {
	pub fn new(local_addr: IpAddr) -> Self {
		Self { local_addr }
	}

	fn bind(&self, timeout: Duration) -> Result<UdpSocket> {
		let sock = UdpSocket::bind(SocketAddr::new(self.local_addr, 0))?;
		sock.set_read_timeout(Some(timeout))?;
		Ok(sock)
	}

	/// GET: downloads `remote_filename` from `server` into `sink`.
	pub fn download(&self, server: SocketAddr, remote_filename: &str, sink: ByteSink, opts: &ClientOpts) -> Result<Metrics> {
		let timeout = Duration::from_secs(opts.timeout as u64);
		let sock = self.bind(timeout)?;
		let mut ctx = Context::new(sock, server.ip(), server.port(), timeout);
		ctx.mode = Mode::Octet;
		ctx.file_to_transfer = remote_filename.to_string();
		ctx.file = FileSlot::Sink(sink);

		let request = Packet::ReadRq {
			filename: remote_filename.to_string(),
			mode: Mode::Octet,
			options: cli::requested_options(opts),
		};
		ctx.send_initial(&request)?;

		state::run_to_completion(&mut ctx, State::SentReadRq)?;
		ctx.end();
		Ok(ctx.metrics.clone())
	}

	/// PUT: uploads `source` to `server`, to be stored as `remote_filename`.
	pub fn upload(&self, server: SocketAddr, remote_filename: &str, source: ByteSource, opts: &ClientOpts) -> Result<Metrics> {
		let timeout = Duration::from_secs(opts.timeout as u64);
		let sock = self.bind(timeout)?;
		let mut ctx = Context::new(sock, server.ip(), server.port(), timeout);
		ctx.mode = Mode::Octet;
		ctx.file_to_transfer = remote_filename.to_string();

		let mut options = cli::requested_options(opts);
		if let Some(entry) = options.iter_mut().find(|(k, _)| k == "tsize") {
			if let Some(len) = source.len_hint() {
				entry.1 = len.to_string();
			}
		}
		ctx.file = FileSlot::Source(source);

		let request = Packet::WriteRq { filename: remote_filename.to_string(), mode: Mode::Octet, options };
		ctx.send_initial(&request)?;

		state::run_to_completion(&mut ctx, State::SentWriteRq)?;
		ctx.end();
		Ok(ctx.metrics.clone())
	}
}

pub fn run_client(action: cli::ClientAction, client_opts: ClientOpts) -> Result<()> {
	let local_addr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
	let client = TftpClient::new(local_addr);

	let req_opts = action.opts();
	let server = SocketAddr::from((req_opts.server, req_opts.port));
	let local_path = cli::expand_path(&req_opts.file);
	let remote_filename = req_opts.file.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

	let metrics = if action.is_get() {
		let sink = ByteSink::create_path(&local_path).map_err(TftpError::Io)?;
		client.download(server, &remote_filename, sink, &client_opts)?
	} else {
		let source = ByteSource::open_path(&local_path).map_err(TftpError::Io)?;
		client.upload(server, &remote_filename, source, &client_opts)?
	};

	info!("transfer complete: {} bytes in {:.2}s ({:.1} kbps)", metrics.bytes, metrics.duration.as_secs_f64(), metrics.kbps);
	Ok(())
}
