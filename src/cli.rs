use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{Args, ValueEnum};
use clap::{Parser, Subcommand};

use simple_logger::SimpleLogger;

use crate::consts::{DEF_BLKSIZE, DEF_TFTP_PORT};
use crate::packet::OptionList;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Options {
	#[arg(value_enum, short, long,
		default_value_t = DebugLevel::Warn,
		help = "Debug level to determine which messages are printed", global = true
	)]
	pub debug: DebugLevel,

	#[command(subcommand)]
	pub run_mode: RunMode,
}

#[derive(Debug, Clone, ValueEnum, Default)]
pub enum DebugLevel {
	Off = 0,
	Error,

	#[default]
	Warn,
	Info,
	Debug,
	Trace,
}
impl From<DebugLevel> for log::LevelFilter {
	fn from(value: DebugLevel) -> Self {
		match value {
			DebugLevel::Off => Self::Off,
			DebugLevel::Error => Self::Error,
			DebugLevel::Warn => Self::Warn,
			DebugLevel::Info => Self::Info,
			DebugLevel::Debug => Self::Debug,
			DebugLevel::Trace => Self::Trace,
		}
	}
}

#[derive(Debug, Args, Clone)]
pub struct ClientOpts {
	#[arg(short, long, default_value_t = DEF_BLKSIZE)]
	pub blocksize: u16,

	#[arg(short, long, default_value_t = 5)]
	pub timeout: u8,

	#[arg(
		short = 'T', long, default_value_t = false,
		help = "Request (for GET) or hand over (for PUT) the transfer size"
	)]
	pub transfer_size: bool,
}

#[derive(Subcommand, Debug)]
pub enum RunMode {
	Server {
		#[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
		bind: IpAddr,

		#[arg(short, long, default_value_t = DEF_TFTP_PORT)]
		port: u16,

		#[arg(short, long, default_value = ".", help = "Root directory served to clients")]
		root: PathBuf,
	},
	Client {
		#[command(flatten)]
		client_opts: ClientOpts,

		#[command(subcommand)]
		action: ClientAction,
	},
}

#[derive(Debug, Args)]
pub struct ClientActionOpts {
	pub file: PathBuf,

	#[arg(help = "The remote server to connect to.")]
	pub server: IpAddr,

	#[arg(default_value_t = DEF_TFTP_PORT, help = "(optional) The remote port to connect to.")]
	pub port: u16,
}

#[derive(Subcommand, Debug)]
pub enum ClientAction {
	Get {
		#[command(flatten)]
		opts: ClientActionOpts,
	},
	Put {
		#[command(flatten)]
		opts: ClientActionOpts,
	},
}

impl ClientAction {
	pub fn opts(&self) -> &ClientActionOpts {
		match self {
			ClientAction::Get { opts } | ClientAction::Put { opts } => opts,
		}
	}

	pub fn is_get(&self) -> bool {
		matches!(self, ClientAction::Get { .. })
	}
}

/// Builds the RFC 2347 option list a client request should carry, from the
/// flags on [`ClientOpts`]. `tsize` is left at `0` for a GET (the server
/// fills in the real size); callers of PUT overwrite it with the source's
/// actual length once the file is open.
pub fn requested_options(opts: &ClientOpts) -> OptionList {
	let mut options = OptionList::new();
	if opts.blocksize != DEF_BLKSIZE {
		options.push(("blksize".to_string(), opts.blocksize.to_string()));
	}
	if opts.transfer_size {
		options.push(("tsize".to_string(), "0".to_string()));
	}
	options
}

pub fn init_logger(debug_level: DebugLevel) {
	SimpleLogger::new().with_level(debug_level.into()).env().init().unwrap();
}

/// Expands a leading `~` in a user-supplied path (root directory, local
/// file argument) before it's used for anything.
pub fn expand_path(path: &PathBuf) -> PathBuf {
	PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}
