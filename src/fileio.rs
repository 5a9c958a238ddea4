//! The file-like capability set (§9 design note) and server-side path
//! containment (§4.7), grounded in `tftpy`'s `context.client` open-input
//! dispatch and `tftpy.states.server.server.{server_initial,make_subdirs}`.

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::consts::UPLOAD_DIR_MODE;
use crate::error::TftpError;

/// A byte source: the read side of a transfer. Behind the scenes it may be
/// an open file, stdin, or an in-memory buffer - callers of the protocol
/// engine never need to know which.
pub enum ByteSource {
	File(fs::File),
	Stdin(io::Stdin),
	Memory(Cursor<Vec<u8>>),
}

impl ByteSource {
	pub fn open_path(path: &Path) -> io::Result<Self> {
		Ok(Self::File(fs::File::open(path)?))
	}

	pub fn stdin() -> Self {
		Self::Stdin(io::stdin())
	}

	pub fn from_bytes(data: Vec<u8>) -> Self {
		Self::Memory(Cursor::new(data))
	}

	pub fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
		let mut buf = vec![0u8; max];
		let mut filled = 0;
		// A short read from a pipe isn't EOF; keep reading until the
		// buffer is full or the source is genuinely exhausted.
		while filled < max {
			let n = match self {
				Self::File(f) => f.read(&mut buf[filled..])?,
				Self::Stdin(s) => s.read(&mut buf[filled..])?,
				Self::Memory(c) => c.read(&mut buf[filled..])?,
			};
			if n == 0 {
				break;
			}
			filled += n;
		}
		buf.truncate(filled);
		Ok(buf)
	}

	/// The total size of the source, when knowable without consuming it.
	/// Used to populate `tsize` on uploads that ask for it.
	pub fn len_hint(&self) -> Option<u64> {
		match self {
			Self::File(f) => f.metadata().ok().map(|m| m.len()),
			Self::Stdin(_) => None,
			Self::Memory(c) => Some(c.get_ref().len() as u64),
		}
	}
}

/// A byte sink: the write side of a transfer.
pub enum ByteSink {
	File(fs::File),
	Stdout(io::Stdout),
	Memory(Vec<u8>),
}

impl ByteSink {
	pub fn create_path(path: &Path) -> io::Result<Self> {
		Ok(Self::File(fs::File::create(path)?))
	}

	pub fn stdout() -> Self {
		Self::Stdout(io::stdout())
	}

	pub fn in_memory() -> Self {
		Self::Memory(Vec::new())
	}

	pub fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
		match self {
			Self::File(f) => f.write_all(data),
			Self::Stdout(s) => s.write_all(data),
			Self::Memory(v) => {
				v.extend_from_slice(data);
				Ok(())
			}
		}
	}

	pub fn close(&mut self) -> io::Result<()> {
		match self {
			Self::File(f) => f.flush(),
			Self::Stdout(s) => s.flush(),
			Self::Memory(_) => Ok(()),
		}
	}

	/// Takes the accumulated bytes out of an in-memory sink. Empty for
	/// file/stdout sinks.
	pub fn into_memory(self) -> Option<Vec<u8>> {
		match self {
			Self::Memory(v) => Some(v),
			_ => None,
		}
	}
}

/// Resolves a client-requested filename against the server root per §4.7,
/// rejecting any path that would escape it (e.g. via `../`).
pub fn resolve_server_path(root: &Path, requested: &str) -> Result<PathBuf, TftpError> {
	let root = normalize(root);

	let candidate = if requested.starts_with(&*root.to_string_lossy()) {
		PathBuf::from(requested)
	} else {
		root.join(requested.trim_start_matches('/'))
	};

	let resolved = normalize(&candidate);
	if resolved.starts_with(&root) {
		Ok(resolved)
	} else {
		Err(TftpError::AccessViolation(format!("{requested:?} escapes server root")))
	}
}

/// Lexically normalizes a path (resolves `.` and `..` without touching the
/// filesystem - the path need not exist yet, which matters for WRQ targets).
fn normalize(path: &Path) -> PathBuf {
	let mut out = PathBuf::new();
	for component in path.components() {
		match component {
			Component::ParentDir => {
				out.pop();
			}
			Component::CurDir => {}
			other => out.push(other.as_os_str()),
		}
	}
	out
}

/// Creates the subdirectories between `root` and `full_path`, as needed for
/// an upload target. Re-validates containment at each component boundary
/// rather than assuming the final containment check covers every
/// intermediate directory.
pub fn create_upload_dirs(root: &Path, full_path: &Path) -> Result<(), TftpError> {
	let root = normalize(root);
	let parent = match full_path.parent() {
		Some(p) => p,
		None => return Ok(()),
	};

	let mut current = root.clone();
	let Ok(relative) = parent.strip_prefix(&root) else {
		return Err(TftpError::AccessViolation("upload target escapes server root".into()));
	};

	for component in relative.components() {
		current.push(component.as_os_str());
		if !current.starts_with(&root) {
			return Err(TftpError::AccessViolation("upload path escapes server root mid-traversal".into()));
		}
		if !current.is_dir() {
			make_dir(&current)?;
		}
	}
	Ok(())
}

#[cfg(unix)]
fn make_dir(path: &Path) -> Result<(), TftpError> {
	use std::os::unix::fs::DirBuilderExt;
	fs::DirBuilder::new().mode(UPLOAD_DIR_MODE).create(path).map_err(TftpError::from)
}

#[cfg(not(unix))]
fn make_dir(path: &Path) -> Result<(), TftpError> {
	fs::create_dir(path).map_err(TftpError::from)
}
