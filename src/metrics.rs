//! Per-transfer counters, grounded in `tftpy.context.metrics.base.Metrics`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::consts::MAX_DUPS;
use crate::error::TftpError;

#[derive(Debug, Clone)]
pub struct Metrics {
	pub bytes: u64,
	pub resent_bytes: u64,
	dups: HashMap<String, u32>,
	pub dup_count: u32,
	pub out_of_order_count: u32,
	/// Non-fatal protocol anomalies: future ACKs, mismatched source ports
	/// on the very first reply, and similar events that don't abort the
	/// transfer but are worth surfacing.
	pub errors: u32,
	pub start_time: Option<Instant>,
	pub end_time: Option<Instant>,
	pub duration: Duration,
	pub bps: f64,
	pub kbps: f64,
}

impl Default for Metrics {
	fn default() -> Self {
		Self {
			bytes: 0,
			resent_bytes: 0,
			dups: HashMap::new(),
			dup_count: 0,
			out_of_order_count: 0,
			errors: 0,
			start_time: None,
			end_time: None,
			duration: Duration::ZERO,
			bps: 0.0,
			kbps: 0.0,
		}
	}
}

impl Metrics {
	pub fn start(&mut self) {
		self.start_time = Some(Instant::now());
	}

	/// Records a duplicate of `key` (a short packet descriptor, e.g.
	/// `"DATA:5"` or `"ACK:3"`). A runaway duplicate storm is fatal:
	/// once any single key's count reaches [`MAX_DUPS`], this returns an
	/// error that terminates the transfer.
	pub fn add_dup(&mut self, key: impl Into<String>) -> Result<(), TftpError> {
		let key = key.into();
		let count = self.dups.entry(key).or_insert(0);
		*count += 1;
		self.dup_count += 1;
		if *count >= MAX_DUPS {
			return Err(TftpError::Protocol("max duplicates reached".into()));
		}
		Ok(())
	}

	pub fn out_of_order(&mut self) {
		self.out_of_order_count += 1;
	}

	/// Finalizes duration and rate figures. Called once from `Context::end`.
	pub fn compute(&mut self) {
		let end = self.end_time.unwrap_or_else(Instant::now);
		let start = self.start_time.unwrap_or(end);
		self.duration = end.saturating_duration_since(start);

		let secs = self.duration.as_secs_f64().max(1.0);
		self.bps = (self.bytes as f64 * 8.0) / secs;
		self.kbps = self.bps / 1024.0;
	}
}
