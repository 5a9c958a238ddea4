use std::net::SocketAddr;

use clap::Parser;
use log::error;
use tokio_util::sync::CancellationToken;

use tftp_core::cli;

fn main() {
	let options = cli::Options::parse();
	cli::init_logger(options.debug);

	let cancel = CancellationToken::new();
	let sigint_cancel = cancel.clone();
	ctrlc::set_handler(move || {
		sigint_cancel.cancel();
	})
	.expect("failed to install SIGINT handler");

	let result = match options.run_mode {
		cli::RunMode::Server { bind, port, root } => {
			let listen_addr = SocketAddr::from((bind, port));
			tftp_core::server::run_server(listen_addr, cli::expand_path(&root), cancel)
		}
		cli::RunMode::Client { client_opts, action } => tftp_core::client::run_client(action, client_opts),
	};

	if let Err(e) = result {
		error!("{e}");
		std::process::exit(1);
	}
}
