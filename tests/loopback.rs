//! End-to-end loopback tests: a real `TftpServer` on an OS-assigned port,
//! driven by the `TftpClient` against it, both over actual UDP sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use tftp_core::cli::ClientOpts;
use tftp_core::client::TftpClient;
use tftp_core::fileio::{ByteSink, ByteSource};
use tftp_core::server::TftpServer;
use tftp_core::{Mode, Packet, TftpError};

fn default_opts() -> ClientOpts {
	ClientOpts { blocksize: 512, timeout: 2, transfer_size: false }
}

fn start_server(root: std::path::PathBuf) -> (SocketAddr, CancellationToken, thread::JoinHandle<()>) {
	let mut server = TftpServer::new(SocketAddr::from(([127, 0, 0, 1], 0)), root).expect("server should bind");
	let addr = server.local_addr().unwrap();
	let cancel = CancellationToken::new();
	let cancel_in_thread = cancel.clone();
	let handle = thread::spawn(move || {
		let _ = server.run(cancel_in_thread);
	});
	(addr, cancel, handle)
}

fn stop_server(cancel: CancellationToken, handle: thread::JoinHandle<()>) {
	cancel.cancel();
	handle.join().expect("server thread should exit cleanly");
}

#[test]
fn download_roundtrip_single_block() {
	let server_root = tempfile::tempdir().unwrap();
	std::fs::write(server_root.path().join("greeting.txt"), b"hello tftp").unwrap();
	let (addr, cancel, handle) = start_server(server_root.path().to_path_buf());

	let download_dir = tempfile::tempdir().unwrap();
	let dest = download_dir.path().join("out.txt");
	let client = TftpClient::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
	let sink = ByteSink::create_path(&dest).unwrap();
	let metrics = client.download(addr, "greeting.txt", sink, &default_opts()).unwrap();

	assert_eq!(metrics.bytes, 10);
	assert_eq!(std::fs::read(&dest).unwrap(), b"hello tftp");
	stop_server(cancel, handle);
}

#[test]
fn download_roundtrip_spans_multiple_blocks() {
	let server_root = tempfile::tempdir().unwrap();
	// Exactly three 8-byte blocks plus a trailing empty one, to exercise
	// the "file size is a multiple of blksize" edge case (§8 S2-style).
	let payload: Vec<u8> = (0..24u8).collect();
	std::fs::write(server_root.path().join("data.bin"), &payload).unwrap();
	let (addr, cancel, handle) = start_server(server_root.path().to_path_buf());

	let download_dir = tempfile::tempdir().unwrap();
	let dest = download_dir.path().join("data.bin");
	let client = TftpClient::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
	let sink = ByteSink::create_path(&dest).unwrap();
	let opts = ClientOpts { blocksize: 8, ..default_opts() };
	let metrics = client.download(addr, "data.bin", sink, &opts).unwrap();

	assert_eq!(metrics.bytes, 24);
	assert_eq!(std::fs::read(&dest).unwrap(), payload);
	stop_server(cancel, handle);
}

#[test]
fn upload_roundtrip_creates_file_on_server() {
	let server_root = tempfile::tempdir().unwrap();
	let (addr, cancel, handle) = start_server(server_root.path().to_path_buf());

	let upload_dir = tempfile::tempdir().unwrap();
	let local_path = upload_dir.path().join("upload.bin");
	std::fs::write(&local_path, b"uploaded payload").unwrap();

	let client = TftpClient::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
	let source = ByteSource::open_path(&local_path).unwrap();
	let metrics = client.upload(addr, "upload.bin", source, &default_opts()).unwrap();

	assert_eq!(metrics.bytes, 16);
	assert_eq!(std::fs::read(server_root.path().join("upload.bin")).unwrap(), b"uploaded payload");
	stop_server(cancel, handle);
}

#[test]
fn blksize_option_is_negotiated_and_honored() {
	let server_root = tempfile::tempdir().unwrap();
	let payload = vec![42u8; 100];
	std::fs::write(server_root.path().join("small.bin"), &payload).unwrap();
	let (addr, cancel, handle) = start_server(server_root.path().to_path_buf());

	let download_dir = tempfile::tempdir().unwrap();
	let dest = download_dir.path().join("small.bin");
	let client = TftpClient::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
	let sink = ByteSink::create_path(&dest).unwrap();
	let opts = ClientOpts { blocksize: 16, ..default_opts() };
	let metrics = client.download(addr, "small.bin", sink, &opts).unwrap();

	assert_eq!(metrics.bytes, 100);
	assert_eq!(std::fs::read(&dest).unwrap(), payload);
	stop_server(cancel, handle);
}

#[test]
fn download_of_missing_file_fails() {
	let server_root = tempfile::tempdir().unwrap();
	let (addr, cancel, handle) = start_server(server_root.path().to_path_buf());

	let download_dir = tempfile::tempdir().unwrap();
	let dest = download_dir.path().join("out.txt");
	let client = TftpClient::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
	let sink = ByteSink::create_path(&dest).unwrap();
	let result = client.download(addr, "does-not-exist.txt", sink, &default_opts());

	assert!(result.is_err());
	stop_server(cancel, handle);
}

#[test]
fn path_traversal_outside_root_is_rejected() {
	let server_root = tempfile::tempdir().unwrap();
	let (addr, cancel, handle) = start_server(server_root.path().to_path_buf());

	let download_dir = tempfile::tempdir().unwrap();
	let dest = download_dir.path().join("out.txt");
	let client = TftpClient::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
	let sink = ByteSink::create_path(&dest).unwrap();
	let result = client.download(addr, "../../etc/passwd", sink, &default_opts());

	assert!(result.is_err());
	stop_server(cancel, handle);
}

#[test]
fn upload_into_nested_subdir_creates_directories() {
	let server_root = tempfile::tempdir().unwrap();
	let (addr, cancel, handle) = start_server(server_root.path().to_path_buf());

	let upload_dir = tempfile::tempdir().unwrap();
	let local_path = upload_dir.path().join("nested.bin");
	std::fs::write(&local_path, b"nested payload").unwrap();

	let client = TftpClient::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
	let source = ByteSource::open_path(&local_path).unwrap();
	client.upload(addr, "a/b/nested.bin", source, &default_opts()).unwrap();

	assert_eq!(std::fs::read(server_root.path().join("a/b/nested.bin")).unwrap(), b"nested payload");
	stop_server(cancel, handle);
}

#[test]
fn upload_rejected_by_write_hook_surfaces_access_violation() {
	let server_root = tempfile::tempdir().unwrap();
	let mut server = TftpServer::new(SocketAddr::from(([127, 0, 0, 1], 0)), server_root.path().to_path_buf())
		.expect("server should bind")
		.with_write_hook(Arc::new(|_path, _addr, _port| None));
	let addr = server.local_addr().unwrap();
	let cancel = CancellationToken::new();
	let cancel_in_thread = cancel.clone();
	let handle = thread::spawn(move || {
		let _ = server.run(cancel_in_thread);
	});

	let upload_dir = tempfile::tempdir().unwrap();
	let local_path = upload_dir.path().join("rejected.bin");
	std::fs::write(&local_path, b"should not land").unwrap();

	let client = TftpClient::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
	let source = ByteSource::open_path(&local_path).unwrap();
	let result = client.upload(addr, "rejected.bin", source, &default_opts());

	match result {
		Err(TftpError::Peer { code, .. }) => assert_eq!(code, 2),
		other => panic!("expected a peer ERROR 2 (access violation), got {other:?}"),
	}
	assert!(!server_root.path().join("rejected.bin").exists());
	stop_server(cancel, handle);
}

#[test]
fn duplicate_data_block_during_upload_does_not_corrupt_file() {
	let server_root = tempfile::tempdir().unwrap();
	let (addr, cancel, handle) = start_server(server_root.path().to_path_buf());

	let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
	sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

	let wrq = Packet::WriteRq { filename: "dup.bin".into(), mode: Mode::Octet, options: vec![] };
	sock.send_to(&wrq.encode(), addr).unwrap();

	let mut buf = [0u8; 1024];
	let (n, server_addr) = sock.recv_from(&mut buf).unwrap();
	assert_eq!(Packet::decode(&buf[..n]).unwrap(), Packet::Ack { block: 0 });

	// A full (non-final) block, replayed once before the real follow-up -
	// the replay must re-ack without writing the payload twice.
	let payload = vec![7u8; 512];
	let data1 = Packet::Data { block: 1, data: payload.clone() };
	sock.send_to(&data1.encode(), server_addr).unwrap();
	let (n, _) = sock.recv_from(&mut buf).unwrap();
	assert_eq!(Packet::decode(&buf[..n]).unwrap(), Packet::Ack { block: 1 });

	sock.send_to(&data1.encode(), server_addr).unwrap();
	let (n, _) = sock.recv_from(&mut buf).unwrap();
	assert_eq!(Packet::decode(&buf[..n]).unwrap(), Packet::Ack { block: 1 });

	let fin = Packet::Data { block: 2, data: vec![] };
	sock.send_to(&fin.encode(), server_addr).unwrap();
	let (n, _) = sock.recv_from(&mut buf).unwrap();
	assert_eq!(Packet::decode(&buf[..n]).unwrap(), Packet::Ack { block: 2 });

	assert_eq!(std::fs::read(server_root.path().join("dup.bin")).unwrap(), payload);
	stop_server(cancel, handle);
}

#[test]
fn packet_from_wrong_tid_is_discarded_without_changing_state() {
	let server_root = tempfile::tempdir().unwrap();
	let (addr, cancel, handle) = start_server(server_root.path().to_path_buf());

	let client_sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
	client_sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
	let impostor_sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
	impostor_sock.set_read_timeout(Some(Duration::from_millis(300))).unwrap();

	let wrq = Packet::WriteRq { filename: "tid.bin".into(), mode: Mode::Octet, options: vec![] };
	client_sock.send_to(&wrq.encode(), addr).unwrap();

	let mut buf = [0u8; 1024];
	let (n, server_addr) = client_sock.recv_from(&mut buf).unwrap();
	assert_eq!(Packet::decode(&buf[..n]).unwrap(), Packet::Ack { block: 0 });

	// An impostor on a different local port tries to inject a data block;
	// the server must silently discard it rather than ack or abort.
	let forged = Packet::Data { block: 1, data: b"forged".to_vec() };
	impostor_sock.send_to(&forged.encode(), server_addr).unwrap();
	assert!(impostor_sock.recv_from(&mut buf).is_err(), "server must not reply to a non-matching TID");

	// The real client's block 1 still completes the transfer normally.
	let real = Packet::Data { block: 1, data: b"real payload".to_vec() };
	client_sock.send_to(&real.encode(), server_addr).unwrap();
	let (n, _) = client_sock.recv_from(&mut buf).unwrap();
	assert_eq!(Packet::decode(&buf[..n]).unwrap(), Packet::Ack { block: 1 });

	let fin = Packet::Data { block: 2, data: vec![] };
	client_sock.send_to(&fin.encode(), server_addr).unwrap();
	let (n, _) = client_sock.recv_from(&mut buf).unwrap();
	assert_eq!(Packet::decode(&buf[..n]).unwrap(), Packet::Ack { block: 2 });

	assert_eq!(std::fs::read(server_root.path().join("tid.bin")).unwrap(), b"real payload");
	stop_server(cancel, handle);
}

#[test]
fn download_from_silent_peer_times_out_after_bounded_retries() {
	// A "peer" that accepts the request but never replies - the retry
	// policy must give up after exactly TIMEOUT_RETRIES timeouts (§4.8, S7).
	let black_hole = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
	black_hole.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
	let addr = black_hole.local_addr().unwrap();

	let stop = Arc::new(AtomicBool::new(false));
	let stop_in_thread = stop.clone();
	let drainer = thread::spawn(move || {
		let mut buf = [0u8; 1024];
		while !stop_in_thread.load(Ordering::Relaxed) {
			let _ = black_hole.recv_from(&mut buf);
		}
	});

	let download_dir = tempfile::tempdir().unwrap();
	let dest = download_dir.path().join("out.txt");
	let client = TftpClient::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
	let sink = ByteSink::create_path(&dest).unwrap();
	let opts = ClientOpts { timeout: 1, ..default_opts() };

	let started = Instant::now();
	let result = client.download(addr, "anything.bin", sink, &opts);
	let elapsed = started.elapsed();

	assert!(result.is_err());
	// TIMEOUT_RETRIES=5 at a 1s timeout: 4 resends plus the original wait,
	// then the 5th timeout is fatal - bounded below by 5s of real waiting.
	assert!(elapsed >= Duration::from_secs(5), "expected at least 5s of retries, got {elapsed:?}");

	stop.store(true, Ordering::Relaxed);
	drainer.join().unwrap();
}
