//! End-to-end tests: a real listener, real client sockets, real timers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use prometheus_client::registry::Registry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use latchd::mtrcs::Metrics;
use latchd::protocol::{
	COMMAND_LOCK, COMMAND_STATE, COMMAND_UNLOCK, FRAME_SIZE, LockCommand, LockResultCommand,
	RESULT_EXPRIED, RESULT_SUCCESS, RESULT_TIMEOUT, RESULT_UNKNOWN_MAGIC, RESULT_UNLOCK_ERROR,
	StateResultCommand,
};
use latchd::server;
use latchd::service::LockService;

async fn start_server() -> SocketAddr {
	start_server_with(256).await
}

async fn start_server_with(databases: usize) -> SocketAddr {
	let token = CancellationToken::new();
	let service = Arc::new(LockService::new(databases, 4, 16, token.child_token()));
	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
		.await
		.expect("bind ephemeral port");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(server::run(listener, service, metrics, token.child_token()));
	addr
}

struct Client {
	stream: TcpStream,
}

impl Client {
	async fn connect(addr: SocketAddr) -> Self {
		let stream = TcpStream::connect(addr).await.expect("connect");
		Client { stream }
	}

	async fn send(&mut self, command: &LockCommand) {
		self
			.stream
			.write_all(&command.encode())
			.await
			.expect("send frame");
	}

	async fn recv(&mut self) -> LockResultCommand {
		let mut buf = [0u8; FRAME_SIZE];
		timeout(Duration::from_secs(5), self.stream.read_exact(&mut buf))
			.await
			.expect("no result within 5s")
			.expect("read frame");
		LockResultCommand::decode(&buf)
	}

	async fn recv_state(&mut self) -> StateResultCommand {
		let mut buf = [0u8; FRAME_SIZE];
		timeout(Duration::from_secs(5), self.stream.read_exact(&mut buf))
			.await
			.expect("no result within 5s")
			.expect("read frame");
		StateResultCommand::decode(&buf)
	}
}

fn lock(lock_key: u128, lock_id: u128, timeout: u32, expried: u32, count: u16) -> LockCommand {
	LockCommand {
		command_type: COMMAND_LOCK,
		request_id: rand::random(),
		flags: 0,
		db_id: 0,
		lock_id,
		lock_key,
		timeout,
		expried,
		count,
	}
}

fn unlock(lock_key: u128, lock_id: u128) -> LockCommand {
	LockCommand {
		command_type: COMMAND_UNLOCK,
		..lock(lock_key, lock_id, 0, 0, 0)
	}
}

#[tokio::test]
async fn lock_unlock_round_trip() {
	let addr = start_server().await;
	let mut client = Client::connect(addr).await;
	let key = rand::random();

	let cmd = lock(key, 1, 10, 10, 0);
	client.send(&cmd).await;
	let result = client.recv().await;
	assert_eq!(result.result, RESULT_SUCCESS);
	assert_eq!(result.request_id, cmd.request_id, "request id echoes verbatim");
	assert_eq!(result.lock_key, key);

	client.send(&unlock(key, 1)).await;
	assert_eq!(client.recv().await.result, RESULT_SUCCESS);
}

#[tokio::test]
async fn contended_lock_hands_off_on_unlock() {
	let addr = start_server().await;
	let mut holder = Client::connect(addr).await;
	let mut waiter = Client::connect(addr).await;
	let key = rand::random();

	holder.send(&lock(key, 1, 10, 10, 0)).await;
	assert_eq!(holder.recv().await.result, RESULT_SUCCESS);

	waiter.send(&lock(key, 2, 10, 10, 0)).await;
	// No reply yet; give the server a moment to enqueue the waiter.
	tokio::time::sleep(Duration::from_millis(100)).await;

	holder.send(&unlock(key, 1)).await;
	assert_eq!(holder.recv().await.result, RESULT_SUCCESS);

	let promoted = waiter.recv().await;
	assert_eq!(promoted.result, RESULT_SUCCESS);
	assert_eq!(promoted.lock_id, 2);
}

#[tokio::test]
async fn semaphore_admits_up_to_count() {
	let addr = start_server().await;
	let mut client = Client::connect(addr).await;
	let key = rand::random();

	for lock_id in [1u128, 2, 3] {
		client.send(&lock(key, lock_id, 10, 10, 3)).await;
		assert_eq!(client.recv().await.result, RESULT_SUCCESS);
	}
	client.send(&lock(key, 4, 0, 10, 3)).await;
	assert_eq!(client.recv().await.result, RESULT_TIMEOUT);
}

#[tokio::test]
async fn lock_outside_the_database_space_fails() {
	let addr = start_server_with(4).await;
	let mut client = Client::connect(addr).await;

	let mut cmd = lock(rand::random(), 1, 10, 10, 0);
	cmd.db_id = 4;
	client.send(&cmd).await;
	let result = client.recv().await;
	assert_ne!(result.result, RESULT_SUCCESS);

	// Ids below the bound still work.
	let mut cmd = lock(rand::random(), 1, 10, 10, 0);
	cmd.db_id = 3;
	client.send(&cmd).await;
	assert_eq!(client.recv().await.result, RESULT_SUCCESS);
}

#[tokio::test]
async fn unlock_of_unheld_lock_fails() {
	let addr = start_server().await;
	let mut client = Client::connect(addr).await;

	client.send(&unlock(rand::random(), 9)).await;
	assert_eq!(client.recv().await.result, RESULT_UNLOCK_ERROR);
}

#[tokio::test]
async fn waiter_times_out() {
	let addr = start_server().await;
	let mut holder = Client::connect(addr).await;
	let mut waiter = Client::connect(addr).await;
	let key = rand::random();

	holder.send(&lock(key, 1, 10, 30, 0)).await;
	assert_eq!(holder.recv().await.result, RESULT_SUCCESS);

	waiter.send(&lock(key, 2, 1, 10, 0)).await;
	let result = waiter.recv().await;
	assert_eq!(result.result, RESULT_TIMEOUT);
	assert_eq!(result.lock_id, 2);
}

#[tokio::test]
async fn holder_expires() {
	let addr = start_server().await;
	let mut client = Client::connect(addr).await;
	let key = rand::random();

	client.send(&lock(key, 1, 10, 1, 0)).await;
	assert_eq!(client.recv().await.result, RESULT_SUCCESS);

	let expired = client.recv().await;
	assert_eq!(expired.result, RESULT_EXPRIED);
	assert_eq!(expired.lock_id, 1);
}

#[tokio::test]
async fn disconnect_releases_held_lock() {
	let addr = start_server().await;
	let mut holder = Client::connect(addr).await;
	let mut waiter = Client::connect(addr).await;
	let key = rand::random();

	holder.send(&lock(key, 1, 10, 1000, 0)).await;
	assert_eq!(holder.recv().await.result, RESULT_SUCCESS);

	waiter.send(&lock(key, 2, 30, 10, 0)).await;
	tokio::time::sleep(Duration::from_millis(100)).await;
	drop(holder);

	// The dropped connection's lock is revoked on the next tick.
	let promoted = waiter.recv().await;
	assert_eq!(promoted.result, RESULT_SUCCESS);
	assert_eq!(promoted.lock_id, 2);
}

#[tokio::test]
async fn bad_magic_is_rejected_and_closes() {
	let addr = start_server().await;
	let mut client = Client::connect(addr).await;

	let mut frame = lock(1, 1, 10, 10, 0).encode();
	frame[0] = 0x13;
	client.stream.write_all(&frame).await.expect("send frame");

	let mut buf = [0u8; FRAME_SIZE];
	client.stream.read_exact(&mut buf).await.expect("error reply");
	assert_eq!(buf[19], RESULT_UNKNOWN_MAGIC);
	assert_eq!(&buf[..19], &frame[..19], "header echoes back");

	// The server hangs up after a protocol error.
	let closed = timeout(Duration::from_secs(5), client.stream.read_exact(&mut buf))
		.await
		.expect("close within 5s");
	assert!(closed.is_err());
}

#[tokio::test]
async fn state_reports_counters() {
	let addr = start_server().await;
	let mut client = Client::connect(addr).await;
	let key = rand::random();

	client.send(&lock(key, 1, 10, 10, 0)).await;
	assert_eq!(client.recv().await.result, RESULT_SUCCESS);

	let mut state_cmd = lock(0, 0, 0, 0, 0);
	state_cmd.command_type = COMMAND_STATE;
	client.send(&state_cmd).await;
	let state = client.recv_state().await;
	assert_eq!(state.result, RESULT_SUCCESS);
	assert_eq!(state.db_state, 1);
	assert_eq!(state.state.lock_count, 1);
	assert_eq!(state.state.locked_count, 1);
	assert_eq!(state.state.key_count, 1);

	// A database that was never touched has no state to report.
	let mut other_db = state_cmd;
	other_db.db_id = 7;
	client.send(&other_db).await;
	let missing = client.recv_state().await;
	assert_ne!(missing.result, RESULT_SUCCESS);
	assert_eq!(missing.db_state, 0);
}
