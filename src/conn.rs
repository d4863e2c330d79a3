//! Per-connection protocol state.
//!
//! One task reads exact 64-byte frames and dispatches them; a second task
//! owns the write half and drains a channel of result frames. Routing every
//! result (direct replies, waiter promotions, timer notifications) through
//! that one channel keeps per-connection ordering.

use std::io;

use latch_core::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mtrcs::Metrics;
use crate::protocol::{
	self, COMMAND_LOCK, COMMAND_STATE, COMMAND_UNLOCK, FRAME_SIZE, Frame, LockCommand,
	ProtocolError,
};
use crate::service::{LockHandle, LockService};

pub async fn serve(
	service: Arc<LockService>,
	metrics: Arc<Metrics>,
	stream: TcpStream,
	peer: SocketAddr,
	conn_id: u64,
	token: CancellationToken,
) {
	info!(%peer, conn_id, "connection open");
	metrics.connections_opened.inc();
	metrics.active_connections.inc();

	let (mut reader, writer) = stream.into_split();
	let (tx, rx) = mpsc::unbounded_channel::<Frame>();
	let writer_task = tokio::spawn(write_loop(writer, rx));

	let mut last_lock: Option<LockHandle> = None;
	let mut buf = [0u8; FRAME_SIZE];
	loop {
		let read = tokio::select! {
			_ = token.cancelled() => break,
			read = reader.read_exact(&mut buf) => read,
		};
		match read {
			Ok(_) => {},
			Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
			Err(err) => {
				debug!(%peer, %err, "read failed");
				break;
			},
		}
		if let Err(err) = handle_frame(&service, &metrics, &buf, &tx, conn_id, &mut last_lock) {
			metrics.protocol_errors.inc();
			warn!(%peer, %err, "protocol error");
			let _ = tx.send(protocol::error_frame(&buf, err.result_code()));
			break;
		}
	}

	// Closing the channel lets the writer flush queued results and finish.
	drop(tx);
	let _ = writer_task.await;
	if let Some(handle) = last_lock.take() {
		service.release_on_disconnect(handle);
	}
	metrics.connections_closed.inc();
	metrics.active_connections.dec();
	info!(%peer, conn_id, "connection close");
}

fn handle_frame(
	service: &LockService,
	metrics: &Metrics,
	frame: &Frame,
	tx: &mpsc::UnboundedSender<Frame>,
	conn_id: u64,
	last_lock: &mut Option<LockHandle>,
) -> Result<(), ProtocolError> {
	match protocol::check_frame(frame)? {
		COMMAND_LOCK => {
			metrics.lock_commands.inc();
			let command = LockCommand::decode(frame);
			let (reply, acquired) = service.handle_lock(command, tx, conn_id);
			if let Some(frame) = reply {
				let _ = tx.send(frame);
			}
			if let Some(handle) = acquired {
				*last_lock = Some(handle);
			}
		},
		COMMAND_UNLOCK => {
			metrics.unlock_commands.inc();
			let _ = tx.send(service.handle_unlock(LockCommand::decode(frame)));
		},
		COMMAND_STATE => {
			metrics.state_commands.inc();
			let _ = tx.send(service.handle_state(LockCommand::decode(frame)));
		},
		other => unreachable!("check_frame admitted command type {other}"),
	}
	Ok(())
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
	while let Some(frame) = rx.recv().await {
		if let Err(err) = writer.write_all(&frame).await {
			debug!(%err, "write failed");
			break;
		}
	}
	let _ = writer.shutdown().await;
}
