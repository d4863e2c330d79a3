//! TCP accept loop.

use std::sync::atomic::{AtomicU64, Ordering};

use latch_core::prelude::*;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::conn;
use crate::mtrcs::Metrics;
use crate::service::LockService;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Accept connections until the token is cancelled, spawning one session
/// task per connection.
pub async fn run(
	listener: TcpListener,
	service: Arc<LockService>,
	metrics: Arc<Metrics>,
	token: CancellationToken,
) {
	if let Ok(addr) = listener.local_addr() {
		info!(%addr, "listening");
	}
	loop {
		let accepted = tokio::select! {
			_ = token.cancelled() => break,
			accepted = listener.accept() => accepted,
		};
		match accepted {
			Ok((stream, peer)) => {
				if let Err(err) = stream.set_nodelay(true) {
					debug!(%peer, %err, "failed to set nodelay");
				}
				let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
				tokio::spawn(conn::serve(
					service.clone(),
					metrics.clone(),
					stream,
					peer,
					conn_id,
					token.child_token(),
				));
			},
			Err(err) => warn!(%err, "accept failed"),
		}
	}
	info!("listener stopped");
}
