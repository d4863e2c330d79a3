// Signal handling derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use tokio::sync::mpsc;
use tracing::info;

/// Resolves when the process should shut down: SIGINT, SIGTERM, or an
/// explicit [`ShutdownTrigger`]. A second SIGINT exits immediately.
pub struct Shutdown {
	tx: mpsc::Sender<&'static str>,
	rx: mpsc::Receiver<&'static str>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		Shutdown { tx, rx }
	}

	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger { tx: self.tx.clone() }
	}

	pub async fn wait(mut self) {
		let reason = tokio::select! {
			_ = wait_for_interrupt() => {
				// A second interrupt while draining means the operator wants out now.
				tokio::spawn(async {
					wait_for_interrupt().await;
					info!("second interrupt, exiting immediately");
					std::process::exit(0);
				});
				"interrupt"
			}
			_ = wait_for_terminate() => "terminate",
			r = self.rx.recv() => r.unwrap_or("trigger"),
		};
		info!(%reason, "shutdown started");
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	tx: mpsc::Sender<&'static str>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send("trigger").await;
	}
}

#[cfg(unix)]
async fn wait_for_interrupt() {
	use tokio::signal::unix::{SignalKind, signal};
	signal(SignalKind::interrupt())
		.expect("failed to register SIGINT handler")
		.recv()
		.await;
}

#[cfg(unix)]
async fn wait_for_terminate() {
	use tokio::signal::unix::{SignalKind, signal};
	signal(SignalKind::terminate())
		.expect("failed to register SIGTERM handler")
		.recv()
		.await;
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
	tokio::signal::ctrl_c()
		.await
		.expect("failed to register ctrl-c handler");
}

#[cfg(not(unix))]
async fn wait_for_terminate() {
	// No SIGTERM equivalent off unix; park forever.
	std::future::pending::<()>().await;
}
