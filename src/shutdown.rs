//! Graceful shutdown signaling, adapted from the teacher's
//! `core/signal.rs`: a `Shutdown` handle awaited by the main loop, paired
//! with cloneable `ShutdownTrigger`s any task can use to request shutdown
//! without owning the receiver. `destroy` in §5 ("Shutdown") maps onto
//! `wait()` returning: callers stop background timers and drain in-flight
//! work once it resolves.

use tokio::sync::mpsc;

pub struct Shutdown {
	shutdown_tx: mpsc::Sender<()>,
	shutdown_rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
		Shutdown { shutdown_tx, shutdown_rx }
	}

	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			shutdown_tx: self.shutdown_tx.clone(),
		}
	}

	/// Resolves once a shutdown signal (SIGINT/SIGTERM, or an explicit
	/// trigger) has been received.
	pub async fn wait(mut self) {
		imp::shutdown(&mut self.shutdown_rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.shutdown_tx.send(()).await;
	}
}

#[cfg(unix)]
mod imp {
	use std::process;

	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn shutdown(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_signal(SignalKind::interrupt(), "SIGINT") => {
				tokio::spawn(async move {
					watch_signal(SignalKind::interrupt(), "SIGINT").await;
					info!("double Ctrl+C, exiting immediately");
					process::exit(0);
				});
			}
			_ = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
			_ = receiver.recv() => { info!("received explicit shutdown signal") }
		};
	}

	async fn watch_signal(kind: SignalKind, name: &'static str) {
		signal(kind).expect("failed to register signal handler").recv().await;
		info!("received signal {name}, starting shutdown");
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn shutdown(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_signal() => {}
			_ = receiver.recv() => { info!("received explicit shutdown signal") }
		};
	}

	async fn watch_signal() {
		tokio::signal::windows::ctrl_c().expect("failed to register signal handler").recv().await;
		info!("received signal, starting shutdown");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn explicit_trigger_resolves_wait() {
		let shutdown = Shutdown::new();
		let trigger = shutdown.trigger();
		let waiter = tokio::spawn(shutdown.wait());
		trigger.shutdown_now().await;
		tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await.unwrap().unwrap();
	}
}
