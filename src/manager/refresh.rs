// crates.io
use tokio::{task::JoinHandle, time::Instant};
// self
use crate::{
	_prelude::*,
	http::HttpTransport,
	manager::ServiceTokenManager,
	oauth::TransportErrorMapper,
	obs::FlowKind,
};

/// Handle to the background refresh task.
///
/// The task also stops when the manager's shutdown token is cancelled.
#[derive(Debug)]
pub struct RefreshTask {
	handle: JoinHandle<()>,
	cancel: CancellationToken,
}
impl RefreshTask {
	/// Stops the loop and waits for it to exit; an in-flight request is abandoned.
	pub async fn stop(self) {
		self.cancel.cancel();

		if let Err(e) = self.handle.await {
			tracing::error!(error = %e, "Refresh task ended abnormally.");
		}
	}

	/// Whether the loop has exited.
	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}
}

impl<C, M> ServiceTokenManager<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Spawns the refresh loop on the current tokio runtime.
	///
	/// The loop sleeps until the deadline armed by the latest successful acquisition, then
	/// refreshes with the configured retry policy. A failed cycle keeps the previous token and
	/// schedules the next cycle after the failure cooldown. Without a token the loop idles
	/// until one is installed.
	pub fn spawn_refresh(self: &Arc<Self>) -> RefreshTask {
		let cancel = self.shutdown_token().child_token();
		let handle = tokio::spawn(refresh_loop(self.clone(), cancel.clone()));

		RefreshTask { handle, cancel }
	}

	async fn refresh_cycle(&self) -> Result<()> {
		let config = self.config().snapshot();

		match self.fetch_with_retries(FlowKind::Refresh, &config.refresh_retry).await {
			Ok(_) => Ok(()),
			Err(Error::Cancelled) => Err(Error::Cancelled),
			Err(e) => {
				self.refresh_metrics().record_failed_cycle();

				tracing::error!(
					error = %e,
					kind = ?e.kind(),
					cooldown_secs = config.failure_cooldown.as_secs(),
					"Service token refresh failed; keeping the previous token."
				);

				self.schedule.send_replace(Some(Instant::now() + config.failure_cooldown));

				Err(e)
			},
		}
	}
}

async fn refresh_loop<C, M>(manager: Arc<ServiceTokenManager<C, M>>, cancel: CancellationToken)
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	let mut schedule = manager.schedule.subscribe();

	tracing::debug!("Refresh loop started.");

	loop {
		let deadline = *schedule.borrow_and_update();
		let Some(deadline) = deadline else {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => break,
				changed = schedule.changed() => if changed.is_err() { break },
			}

			continue;
		};

		tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			changed = schedule.changed() => {
				if changed.is_err() {
					break;
				}

				// Someone installed a token; re-read the deadline.
				continue;
			},
			_ = tokio::time::sleep_until(deadline) => {},
		}

		let cycle = tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			cycle = manager.refresh_cycle() => cycle,
		};

		if let Err(Error::Cancelled) = cycle {
			break;
		}
	}

	tracing::debug!("Refresh loop stopped.");
}
