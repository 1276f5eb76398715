use std::time::Duration;

use tracing::debug;

use super::{EventSink, MethodError, MethodOptions, TransferMethod, TransferRequest};

const DEFAULT_STEPS: u64 = 10;

/// Simulated transfer: reports progress in equal steps and always succeeds.
/// Useful for exercising queues and the control plane without moving bytes.
#[derive(Debug, Clone)]
pub struct DummyTransfer {
	steps: u64,
	delay: Duration,
}

impl DummyTransfer {
	pub const NAME: &'static str = "dummy";

	pub fn new(steps: u64, delay: Duration) -> Self {
		Self { steps: steps.max(1), delay }
	}

	/// Settings: `steps` (default 10), `delay_ms` between steps (default 0).
	pub fn from_options(options: &MethodOptions) -> Result<Self, MethodError> {
		let steps = options.u64_setting("steps").unwrap_or(DEFAULT_STEPS);
		if steps == 0 {
			return Err(MethodError::InvalidOption {
				method: Self::NAME,
				option: "steps",
				reason: "must be at least 1".into(),
			});
		}
		let delay = Duration::from_millis(options.u64_setting("delay_ms").unwrap_or(0));
		Ok(Self::new(steps, delay))
	}
}

impl TransferMethod for DummyTransfer {
	fn name(&self) -> &str {
		Self::NAME
	}

	fn transfer(&self, request: TransferRequest, events: EventSink) {
		let steps = self.steps;
		let delay = self.delay;

		tokio::spawn(async move {
			debug!(transfer = %request.transfer_id, path = %request.file_path.display(), "simulating transfer");
			events.start(0);
			for step in 1..steps {
				if !delay.is_zero() {
					tokio::time::sleep(delay).await;
				}
				if events.is_cancelled() {
					debug!(transfer = %request.transfer_id, "simulation cancelled");
					return;
				}
				events.progress(request.size * step / steps);
			}
			if !delay.is_zero() {
				tokio::time::sleep(delay).await;
			}
			events.complete(request.size);
		});
	}
}
