//! Transfer-method plugins.
//!
//! A method moves the bytes of one file to its destination and reports back
//! through an [`EventSink`]: any number of `start`/`progress`/`verifying`
//! calls, then exactly one of `complete` or `fail`. The terminal calls consume
//! the sink, so a method cannot report both. Dropping the sink without a
//! terminal call is reported to the manager as a failure. A job the manager
//! gives up on shows up as a cancelled sink; until the method drops it, the
//! queue keeps the file held so no second copy can start.

mod dummy;
mod local;

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use ferry_core::{DestinationConfig, HostConfig};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use dummy::DummyTransfer;
pub use local::{hash_file, CopyError, LocalCopy};

#[derive(Debug, Error)]
pub enum MethodError {
	#[error("unknown transfer method: {0}")]
	UnknownMethod(String),

	#[error("invalid option {option} for {method}: {reason}")]
	InvalidOption {
		method: &'static str,
		option: &'static str,
		reason: String,
	},
}

/// Events a method emits for one job, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodEvent {
	Started { bytes: u64 },
	Progress { bytes: u64 },
	Verifying { bytes: u64 },
	Completed { bytes: u64 },
	Failed { reason: String },
}

/// Everything a method needs to deliver one file.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
	pub transfer_id: String,
	pub file_path: PathBuf,
	pub relative_path: String,
	pub size: u64,
}

/// Destination-specific configuration handed to a method factory.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodOptions {
	pub dest_base_path: PathBuf,
	pub settings: serde_json::Map<String, serde_json::Value>,
}

impl MethodOptions {
	pub fn for_destination(host: &HostConfig, destination: &DestinationConfig) -> Self {
		Self {
			dest_base_path: destination.location.clone(),
			settings: host.settings.clone(),
		}
	}

	pub fn u64_setting(&self, key: &str) -> Option<u64> {
		self.settings.get(key).and_then(|v| v.as_u64())
	}
}

/// Write side of one job's event stream.
pub struct EventSink {
	tx: mpsc::UnboundedSender<MethodEvent>,
	// Dropped with the sink; tells the manager the method has let go.
	_held: oneshot::Sender<()>,
}

impl EventSink {
	pub fn channel() -> (Self, EventStream) {
		let (tx, events) = mpsc::unbounded_channel();
		let (held, released) = oneshot::channel();
		(Self { tx, _held: held }, EventStream { events, released })
	}

	/// The manager gave up on this job. Methods should stop moving bytes
	/// and drop the sink as soon as they notice.
	pub fn is_cancelled(&self) -> bool {
		self.tx.is_closed()
	}

	/// Resolves once the job has been given up on.
	pub async fn cancelled(&self) {
		self.tx.closed().await
	}

	// Send errors mean the manager stopped listening; nothing left to tell.
	pub fn start(&self, bytes: u64) {
		let _ = self.tx.send(MethodEvent::Started { bytes });
	}

	pub fn progress(&self, bytes: u64) {
		let _ = self.tx.send(MethodEvent::Progress { bytes });
	}

	pub fn verifying(&self, bytes: u64) {
		let _ = self.tx.send(MethodEvent::Verifying { bytes });
	}

	pub fn complete(self, bytes: u64) {
		let _ = self.tx.send(MethodEvent::Completed { bytes });
	}

	pub fn fail(self, reason: impl Into<String>) {
		let _ = self.tx.send(MethodEvent::Failed { reason: reason.into() });
	}
}

/// Read side of one job's event stream.
pub struct EventStream {
	events: mpsc::UnboundedReceiver<MethodEvent>,
	released: oneshot::Receiver<()>,
}

impl EventStream {
	/// Next event; `None` once the sink is gone.
	pub async fn recv(&mut self) -> Option<MethodEvent> {
		self.events.recv().await
	}

	/// Stop listening, which the sink sees as cancellation, then wait until
	/// the method has dropped the sink.
	pub async fn abandon(self) {
		let Self { events, released } = self;
		drop(events);
		let _ = released.await;
	}
}

/// A transfer backend. One instance serves every job of one manager, so it
/// may keep connections or other state between jobs.
pub trait TransferMethod: Send + Sync {
	fn name(&self) -> &str;

	/// Start delivering `request`. Must not block; report through `events`.
	fn transfer(&self, request: TransferRequest, events: EventSink);
}

pub type MethodFactory = Arc<dyn Fn(MethodOptions) -> Result<Box<dyn TransferMethod>, MethodError> + Send + Sync>;

/// Method name -> factory.
#[derive(Clone, Default)]
pub struct MethodRegistry {
	factories: HashMap<String, MethodFactory>,
}

impl MethodRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registry with the methods that ship with the agent.
	pub fn builtin() -> Self {
		let mut registry = Self::new();
		registry.register(DummyTransfer::NAME, |options| Ok(Box::new(DummyTransfer::from_options(&options)?)));
		registry.register(LocalCopy::NAME, |options| Ok(Box::new(LocalCopy::new(options.dest_base_path))));
		registry
	}

	pub fn register<F>(&mut self, name: &str, factory: F)
	where
		F: Fn(MethodOptions) -> Result<Box<dyn TransferMethod>, MethodError> + Send + Sync + 'static,
	{
		self.factories.insert(name.to_string(), Arc::new(factory));
	}

	pub fn contains(&self, name: &str) -> bool {
		self.factories.contains_key(name)
	}

	pub fn build(&self, name: &str, options: MethodOptions) -> Result<Box<dyn TransferMethod>, MethodError> {
		let factory = self
			.factories
			.get(name)
			.ok_or_else(|| MethodError::UnknownMethod(name.to_string()))?;
		factory(options)
	}
}
