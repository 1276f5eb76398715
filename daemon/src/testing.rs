//! Test doubles shared by the daemon's unit tests.

use std::{
	path::Path,
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use ferry_core::{
	models::{FileDescriptor, Registration, TransferDescriptor, TransferStatus},
	AgentConfig, DestinationConfig, HostConfig, SourceConfig,
};
use parking_lot::Mutex;

use crate::{
	control_plane::{ControlPlane, RemoteError},
	methods::{EventSink, MethodEvent, MethodRegistry, TransferMethod, TransferRequest},
	store::LocalStore,
};

pub const SOURCE_ID: &str = "src";
pub const SOURCE_NAME: &str = "Microscope";
pub const HOST_ID: &str = "host";

/// One source delivering to every listed destination through `method`.
pub fn config(root: &Path, destinations: &[&str], method: &str) -> AgentConfig {
	AgentConfig {
		data_dir: root.join("state"),
		sweep_interval_secs: 3600,
		sources: vec![SourceConfig {
			id: SOURCE_ID.into(),
			name: SOURCE_NAME.into(),
			basepath: root.join("source"),
			exclude: Vec::new(),
			destinations: destinations.iter().map(|d| d.to_string()).collect(),
			scan_interval_secs: 3600,
		}],
		hosts: vec![HostConfig { id: HOST_ID.into(), transfer_method: method.into(), settings: Default::default() }],
		destinations: destinations
			.iter()
			.map(|id| DestinationConfig {
				id: id.to_string(),
				host_id: HOST_ID.into(),
				location: root.join("dest").join(id),
				concurrency: None,
				max_backlog: None,
			})
			.collect(),
		..AgentConfig::default()
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
	pub transfer_id: String,
	pub bytes: u64,
	pub status: TransferStatus,
}

/// Control plane that issues one transfer per destination on every
/// registration and remembers every call.
pub struct RecordingControlPlane {
	destinations: Vec<String>,
	registrations: Mutex<Vec<FileDescriptor>>,
	reports: Mutex<Vec<Report>>,
	unavailable: AtomicBool,
}

impl RecordingControlPlane {
	pub fn new(destinations: &[&str]) -> Arc<Self> {
		Arc::new(Self {
			destinations: destinations.iter().map(|d| d.to_string()).collect(),
			registrations: Mutex::new(Vec::new()),
			reports: Mutex::new(Vec::new()),
			unavailable: AtomicBool::new(false),
		})
	}

	pub fn set_unavailable(&self, unavailable: bool) {
		self.unavailable.store(unavailable, Ordering::SeqCst);
	}

	pub fn registrations(&self) -> Vec<FileDescriptor> {
		self.registrations.lock().clone()
	}

	pub fn reports(&self) -> Vec<Report> {
		self.reports.lock().clone()
	}

	pub fn statuses_for(&self, transfer_id: &str) -> Vec<TransferStatus> {
		self.reports
			.lock()
			.iter()
			.filter(|r| r.transfer_id == transfer_id)
			.map(|r| r.status)
			.collect()
	}
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
	async fn register_file(&self, descriptor: &FileDescriptor, _source_name: &str) -> Result<Registration, RemoteError> {
		if self.unavailable.load(Ordering::SeqCst) {
			return Err(RemoteError::Unavailable("connection refused".into()));
		}
		let mut registrations = self.registrations.lock();
		registrations.push(descriptor.clone());
		let round = registrations.len();

		Ok(Registration {
			remote_id: format!("remote-{}", descriptor.local_id),
			transfers: self
				.destinations
				.iter()
				.map(|dest| TransferDescriptor {
					id: format!("{dest}-{round}"),
					destination_id: dest.clone(),
					status: TransferStatus::New,
					bytes_transferred: 0,
				})
				.collect(),
		})
	}

	async fn report_transfer_progress(
		&self,
		transfer_id: &str,
		bytes: u64,
		status: TransferStatus,
	) -> Result<(), RemoteError> {
		self.reports.lock().push(Report { transfer_id: transfer_id.to_string(), bytes, status });
		if self.unavailable.load(Ordering::SeqCst) {
			return Err(RemoteError::Unavailable("connection refused".into()));
		}
		Ok(())
	}
}

/// Plays back a fixed list of events for every job. A script without a
/// terminal event ends by dropping the sink.
#[derive(Clone)]
pub struct ScriptedMethod {
	script: Vec<MethodEvent>,
}

impl ScriptedMethod {
	pub const NAME: &'static str = "scripted";

	pub fn new(script: Vec<MethodEvent>) -> Self {
		Self { script }
	}
}

impl TransferMethod for ScriptedMethod {
	fn name(&self) -> &str {
		Self::NAME
	}

	fn transfer(&self, _request: TransferRequest, events: EventSink) {
		let script = self.script.clone();
		tokio::spawn(async move {
			for event in script {
				match event {
					MethodEvent::Started { bytes } => events.start(bytes),
					MethodEvent::Progress { bytes } => events.progress(bytes),
					MethodEvent::Verifying { bytes } => events.verifying(bytes),
					MethodEvent::Completed { bytes } => return events.complete(bytes),
					MethodEvent::Failed { reason } => return events.fail(reason),
				}
			}
		});
	}
}

/// Starts every job and then goes silent. Once a job is given up on it keeps
/// "running" for `linger` before dropping the sink.
#[derive(Clone, Default)]
pub struct StallingMethod {
	linger: Duration,
	started: Arc<AtomicUsize>,
	running: Arc<AtomicUsize>,
	most_running: Arc<AtomicUsize>,
}

impl StallingMethod {
	pub const NAME: &'static str = "stalling";

	pub fn lingering(linger: Duration) -> Self {
		Self { linger, ..Self::default() }
	}

	pub fn started(&self) -> usize {
		self.started.load(Ordering::SeqCst)
	}

	/// Highest number of jobs that were running at the same time.
	pub fn most_running(&self) -> usize {
		self.most_running.load(Ordering::SeqCst)
	}
}

impl TransferMethod for StallingMethod {
	fn name(&self) -> &str {
		Self::NAME
	}

	fn transfer(&self, _request: TransferRequest, events: EventSink) {
		self.started.fetch_add(1, Ordering::SeqCst);
		let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
		self.most_running.fetch_max(now_running, Ordering::SeqCst);

		let running = self.running.clone();
		let linger = self.linger;
		tokio::spawn(async move {
			events.start(0);
			events.cancelled().await;
			tokio::time::sleep(linger).await;
			running.fetch_sub(1, Ordering::SeqCst);
			drop(events);
		});
	}
}

pub fn registry_with<M>(name: &'static str, method: M) -> MethodRegistry
where
	M: TransferMethod + Clone + 'static,
{
	let mut registry = MethodRegistry::builtin();
	registry.register(name, move |_| Ok(Box::new(method.clone())));
	registry
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
	for _ in 0..100 {
		if check() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	false
}

/// Poll the store until the transfer reaches `status` or a second passes.
pub async fn wait_for_status(store: &LocalStore, transfer_id: &str, status: TransferStatus) -> bool {
	for _ in 0..100 {
		if matches!(store.get_transfer(transfer_id).await, Ok(record) if record.status == status) {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	false
}
