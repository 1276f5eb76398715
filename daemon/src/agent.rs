//! Composition root.
//!
//! The agent owns the store, the queue pool, the control-plane client and the
//! method registry, and wires one manager per destination, one reactor and one
//! scan loop per source around them.

use std::{sync::Arc, time::Duration};

use ferry_core::AgentConfig;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};

use crate::{
	control_plane::ControlPlane,
	engine::{ChangeReactor, ManagerError, TransferManager, TransferQueuePool},
	methods::MethodRegistry,
	store::{LocalStore, StoreError},
	watcher::{FileWatcher, ScanSummary, WatchError},
};

#[derive(Debug, Error)]
pub enum AgentError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Manager(#[from] ManagerError),
}

pub struct Agent {
	config: Arc<AgentConfig>,
	store: LocalStore,
	pool: Arc<TransferQueuePool>,
	control: Arc<dyn ControlPlane>,
	registry: MethodRegistry,
}

impl Agent {
	pub fn new(
		config: Arc<AgentConfig>,
		store: LocalStore,
		control: Arc<dyn ControlPlane>,
		registry: MethodRegistry,
	) -> Self {
		let pool = Arc::new(TransferQueuePool::new(config.clone()));
		Self { config, store, pool, control, registry }
	}

	pub fn config(&self) -> &AgentConfig {
		&self.config
	}

	pub fn store(&self) -> &LocalStore {
		&self.store
	}

	pub fn pool(&self) -> &Arc<TransferQueuePool> {
		&self.pool
	}

	/// One discovery pass over every source, without transferring anything.
	pub async fn scan_all(&self) -> Vec<(String, Result<ScanSummary, WatchError>)> {
		let mut results = Vec::with_capacity(self.config.sources.len());
		for source in &self.config.sources {
			let watcher = FileWatcher::new(source.clone(), self.store.clone(), self.control.clone());
			results.push((source.id.clone(), watcher.scan().await));
		}
		results
	}

	/// Recover orphans from the last run, then start every loop.
	pub async fn start(&self) -> Result<AgentHandle, AgentError> {
		// 1. Anything still queued or in flight belongs to a dead process
		let recovery = self.store.recover_interrupted().await?;
		if recovery.requeued > 0 || recovery.interrupted > 0 {
			info!(requeued = recovery.requeued, interrupted = recovery.interrupted, "recovered transfers from last run");
		}

		// 2. Resolve every destination's method before spawning anything
		let mut managers = Vec::with_capacity(self.config.destinations.len());
		for destination in &self.config.destinations {
			managers.push(Arc::new(TransferManager::new(
				&destination.id,
				&self.config,
				&self.pool,
				self.store.clone(),
				self.control.clone(),
				&self.registry,
			)?));
		}

		let (shutdown, shutdown_rx) = watch::channel(false);
		let mut tasks = Vec::new();

		// 3. Dispatch loops
		for manager in &managers {
			tasks.push(tokio::spawn(manager.clone().run(shutdown_rx.clone())));
		}

		// 4. Reactor (runs the startup sweep itself)
		let reactor = ChangeReactor::new(self.config.clone(), self.store.clone(), self.pool.clone(), self.control.clone());
		tasks.push(tokio::spawn(reactor.run(shutdown_rx.clone())));

		// 5. Discovery
		for source in &self.config.sources {
			let watcher = FileWatcher::new(source.clone(), self.store.clone(), self.control.clone());
			let period = Duration::from_secs(source.scan_interval_secs.max(1));
			tasks.push(tokio::spawn(scan_loop(watcher, period, shutdown_rx.clone())));
		}

		info!(
			sources = self.config.sources.len(),
			destinations = managers.len(),
			"agent started"
		);
		Ok(AgentHandle { shutdown, pool: self.pool.clone(), managers, tasks })
	}
}

async fn scan_loop(watcher: FileWatcher, period: Duration, mut shutdown: watch::Receiver<bool>) {
	let mut ticks = tokio::time::interval(period);
	ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			biased;
			changed = shutdown.changed() => {
				if changed.is_err() || *shutdown.borrow() {
					break;
				}
			}
			_ = ticks.tick() => {
				if let Err(e) = watcher.scan().await {
					warn!(source = %watcher.source().id, error = %e, "scan failed");
				}
			}
		}
	}
}

/// Running agent.
pub struct AgentHandle {
	shutdown: watch::Sender<bool>,
	pool: Arc<TransferQueuePool>,
	managers: Vec<Arc<TransferManager>>,
	tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
	pub fn managers(&self) -> &[Arc<TransferManager>] {
		&self.managers
	}

	pub fn manager(&self, destination_id: &str) -> Option<&Arc<TransferManager>> {
		self.managers.iter().find(|m| m.destination_id() == destination_id)
	}

	pub fn pause_all(&self) {
		self.pool.pause_all();
	}

	pub fn resume_all(&self) {
		self.pool.resume_all();
	}

	/// Stop scanning, reacting and dispatching, and wait for the loops to end.
	///
	/// Jobs already handed to a method are not awaited; whatever they leave
	/// behind in flight is marked interrupted on the next start.
	pub async fn shutdown(self) {
		info!("agent shutting down");
		let _ = self.shutdown.send(true);
		self.pool.close_all();
		for task in self.tasks {
			if let Err(e) = task.await {
				warn!(error = %e, "agent task ended abnormally");
			}
		}
		info!("agent stopped");
	}
}
