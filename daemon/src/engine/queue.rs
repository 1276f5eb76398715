//! Per-destination transfer queues.
//!
//! Each destination gets one FIFO queue with two bounds: how many jobs may be
//! dispatched at once (concurrency) and how many may wait (backlog). A queue
//! also holds the at-most-one-in-flight rule: a transfer id, or a file, is
//! accepted only while no other job for it is waiting or running.

use std::{
	collections::{HashMap, HashSet, VecDeque},
	sync::Arc,
};

use ferry_core::{models::TransferJob, AgentConfig};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
	#[error("queue {0} is saturated")]
	Saturated(String),

	#[error("transfer {0} is already queued")]
	AlreadyQueued(String),

	#[error("file {file} already has transfer {holder} in flight")]
	FileBusy { file: String, holder: String },

	#[error("queue {0} is closed")]
	Closed(String),

	#[error("unknown destination: {0}")]
	UnknownDestination(String),
}

/// Lifecycle events observable on a queue. Only delivered to receivers that
/// were subscribed at emission time.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
	/// A job became available for dequeue.
	Readable,
	/// The queue holds no waiting or running work.
	Drain,
	TransferComplete { transfer_id: String, bytes_transferred: u64 },
	TransferFailed { transfer_id: String, reason: String },
}

/// How a dispatched job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
	Complete { bytes_transferred: u64 },
	Failed { reason: String },
	Interrupted { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
	pub concurrency: usize,
	pub max_backlog: usize,
}

#[derive(Default)]
struct QueueState {
	backlog: VecDeque<TransferJob>,
	reserved: usize,
	in_flight: usize,
	/// Given up on, but the method has not let go yet.
	detached: usize,
	/// Every transfer id reserved, waiting or running.
	held: HashSet<String>,
	/// file_local_id -> transfer id holding it.
	files: HashMap<String, String>,
	paused: bool,
	closed: bool,
}

impl QueueState {
	fn release(&mut self, job: &TransferJob) {
		self.held.remove(&job.transfer_id);
		if self.files.get(&job.file_local_id) == Some(&job.transfer_id) {
			self.files.remove(&job.file_local_id);
		}
	}

	fn is_idle(&self) -> bool {
		self.backlog.is_empty() && self.reserved == 0 && self.in_flight == 0 && self.detached == 0
	}
}

pub struct TransferQueue {
	destination_id: String,
	limits: QueueLimits,
	state: Mutex<QueueState>,
	ready: Notify,
	events: broadcast::Sender<QueueEvent>,
}

impl TransferQueue {
	pub fn new(destination_id: impl Into<String>, limits: QueueLimits) -> Self {
		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		Self {
			destination_id: destination_id.into(),
			limits: QueueLimits {
				concurrency: limits.concurrency.max(1),
				max_backlog: limits.max_backlog.max(1),
			},
			state: Mutex::new(QueueState::default()),
			ready: Notify::new(),
			events,
		}
	}

	pub fn destination_id(&self) -> &str {
		&self.destination_id
	}

	pub fn limits(&self) -> QueueLimits {
		self.limits
	}

	pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
		self.events.subscribe()
	}

	/// Claim a backlog slot for `job` without making it dispatchable yet.
	///
	/// Never blocks. Dropping the reservation without committing releases it.
	pub fn reserve(&self, job: TransferJob) -> Result<Reservation<'_>, QueueError> {
		let mut state = self.state.lock();

		if state.closed {
			return Err(QueueError::Closed(self.destination_id.clone()));
		}
		if state.held.contains(&job.transfer_id) {
			return Err(QueueError::AlreadyQueued(job.transfer_id));
		}
		if let Some(holder) = state.files.get(&job.file_local_id) {
			return Err(QueueError::FileBusy { file: job.file_local_id, holder: holder.clone() });
		}
		if state.backlog.len() + state.reserved >= self.limits.max_backlog {
			return Err(QueueError::Saturated(self.destination_id.clone()));
		}

		state.reserved += 1;
		state.held.insert(job.transfer_id.clone());
		state.files.insert(job.file_local_id.clone(), job.transfer_id.clone());

		Ok(Reservation { queue: self, job: Some(job) })
	}

	/// Append a job to the backlog.
	pub fn enqueue(&self, job: TransferJob) -> Result<(), QueueError> {
		self.reserve(job)?.commit();
		Ok(())
	}

	/// `enqueue` reduced to "was it accepted". A `false` is never retried here.
	pub fn offer(&self, job: TransferJob) -> bool {
		self.enqueue(job).is_ok()
	}

	fn commit(&self, job: TransferJob) {
		{
			let mut state = self.state.lock();
			state.reserved -= 1;
			if state.closed {
				state.release(&job);
				return;
			}
			debug!(destination = %self.destination_id, transfer = %job.transfer_id, "job queued");
			state.backlog.push_back(job);
		}
		self.ready.notify_waiters();
		let _ = self.events.send(QueueEvent::Readable);
	}

	fn cancel(&self, job: &TransferJob) {
		let idle = {
			let mut state = self.state.lock();
			state.reserved -= 1;
			state.release(job);
			state.is_idle()
		};
		if idle {
			let _ = self.events.send(QueueEvent::Drain);
		}
	}

	/// Next job in FIFO order.
	///
	/// Suspends until a job is waiting, the queue is not paused and a
	/// concurrency slot is free. Returns `None` once the queue is closed.
	pub async fn dequeue(&self) -> Option<TransferJob> {
		loop {
			let notified = self.ready.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			{
				let mut state = self.state.lock();
				if state.closed {
					return None;
				}
				if !state.paused && state.in_flight < self.limits.concurrency {
					if let Some(job) = state.backlog.pop_front() {
						state.in_flight += 1;
						return Some(job);
					}
				}
			}

			notified.await;
		}
	}

	/// Report a dispatched job as finished and free its slot.
	pub fn finish(&self, job: &TransferJob, outcome: JobOutcome) {
		let idle = {
			let mut state = self.state.lock();
			state.in_flight = state.in_flight.saturating_sub(1);
			state.release(job);
			state.is_idle()
		};
		self.ready.notify_waiters();

		let event = match outcome {
			JobOutcome::Complete { bytes_transferred } => QueueEvent::TransferComplete {
				transfer_id: job.transfer_id.clone(),
				bytes_transferred,
			},
			JobOutcome::Failed { reason } | JobOutcome::Interrupted { reason } => QueueEvent::TransferFailed {
				transfer_id: job.transfer_id.clone(),
				reason,
			},
		};
		let _ = self.events.send(event);
		if idle {
			let _ = self.events.send(QueueEvent::Drain);
		}
	}

	/// Free the slot of a job that was given up on while its method may still
	/// be running. The transfer and its file stay held until [`reclaim`].
	///
	/// [`reclaim`]: Self::reclaim
	pub fn detach(&self, job: &TransferJob, reason: String) {
		{
			let mut state = self.state.lock();
			state.in_flight = state.in_flight.saturating_sub(1);
			state.detached += 1;
		}
		self.ready.notify_waiters();
		let _ = self.events.send(QueueEvent::TransferFailed { transfer_id: job.transfer_id.clone(), reason });
	}

	/// The method behind a detached job has let go of it.
	pub fn reclaim(&self, job: &TransferJob) {
		let idle = {
			let mut state = self.state.lock();
			state.detached = state.detached.saturating_sub(1);
			state.release(job);
			state.is_idle()
		};
		if idle {
			let _ = self.events.send(QueueEvent::Drain);
		}
	}

	/// Stop dispatching. Waiting jobs stay queued.
	pub fn pause(&self) {
		self.state.lock().paused = true;
	}

	pub fn resume(&self) {
		self.state.lock().paused = false;
		self.ready.notify_waiters();
	}

	pub fn is_paused(&self) -> bool {
		self.state.lock().paused
	}

	/// Refuse new work and wake every waiting `dequeue`. Jobs still waiting are
	/// dropped; their records stay `queued` and go back to `new` on next start.
	pub fn close(&self) {
		{
			let mut state = self.state.lock();
			state.closed = true;
			let dropped: Vec<TransferJob> = state.backlog.drain(..).collect();
			for job in &dropped {
				state.release(job);
			}
		}
		self.ready.notify_waiters();
	}

	/// Jobs waiting for dispatch.
	pub fn len(&self) -> usize {
		self.state.lock().backlog.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn in_flight(&self) -> usize {
		self.state.lock().in_flight
	}

	pub fn is_idle(&self) -> bool {
		self.state.lock().is_idle()
	}

	/// Whether the given transfer is reserved, waiting or running here.
	pub fn holds(&self, transfer_id: &str) -> bool {
		self.state.lock().held.contains(transfer_id)
	}

	/// Transfer ids currently waiting, in dispatch order.
	pub fn waiting(&self) -> Vec<String> {
		self.state.lock().backlog.iter().map(|j| j.transfer_id.clone()).collect()
	}
}

/// A claimed backlog slot. `commit` makes the job dispatchable; dropping it
/// gives the slot back.
pub struct Reservation<'a> {
	queue: &'a TransferQueue,
	job: Option<TransferJob>,
}

impl Reservation<'_> {
	pub fn job(&self) -> &TransferJob {
		self.job.as_ref().expect("reservation holds its job until consumed")
	}

	pub fn commit(mut self) {
		if let Some(job) = self.job.take() {
			self.queue.commit(job);
		}
	}
}

impl Drop for Reservation<'_> {
	fn drop(&mut self) {
		if let Some(job) = self.job.take() {
			self.queue.cancel(&job);
		}
	}
}

/// One queue per destination, created on first use and kept for the life of
/// the process. Owned by the agent and handed to whoever needs it.
pub struct TransferQueuePool {
	config: Arc<AgentConfig>,
	queues: Mutex<HashMap<String, Arc<TransferQueue>>>,
}

impl TransferQueuePool {
	pub fn new(config: Arc<AgentConfig>) -> Self {
		Self { config, queues: Mutex::new(HashMap::new()) }
	}

	/// The queue for a configured destination.
	pub fn queue(&self, destination_id: &str) -> Result<Arc<TransferQueue>, QueueError> {
		let mut queues = self.queues.lock();
		if let Some(queue) = queues.get(destination_id) {
			return Ok(queue.clone());
		}

		let destination = self
			.config
			.destination(destination_id)
			.ok_or_else(|| QueueError::UnknownDestination(destination_id.to_string()))?;
		let limits = QueueLimits {
			concurrency: self.config.concurrency_for(destination),
			max_backlog: self.config.backlog_for(destination),
		};
		debug!(destination = destination_id, ?limits, "creating transfer queue");

		let queue = Arc::new(TransferQueue::new(destination_id, limits));
		queues.insert(destination_id.to_string(), queue.clone());
		Ok(queue)
	}

	pub fn queues(&self) -> Vec<Arc<TransferQueue>> {
		self.queues.lock().values().cloned().collect()
	}

	/// Global throttle: pause every queue created so far.
	pub fn pause_all(&self) {
		for queue in self.queues() {
			queue.pause();
		}
	}

	pub fn resume_all(&self) {
		for queue in self.queues() {
			queue.resume();
		}
	}

	pub fn close_all(&self) {
		for queue in self.queues() {
			queue.close();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{path::PathBuf, time::Duration};

	use ferry_core::{DestinationConfig, HostConfig};
	use tokio::time::timeout;

	use super::*;

	fn job(n: usize) -> TransferJob {
		TransferJob {
			transfer_id: format!("t{n}"),
			destination_id: "archive".into(),
			file_local_id: format!("file:///data/{n}"),
			source_id: "src".into(),
			file_path: PathBuf::from(format!("/data/{n}")),
			relative_path: format!("{n}"),
			size: 1024,
		}
	}

	fn queue(concurrency: usize, max_backlog: usize) -> TransferQueue {
		TransferQueue::new("archive", QueueLimits { concurrency, max_backlog })
	}

	async fn next(queue: &TransferQueue) -> Option<TransferJob> {
		timeout(Duration::from_millis(50), queue.dequeue()).await.ok().flatten()
	}

	#[tokio::test]
	async fn dispatches_up_to_concurrency_in_fifo_order() {
		let q = queue(3, 64);
		for n in 0..10 {
			assert!(q.offer(job(n)));
		}

		let mut running = Vec::new();
		for _ in 0..3 {
			running.push(next(&q).await.unwrap());
		}
		let ids: Vec<&str> = running.iter().map(|j| j.transfer_id.as_str()).collect();
		assert_eq!(ids, vec!["t0", "t1", "t2"]);

		// All three slots are taken; the rest wait in order.
		assert!(next(&q).await.is_none());
		assert_eq!(q.in_flight(), 3);
		assert_eq!(q.waiting(), (3..10).map(|n| format!("t{n}")).collect::<Vec<_>>());

		q.finish(&running[1], JobOutcome::Complete { bytes_transferred: 1024 });
		assert_eq!(next(&q).await.unwrap().transfer_id, "t3");
		assert!(next(&q).await.is_none());

		q.finish(&running[0], JobOutcome::Failed { reason: "boom".into() });
		assert_eq!(next(&q).await.unwrap().transfer_id, "t4");
	}

	#[tokio::test]
	async fn saturated_queue_rejects_without_blocking() {
		let q = queue(1, 2);
		assert!(q.offer(job(0)));
		assert!(q.offer(job(1)));

		assert_eq!(q.enqueue(job(2)), Err(QueueError::Saturated("archive".into())));
		assert!(!q.holds("t2"));

		// Dispatching one frees backlog room.
		next(&q).await.unwrap();
		assert!(q.offer(job(2)));
	}

	#[tokio::test]
	async fn same_transfer_is_held_once() {
		let q = queue(1, 8);
		assert!(q.offer(job(0)));
		assert_eq!(q.enqueue(job(0)), Err(QueueError::AlreadyQueued("t0".into())));
		assert_eq!(q.len(), 1);

		// Still held while running.
		let running = next(&q).await.unwrap();
		assert_eq!(q.enqueue(job(0)), Err(QueueError::AlreadyQueued("t0".into())));

		q.finish(&running, JobOutcome::Complete { bytes_transferred: 1 });
		assert!(q.offer(job(0)));
	}

	#[tokio::test]
	async fn one_transfer_per_file_at_a_time() {
		let q = queue(4, 8);
		let first = job(0);
		let mut second = job(1);
		second.file_local_id = first.file_local_id.clone();

		assert!(q.offer(first.clone()));
		let err = q.enqueue(second.clone()).unwrap_err();
		assert_eq!(err, QueueError::FileBusy { file: first.file_local_id.clone(), holder: "t0".into() });

		let running = next(&q).await.unwrap();
		assert!(!q.offer(second.clone()));
		q.finish(&running, JobOutcome::Complete { bytes_transferred: 1 });
		assert!(q.offer(second));
	}

	#[tokio::test]
	async fn detached_job_frees_its_slot_but_keeps_its_file() {
		let q = queue(1, 8);
		let mut events = q.subscribe();
		let first = job(0);
		let retry = job(0);
		let mut sibling = job(1);
		sibling.file_local_id = first.file_local_id.clone();

		assert!(q.offer(first));
		let running = next(&q).await.unwrap();
		q.detach(&running, "stalled".into());

		assert!(matches!(q.enqueue(retry.clone()), Err(QueueError::AlreadyQueued(_))));
		assert!(matches!(q.enqueue(sibling), Err(QueueError::FileBusy { .. })));
		assert!(q.offer(job(2)));
		assert_eq!(next(&q).await.unwrap().transfer_id, "t2");
		assert!(!q.is_idle());

		q.reclaim(&running);
		assert!(q.offer(retry));

		let seen: Vec<QueueEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
		assert!(seen.contains(&QueueEvent::TransferFailed { transfer_id: "t0".into(), reason: "stalled".into() }));
		assert!(!seen.contains(&QueueEvent::Drain));
	}

	#[tokio::test]
	async fn dropped_reservation_releases_slot() {
		let q = queue(1, 1);
		{
			let reservation = q.reserve(job(0)).unwrap();
			assert_eq!(reservation.job().transfer_id, "t0");
			assert!(matches!(q.reserve(job(1)), Err(QueueError::Saturated(_))));
		}
		assert!(!q.holds("t0"));
		assert!(q.is_idle());

		q.reserve(job(1)).unwrap().commit();
		assert_eq!(q.waiting(), vec!["t1".to_string()]);
	}

	#[tokio::test]
	async fn pause_holds_jobs_until_resume() {
		let q = Arc::new(queue(2, 8));
		q.pause();
		assert!(q.offer(job(0)));
		assert!(next(&q).await.is_none());
		assert_eq!(q.len(), 1);

		let waiter = {
			let q = q.clone();
			tokio::spawn(async move { q.dequeue().await })
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		q.resume();

		let job = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
		assert_eq!(job.transfer_id, "t0");
	}

	#[tokio::test]
	async fn close_wakes_waiting_dequeue() {
		let q = Arc::new(queue(1, 8));
		let waiter = {
			let q = q.clone();
			tokio::spawn(async move { q.dequeue().await })
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		q.close();

		assert!(timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().is_none());
		assert!(matches!(q.enqueue(job(0)), Err(QueueError::Closed(_))));
	}

	#[tokio::test]
	async fn emits_completion_and_drain() {
		let q = queue(1, 8);
		let mut events = q.subscribe();

		assert!(q.offer(job(0)));
		let running = next(&q).await.unwrap();
		q.finish(&running, JobOutcome::Complete { bytes_transferred: 1024 });

		assert_eq!(events.recv().await.unwrap(), QueueEvent::Readable);
		assert_eq!(
			events.recv().await.unwrap(),
			QueueEvent::TransferComplete { transfer_id: "t0".into(), bytes_transferred: 1024 }
		);
		assert_eq!(events.recv().await.unwrap(), QueueEvent::Drain);
	}

	fn pool_config() -> Arc<AgentConfig> {
		Arc::new(AgentConfig {
			max_async_transfers: 2,
			hosts: vec![HostConfig { id: "h".into(), transfer_method: "dummy".into(), settings: Default::default() }],
			destinations: vec![DestinationConfig {
				id: "archive".into(),
				host_id: "h".into(),
				location: PathBuf::from("/mnt/archive"),
				concurrency: None,
				max_backlog: Some(5),
			}],
			..AgentConfig::default()
		})
	}

	#[test]
	fn pool_creates_one_queue_per_destination() {
		let pool = TransferQueuePool::new(pool_config());
		let a = pool.queue("archive").unwrap();
		let b = pool.queue("archive").unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(a.limits(), QueueLimits { concurrency: 2, max_backlog: 5 });

		assert!(matches!(
			pool.queue("nowhere"),
			Err(QueueError::UnknownDestination(id)) if id == "nowhere"
		));
	}

	#[test]
	fn pool_pauses_every_queue() {
		let pool = TransferQueuePool::new(pool_config());
		let q = pool.queue("archive").unwrap();
		pool.pause_all();
		assert!(q.is_paused());
		pool.resume_all();
		assert!(!q.is_paused());
	}
}
