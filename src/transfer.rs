//! Deferred GPU transfers.
//!
//! Anything that wants to copy, fill, clear or transition something on the device enqueues a
//! [TransferJob] instead of recording into a command buffer directly. Jobs pile up until
//! [TransferScheduler::flush], which records every one of them into a single command buffer, submits
//! it once, waits for the device, and then runs the post-flush cleanups the jobs registered (freeing
//! staging memory, destroying buffers that were grown out of, and so on).
//!
//! The scheduler lock is the innermost lock of the arena. Jobs run while it is held, so a job must
//! never touch a pool or the staging arena while recording. Anything like that belongs in an
//! [Recorder::after_completion] cleanup, which runs after the lock is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::device::{CommandBuffer, DeviceError, GpuDevice};

/// Records commands for one deferred transfer. Runs exactly once, during a flush.
pub type TransferJob = Box<dyn FnOnce(&mut Recorder<'_>) + Send>;
/// Runs once the submission containing the commands it belongs to has completed.
pub type PostflushJob = Box<dyn FnOnce() + Send>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
	#[error("Submitting transfers to the device failed: {0}")]
	Submit(#[from] DeviceError),
	#[error("A previous submission failed, so this transfer scheduler can no longer be used")]
	Poisoned,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
	/// Jobs recorded into the submitted command buffer.
	pub jobs: usize,
	pub commands: usize,
	pub postflush_jobs: usize,
	/// Which submission this was, starting at 1.
	pub cycle: u64,
	pub elapsed: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
	/// Nothing was enqueued. The device wasn't touched.
	Idle,
	/// Jobs enqueued more jobs while recording. Everything recorded so far is kept and will be
	/// submitted by a later flush.
	Deferred { pending: usize },
	Submitted(FlushStats),
}

/// Handed to a job while it records.
pub struct Recorder<'a> {
	commands: &'a mut CommandBuffer,
	postflush: &'a mut Vec<PostflushJob>,
	follow_ups: &'a mut Vec<TransferJob>,
}

impl<'a> Recorder<'a> {
	/// The command buffer being recorded for this flush.
	pub fn commands(&mut self) -> &mut CommandBuffer {
		self.commands
	}

	/// Runs `cleanup` after the device has finished executing this flush's commands.
	pub fn after_completion<F>(&mut self, cleanup: F)
	where
		F: FnOnce() + Send + 'static,
	{
		self.postflush.push(Box::new(cleanup));
	}

	/// Enqueues another job. It won't be recorded during the current pass, which turns this flush
	/// into a [FlushOutcome::Deferred].
	pub fn enqueue<F>(&mut self, job: F)
	where
		F: FnOnce(&mut Recorder<'_>) + Send + 'static,
	{
		self.follow_ups.push(Box::new(job));
	}
}

struct SchedulerState {
	/// Enqueued jobs that haven't recorded yet.
	outstanding: usize,
	preflush: Vec<TransferJob>,
	postflush: Vec<PostflushJob>,
	recording: CommandBuffer,
	/// Jobs recorded into `recording` since the last submission.
	recorded_jobs: usize,
	cycle: u64,
	poisoned: bool,
}

pub struct TransferScheduler {
	device: Arc<dyn GpuDevice>,
	log_flushes: bool,
	state: Mutex<SchedulerState>,
}

impl TransferScheduler {
	pub fn new(device: Arc<dyn GpuDevice>, log_flushes: bool) -> Self {
		TransferScheduler {
			device,
			log_flushes,
			state: Mutex::new(SchedulerState {
				outstanding: 0,
				preflush: Vec::new(),
				postflush: Vec::new(),
				recording: CommandBuffer::new(),
				recorded_jobs: 0,
				cycle: 0,
				poisoned: false,
			}),
		}
	}

	pub fn enqueue<F>(&self, job: F)
	where
		F: FnOnce(&mut Recorder<'_>) + Send + 'static,
	{
		let mut state = self.state.lock();
		state.outstanding += 1;
		state.preflush.push(Box::new(job));
	}

	/// Runs `cleanup` after the next submission completes, without recording anything.
	pub fn defer<F>(&self, cleanup: F)
	where
		F: FnOnce() + Send + 'static,
	{
		self.state.lock().postflush.push(Box::new(cleanup));
	}

	/// Jobs enqueued but not yet recorded.
	pub fn outstanding(&self) -> usize {
		self.state.lock().outstanding
	}

	/// Number of completed submissions.
	pub fn cycle(&self) -> u64 {
		self.state.lock().cycle
	}

	pub fn is_poisoned(&self) -> bool {
		self.state.lock().poisoned
	}

	/// Records every pending job, submits the result and waits for the device to finish it.
	pub fn flush(&self) -> Result<FlushOutcome, TransferError> {
		let start = Instant::now();
		let mut state = self.state.lock();
		if state.poisoned {
			return Err(TransferError::Poisoned);
		}
		if state.outstanding == 0 {
			return Ok(FlushOutcome::Idle);
		}

		let jobs = std::mem::take(&mut state.preflush);
		let mut follow_ups: Vec<TransferJob> = Vec::new();
		{
			let SchedulerState {
				outstanding,
				postflush,
				recording,
				recorded_jobs,
				..
			} = &mut *state;
			for job in jobs {
				let mut recorder = Recorder {
					commands: &mut *recording,
					postflush: &mut *postflush,
					follow_ups: &mut follow_ups,
				};
				job(&mut recorder);
				*outstanding -= 1;
				*recorded_jobs += 1;
			}
		}

		if !follow_ups.is_empty() {
			let pending = follow_ups.len();
			state.outstanding += pending;
			state.preflush.extend(follow_ups);
			warn!("Transfer jobs enqueued {} more jobs while recording, deferring submission", pending);
			return Ok(FlushOutcome::Deferred { pending });
		}

		state.recording.end();
		if let Err(e) = self.device.submit_and_wait(&state.recording) {
			error!("Submitting {} transfer commands to {} failed: {}", state.recording.len(), self.device.name(), e);
			state.poisoned = true;
			return Err(TransferError::Submit(e));
		}

		state.cycle += 1;
		let commands = state.recording.len();
		state.recording.begin();
		let jobs = std::mem::replace(&mut state.recorded_jobs, 0);
		let postflush = std::mem::take(&mut state.postflush);
		let cycle = state.cycle;
		drop(state);

		let postflush_jobs = postflush.len();
		for cleanup in postflush {
			cleanup();
		}

		let stats = FlushStats {
			jobs,
			commands,
			postflush_jobs,
			cycle,
			elapsed: start.elapsed(),
		};
		if self.log_flushes {
			info!("Flush #{}: {} jobs, {} commands, {} cleanups in {:?}", cycle, jobs, commands, postflush_jobs, stats.elapsed);
		} else {
			trace!("Flush #{}: {} jobs, {} commands, {} cleanups in {:?}", cycle, jobs, commands, postflush_jobs, stats.elapsed);
		}
		Ok(FlushOutcome::Submitted(stats))
	}
}

impl Drop for TransferScheduler {
	fn drop(&mut self) {
		let state = self.state.get_mut();
		if !state.preflush.is_empty() {
			warn!("Dropping a transfer scheduler with {} unrecorded jobs, discarding them", state.preflush.len());
		}
		state.preflush.clear();
		state.outstanding = 0;
		let postflush = std::mem::take(&mut state.postflush);
		if !postflush.is_empty() {
			debug!("Running {} pending cleanups on scheduler drop", postflush.len());
		}
		for cleanup in postflush {
			cleanup();
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::device::{BufferDesc, BufferUsage, Command, HeadlessDevice, MemoryLocation};

	fn setup() -> (Arc<HeadlessDevice>, TransferScheduler) {
		let device = Arc::new(HeadlessDevice::new());
		let scheduler = TransferScheduler::new(device.clone(), false);
		(device, scheduler)
	}

	fn buffer(device: &HeadlessDevice) -> crate::device::BufferId {
		device
			.create_buffer(&BufferDesc {
				label: None,
				size: 64,
				usage: BufferUsage::device_pool(),
				location: MemoryLocation::DeviceLocal,
			})
			.unwrap()
	}

	#[test]
	fn idle_flush_does_not_submit() {
		let (device, scheduler) = setup();
		assert_eq!(scheduler.flush(), Ok(FlushOutcome::Idle));
		assert_eq!(device.submission_count(), 0);
	}

	#[test]
	fn second_flush_is_idle() {
		let (device, scheduler) = setup();
		let target = buffer(&device);
		scheduler.enqueue(move |rec| rec.commands().fill_buffer(target, 0, 16, 7));
		assert!(matches!(scheduler.flush(), Ok(FlushOutcome::Submitted(_))));
		assert_eq!(scheduler.flush(), Ok(FlushOutcome::Idle));
		assert_eq!(device.submission_count(), 1);
	}

	#[test]
	fn jobs_record_in_enqueue_order() {
		let (device, scheduler) = setup();
		let target = buffer(&device);
		scheduler.enqueue(move |rec| rec.commands().fill_buffer(target, 0, 8, 1));
		scheduler.enqueue(move |rec| rec.commands().fill_buffer(target, 4, 8, 2));
		let stats = match scheduler.flush().unwrap() {
			FlushOutcome::Submitted(stats) => stats,
			other => panic!("expected a submission, got {:?}", other),
		};
		assert_eq!(stats.jobs, 2);
		assert_eq!(stats.commands, 2);
		assert_eq!(stats.cycle, 1);

		let mut out = [0u8; 12];
		device.read_buffer(target, 0, &mut out).unwrap();
		// Fill values are little-endian words; the second fill overwrote the tail of the first.
		assert_eq!(out, [1, 0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0]);
	}

	#[test]
	fn postflush_runs_after_submission_in_order() {
		let (device, scheduler) = setup();
		let target = buffer(&device);
		let order = Arc::new(Mutex::new(Vec::new()));
		for i in 0..3 {
			let order = order.clone();
			let device = device.clone();
			scheduler.enqueue(move |rec| {
				rec.commands().fill_buffer(target, 0, 4, i);
				rec.after_completion(move || {
					// The submission has already run by now.
					assert_eq!(device.submission_count(), 1);
					order.lock().push(i);
				});
			});
		}
		scheduler.flush().unwrap();
		assert_eq!(*order.lock(), vec![0, 1, 2]);
	}

	#[test]
	fn deferred_cleanup_waits_for_a_submission() {
		let (device, scheduler) = setup();
		let ran = Arc::new(AtomicUsize::new(0));
		let counter = ran.clone();
		scheduler.defer(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		assert_eq!(scheduler.flush(), Ok(FlushOutcome::Idle));
		assert_eq!(ran.load(Ordering::SeqCst), 0);

		let target = buffer(&device);
		scheduler.enqueue(move |rec| rec.commands().fill_buffer(target, 0, 4, 0));
		scheduler.flush().unwrap();
		assert_eq!(ran.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn follow_up_jobs_defer_the_submission() {
		let (device, scheduler) = setup();
		let target = buffer(&device);
		scheduler.enqueue(move |rec| {
			rec.commands().fill_buffer(target, 0, 4, 1);
			rec.enqueue(move |rec| rec.commands().fill_buffer(target, 4, 4, 2));
		});
		assert_eq!(scheduler.flush(), Ok(FlushOutcome::Deferred { pending: 1 }));
		assert_eq!(device.submission_count(), 0);
		assert_eq!(scheduler.outstanding(), 1);

		match scheduler.flush().unwrap() {
			FlushOutcome::Submitted(stats) => {
				assert_eq!(stats.jobs, 2);
				assert_eq!(stats.commands, 2);
			}
			other => panic!("expected a submission, got {:?}", other),
		}
		assert_eq!(device.history().len(), 2);
		assert!(matches!(device.history()[1], Command::FillBuffer { offset: 4, .. }));
	}

	#[test]
	fn failed_submission_poisons() {
		let (device, scheduler) = setup();
		let target = buffer(&device);
		// Unaligned fill, rejected by the device.
		scheduler.enqueue(move |rec| rec.commands().fill_buffer(target, 1, 4, 0));
		assert!(matches!(scheduler.flush(), Err(TransferError::Submit(DeviceError::Misaligned { .. }))));
		assert!(scheduler.is_poisoned());
		scheduler.enqueue(move |rec| rec.commands().fill_buffer(target, 0, 4, 0));
		assert_eq!(scheduler.flush(), Err(TransferError::Poisoned));
	}

	#[test]
	fn drop_runs_pending_cleanups() {
		let (_device, scheduler) = setup();
		let ran = Arc::new(AtomicUsize::new(0));
		let counter = ran.clone();
		scheduler.defer(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		scheduler.enqueue(|_| panic!("discarded jobs never run"));
		drop(scheduler);
		assert_eq!(ran.load(Ordering::SeqCst), 1);
	}
}
