//! The device context every pool, image and atlas is created from.

use std::sync::Arc;

use log::{info, warn};

use crate::config::ArenaConfig;
use crate::device::{DeviceError, GpuDevice, HeadlessDevice};
use crate::event::Event;
use crate::memory::StagingArena;
use crate::transfer::{FlushOutcome, FlushStats, TransferError, TransferScheduler};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
	#[error("Device error: {0}")]
	Device(#[from] DeviceError),
	#[error("Transfer error: {0}")]
	Transfer(#[from] TransferError),
}

/// Owns the device handle, the shared staging arena and the transfer scheduler.
///
/// Call [ArenaContext::flush] once per frame, or before reading back anything that was just
/// written.
pub struct ArenaContext {
	device: Arc<dyn GpuDevice>,
	scheduler: Arc<TransferScheduler>,
	staging: StagingArena,
	config: ArenaConfig,
	flushed: Event<FlushStats>,
}

impl ArenaContext {
	pub fn new(device: Arc<dyn GpuDevice>, config: ArenaConfig) -> Result<Arc<Self>, ArenaError> {
		let scheduler = Arc::new(TransferScheduler::new(device.clone(), config.log_flushes));
		let staging = StagingArena::new(device.clone(), scheduler.clone(), config.staging_block_size)?;
		info!("Created arena context on the {} device", device.name());
		Ok(Arc::new(ArenaContext {
			device,
			scheduler,
			staging,
			config,
			flushed: Event::new(),
		}))
	}

	/// A context on a fresh [HeadlessDevice] built from the config's headless settings.
	pub fn headless(config: ArenaConfig) -> Result<(Arc<HeadlessDevice>, Arc<Self>), ArenaError> {
		let mut device = HeadlessDevice::with_limits(config.headless_limits);
		if let Some(budget) = config.headless_memory_budget {
			device = device.with_memory_budget(budget);
		}
		let device = Arc::new(device);
		let context = Self::new(device.clone(), config)?;
		Ok((device, context))
	}

	pub fn device(&self) -> &Arc<dyn GpuDevice> {
		&self.device
	}

	pub fn scheduler(&self) -> &Arc<TransferScheduler> {
		&self.scheduler
	}

	pub fn staging(&self) -> &StagingArena {
		&self.staging
	}

	pub fn config(&self) -> &ArenaConfig {
		&self.config
	}

	/// Fired with the stats of every completed submission, after its cleanups have run.
	pub fn on_flush(&self) -> &Event<FlushStats> {
		&self.flushed
	}

	/// Submits everything enqueued since the last flush and waits for it to finish.
	pub fn flush(&self) -> Result<FlushOutcome, ArenaError> {
		let outcome = self.scheduler.flush()?;
		if let FlushOutcome::Submitted(stats) = &outcome {
			self.staging.compact();
			self.flushed.fire(stats);
		}
		Ok(outcome)
	}
}

impl Drop for ArenaContext {
	fn drop(&mut self) {
		// Settle pending uploads, so their cleanups don't keep staging memory alive.
		loop {
			match self.scheduler.flush() {
				Ok(FlushOutcome::Deferred { .. }) => continue,
				Ok(_) => break,
				Err(e) => {
					warn!("Couldn't flush pending transfers while dropping the arena context: {}", e);
					break;
				}
			}
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
	use std::thread;

	use super::*;
	use crate::device::BufferUsage;
	use crate::memory::{GrowableBuffer, GrowthMode, PoolDesc};

	#[test]
	fn flush_with_nothing_enqueued_does_not_submit() {
		let (device, context) = ArenaContext::headless(ArenaConfig::default()).unwrap();
		let pool = GrowableBuffer::new(
			&context,
			&PoolDesc {
				label: "idle",
				usage: BufferUsage::uniform(),
				initial_size: None,
				mode: GrowthMode::Append,
			},
		)
		.unwrap();
		let reference = pool.allocate::<u32>(1, 4).unwrap();
		reference.update(0, &[1]).unwrap();

		assert!(matches!(context.flush(), Ok(FlushOutcome::Submitted(_))));
		assert_eq!(context.flush(), Ok(FlushOutcome::Idle));
		assert_eq!(device.submission_count(), 1);
	}

	#[test]
	fn on_flush_sees_every_submission() {
		let (_device, context) = ArenaContext::headless(ArenaConfig::default()).unwrap();
		let last_cycle = Arc::new(AtomicU64::new(0));
		let seen = last_cycle.clone();
		context.on_flush().subscribe(move |stats| {
			seen.store(stats.cycle, Ordering::SeqCst);
			true
		});

		let pool = GrowableBuffer::new(
			&context,
			&PoolDesc {
				label: "events",
				usage: BufferUsage::storage(),
				initial_size: Some(64),
				mode: GrowthMode::Replace,
			},
		)
		.unwrap();
		let reference = pool.allocate::<u32>(2, 4).unwrap();
		for frame in 1..=3u32 {
			reference.update(0, &[frame, frame]).unwrap();
			context.flush().unwrap();
			assert_eq!(last_cycle.load(Ordering::SeqCst), frame as u64);
		}
		context.flush().unwrap();
		assert_eq!(last_cycle.load(Ordering::SeqCst), 3);
	}

	#[test]
	fn headless_config_is_applied() {
		let mut config = ArenaConfig::default();
		config.headless_memory_budget = Some(1024);
		config.staging_block_size = 2048;
		assert!(matches!(
			ArenaContext::headless(config),
			Err(ArenaError::Device(DeviceError::OutOfDeviceMemory { .. }))
		));
	}

	#[test]
	fn producers_write_while_another_thread_flushes() {
		let (_device, context) = ArenaContext::headless(ArenaConfig::default()).unwrap();
		let submissions = Arc::new(AtomicU64::new(0));
		let counter = submissions.clone();
		context.on_flush().subscribe(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
			true
		});
		let pool = GrowableBuffer::new(
			&context,
			&PoolDesc {
				label: "shared",
				usage: BufferUsage::storage(),
				initial_size: Some(64),
				mode: GrowthMode::Replace,
			},
		)
		.unwrap();
		let done = AtomicBool::new(false);

		let references = thread::scope(|scope| {
			let flusher = scope.spawn(|| {
				while !done.load(Ordering::SeqCst) {
					context.flush().unwrap();
					thread::yield_now();
				}
			});
			let producers: Vec<_> = (0..4u32)
				.map(|t| {
					let pool = &pool;
					scope.spawn(move || {
						// The last producer asks for far more than the pool holds, so it grows under
						// everyone else's writes.
						let count = if t == 3 { 256 } else { 16 };
						let reference = pool.allocate::<u32>(count, 4).unwrap();
						for round in 0..50 {
							reference.update(0, &vec![t * 1000 + round; count]).unwrap();
						}
						reference
					})
				})
				.collect();
			let references: Vec<_> = producers.into_iter().map(|p| p.join().unwrap()).collect();
			done.store(true, Ordering::SeqCst);
			flusher.join().unwrap();
			references
		});

		context.flush().unwrap();
		assert!(pool.stats().generation > 1);
		assert!(submissions.load(Ordering::SeqCst) >= 1);
		for (t, reference) in references.iter().enumerate() {
			assert_eq!(reference.read().unwrap(), vec![t as u32 * 1000 + 49; reference.len()]);
		}
	}
}
