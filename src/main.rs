//! Drives an arena through a few simulated frames and reports what each flush did.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use gestalt_arena::device::BufferUsage;
use gestalt_arena::{
	ArenaConfig, ArenaContext, ArenaError, AtlasError, AtlasPool, FlushOutcome, GrowableBuffer, GrowthMode,
	PoolDesc, ARENA_CONFIG_FILENAME,
};
use glam::Vec3;
use image::{Rgba, RgbaImage};
use log::{error, info, LevelFilter};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
	Headless,
	Wgpu,
}

#[derive(Parser, Debug)]
#[command(name = "arena_demo", about = "Exercises the GPU resource arena for a few frames.")]
struct Args {
	/// Arena configuration file, in RON. Defaults are used if it is missing.
	#[arg(short, long, default_value = ARENA_CONFIG_FILENAME)]
	config: PathBuf,
	#[arg(short, long, default_value_t = 4)]
	frames: u32,
	#[arg(long, default_value_t = LevelFilter::Info)]
	log_level: LevelFilter,
	#[arg(short, long, value_enum, default_value_t = Backend::Headless)]
	backend: Backend,
}

#[derive(thiserror::Error, Debug)]
enum DemoError {
	#[error(transparent)]
	Arena(#[from] ArenaError),
	#[error(transparent)]
	Atlas(#[from] AtlasError),
	#[cfg(not(feature = "wgpu-backend"))]
	#[error("This build doesn't include the wgpu backend, rebuild with --features wgpu-backend")]
	NoWgpu,
	#[error("Vertex data read back from the device doesn't match what was written on frame {0}")]
	Mismatch(u32),
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
	position: [f32; 3],
	tex_coord: [f32; 2],
}

fn create_context(backend: Backend, config: ArenaConfig) -> Result<Arc<ArenaContext>, DemoError> {
	match backend {
		Backend::Headless => Ok(ArenaContext::headless(config)?.1),
		#[cfg(feature = "wgpu-backend")]
		Backend::Wgpu => {
			let device = futures::executor::block_on(gestalt_arena::device::WgpuDevice::new()).map_err(ArenaError::from)?;
			Ok(ArenaContext::new(Arc::new(device), config)?)
		}
		#[cfg(not(feature = "wgpu-backend"))]
		Backend::Wgpu => Err(DemoError::NoWgpu),
	}
}

fn glyph(size: u32, seed: u8) -> RgbaImage {
	RgbaImage::from_fn(size, size, |x, y| {
		let shade = seed.wrapping_add((x * 16 + y) as u8);
		Rgba([shade, 255 - shade, seed, 255])
	})
}

fn quad(center: Vec3, half: f32) -> [Vertex; 4] {
	let corner = |dx: f32, dy: f32, u: f32, v: f32| Vertex {
		position: (center + Vec3::new(dx * half, dy * half, 0.0)).to_array(),
		tex_coord: [u, v],
	};
	[
		corner(-1.0, -1.0, 0.0, 1.0),
		corner(1.0, -1.0, 1.0, 1.0),
		corner(1.0, 1.0, 1.0, 0.0),
		corner(-1.0, 1.0, 0.0, 0.0),
	]
}

fn run(args: &Args) -> Result<(), DemoError> {
	let config = ArenaConfig::load_or_default(&args.config);
	let context = create_context(args.backend, config)?;

	let submissions = Arc::new(AtomicU64::new(0));
	let counter = submissions.clone();
	context.on_flush().subscribe(move |stats| {
		counter.fetch_add(1, Ordering::Relaxed);
		info!(
			"Flush #{}: {} jobs, {} commands, {} cleanups in {:?}",
			stats.cycle, stats.jobs, stats.commands, stats.postflush_jobs, stats.elapsed
		);
		true
	});

	let vertices = GrowableBuffer::new(
		&context,
		&PoolDesc {
			label: "demo vertices",
			usage: BufferUsage::vertex(),
			initial_size: None,
			mode: GrowthMode::Append,
		},
	)?;
	let uniforms = GrowableBuffer::new(
		&context,
		&PoolDesc {
			label: "demo uniforms",
			usage: BufferUsage::uniform(),
			initial_size: Some(256),
			mode: GrowthMode::Replace,
		},
	)?;
	let atlas = AtlasPool::from_context(context.clone());
	let frame_uniform = uniforms.allocate::<u32>(4, 16)?;

	let mut quads = Vec::new();
	for frame in 0..args.frames {
		// One more quad per frame, and every existing quad moves.
		quads.push(vertices.allocate::<Vertex>(4, 4)?);
		for (i, reference) in quads.iter().enumerate() {
			let center = Vec3::new(i as f32, frame as f32 * 0.5, 0.0);
			let mut window = reference.update_with(0, 4)?;
			window.copy_from_slice(&quad(center, 0.5));
		}
		frame_uniform.update(0, &[frame, quads.len() as u32, 0, 0])?;

		let sub = atlas.pack_image(&glyph(8 + (frame % 16) * 4, frame as u8))?;
		info!("Packed a {}x{} glyph on atlas page {} at {:?}", sub.width(), sub.height(), sub.page, sub.region);

		match context.flush()? {
			FlushOutcome::Submitted(_) => {}
			FlushOutcome::Deferred { pending } => info!("Frame {} left {} jobs for the next flush", frame, pending),
			FlushOutcome::Idle => info!("Frame {} had nothing to upload", frame),
		}

		let last = quads.last().map(|q| q.read()).transpose()?;
		let expected = quad(Vec3::new((quads.len() - 1) as f32, frame as f32 * 0.5, 0.0), 0.5);
		if last.as_deref() != Some(&expected[..]) {
			return Err(DemoError::Mismatch(frame));
		}
	}

	let stats = vertices.stats();
	info!(
		"Vertex pool: {} live of {} blocks, {} of {} bytes in use, grew {} times",
		stats.live_blocks, stats.blocks, stats.allocated_bytes, stats.total_bytes, stats.generation
	);
	let stats = uniforms.stats();
	info!("Uniform pool: {} bytes over {} blocks", stats.total_bytes, stats.live_blocks);
	info!(
		"{} submissions, {} atlas pages",
		submissions.load(Ordering::Relaxed),
		atlas.page_count()
	);
	Ok(())
}

fn main() {
	let args = Args::parse();

	let mut log_config_builder = ConfigBuilder::default();
	log_config_builder.set_target_level(LevelFilter::Error);
	let log_config = log_config_builder.build();
	if let Err(e) = TermLogger::init(args.log_level, log_config, TerminalMode::Mixed, ColorChoice::Auto) {
		eprintln!("Couldn't set up logging: {}", e);
	}

	info!("Starting arena demo on the {:?} backend for {} frames", args.backend, args.frames);
	if let Err(e) = run(&args) {
		error!("Arena demo failed: {}", e);
		std::process::exit(1);
	}
}
