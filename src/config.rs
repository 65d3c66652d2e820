use std::fs::OpenOptions;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::device::DeviceLimits;
use crate::image::atlas::AtlasConfig;

pub const ARENA_CONFIG_FILENAME: &str = "arena_config.ron";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("I/O error while reading or writing the arena config: {0:?}")]
	Io(#[from] std::io::Error),
	#[error("Couldn't parse the arena config: {0}")]
	Parse(#[from] ron::error::SpannedError),
	#[error("Couldn't serialize the arena config: {0}")]
	Serialize(#[from] ron::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
	/// Size of each host-visible block the staging arena allocates. Uploads larger than this get a
	/// block of their own.
	pub staging_block_size: u64,
	/// Initial size of a device pool when the caller doesn't pick one.
	pub default_pool_size: u64,
	/// Log every completed flush at info level instead of trace.
	pub log_flushes: bool,
	/// Limits the headless device reports.
	pub headless_limits: DeviceLimits,
	/// Optional cap on how much memory the headless device hands out.
	pub headless_memory_budget: Option<u64>,
	pub atlas: AtlasConfig,
}

impl Default for ArenaConfig {
	fn default() -> Self {
		ArenaConfig {
			staging_block_size: 4 * 1024 * 1024,
			default_pool_size: 1024 * 1024,
			log_flushes: false,
			headless_limits: DeviceLimits::default(),
			headless_memory_budget: None,
			atlas: AtlasConfig::default(),
		}
	}
}

impl ArenaConfig {
	pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
		let file = OpenOptions::new().read(true).open(path)?;
		let mut contents = String::new();
		BufReader::new(file).read_to_string(&mut contents)?;
		Ok(ron::from_str(&contents)?)
	}

	pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
		let cfg_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
		let mut file = OpenOptions::new().write(true).truncate(true).create(true).open(path)?;
		file.write_all(cfg_string.as_bytes())?;
		file.flush()?;
		Ok(())
	}

	/// Loads the config at `path`. If that didn't work, just use built-in defaults.
	pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
		match Self::load(path.as_ref()) {
			Ok(config) => config,
			Err(e) => {
				warn!(
					"Couldn't open arena config at {}, using defaults. Error was: {:?}",
					path.as_ref().display(),
					e
				);
				ArenaConfig::default()
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::device::ImageFormat;

	#[test]
	fn config_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(ARENA_CONFIG_FILENAME);
		let mut config = ArenaConfig::default();
		config.staging_block_size = 1 << 16;
		config.log_flushes = true;
		config.atlas.format = ImageFormat::R8Unorm;
		config.save(&path).unwrap();
		assert_eq!(ArenaConfig::load(&path).unwrap(), config);
	}

	#[test]
	fn missing_fields_take_defaults() {
		let config: ArenaConfig = ron::from_str("(log_flushes: true)").unwrap();
		assert!(config.log_flushes);
		assert_eq!(config.default_pool_size, ArenaConfig::default().default_pool_size);
		assert_eq!(config.atlas.padding, 2);
	}

	#[test]
	fn broken_file_falls_back_to_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(ARENA_CONFIG_FILENAME);
		std::fs::write(&path, "this is not ron").unwrap();
		assert!(matches!(ArenaConfig::load(&path), Err(ConfigError::Parse(_))));
		assert_eq!(ArenaConfig::load_or_default(&path), ArenaConfig::default());
		assert_eq!(ArenaConfig::load_or_default(dir.path().join("missing.ron")), ArenaConfig::default());
	}
}
