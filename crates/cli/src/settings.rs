//! Persisted settings and state paths.
//!
//! Settings live in an XDG config file; the shared dedup record store lives
//! under the XDG cache directory so that every relay instance on the machine
//! sees the same claims.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const SETTINGS_SCHEMA: u32 = 1;

/// File paths for relay state.
#[derive(Debug, Clone)]
pub struct StatePaths {
	pub config_file: PathBuf,
	pub requests_dir: PathBuf,
}

impl StatePaths {
	pub fn new() -> Self {
		let config_home = std::env::var_os("XDG_CONFIG_HOME")
			.map(PathBuf::from)
			.or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
			.unwrap_or_else(|| PathBuf::from("."));

		let cache_home = std::env::var_os("XDG_CACHE_HOME")
			.map(PathBuf::from)
			.or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
			.unwrap_or_else(|| PathBuf::from("."));

		Self::with_homes(&config_home, &cache_home)
	}

	pub fn with_homes(config_home: &Path, cache_home: &Path) -> Self {
		Self {
			config_file: config_home.join("tabchat/config.json"),
			requests_dir: cache_home.join("tabchat/requests"),
		}
	}
}

/// Settings persisted across restarts; flags override, `--save` writes back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
	#[serde(default)]
	pub schema: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub endpoint: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub assistant_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub listen_port: Option<u16>,
}

impl Settings {
	pub fn load(path: &Path) -> Self {
		fs::read_to_string(path)
			.ok()
			.and_then(|content| serde_json::from_str(&content).ok())
			.unwrap_or_default()
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.with_context(|| format!("creating {}", parent.display()))?;
		}
		let mut on_disk = self.clone();
		on_disk.schema = SETTINGS_SCHEMA;
		fs::write(path, serde_json::to_string_pretty(&on_disk)?)
			.with_context(|| format!("writing {}", path.display()))?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn paths_follow_home_layout() {
		let paths = StatePaths::with_homes(Path::new("/home/u/.config"), Path::new("/home/u/.cache"));
		assert_eq!(
			paths.config_file,
			PathBuf::from("/home/u/.config/tabchat/config.json")
		);
		assert_eq!(
			paths.requests_dir,
			PathBuf::from("/home/u/.cache/tabchat/requests")
		);
	}

	#[test]
	fn missing_file_loads_defaults() {
		let tmp = TempDir::new().unwrap();
		let settings = Settings::load(&tmp.path().join("nonexistent.json"));
		assert_eq!(settings, Settings::default());
	}

	#[test]
	fn save_and_load_round_trip() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("nested/config.json");

		let settings = Settings {
			schema: 0,
			endpoint: Some("ws://127.0.0.1:9100".to_string()),
			assistant_url: None,
			listen_port: Some(9200),
		};
		settings.save(&path).unwrap();

		let loaded = Settings::load(&path);
		assert_eq!(loaded.schema, SETTINGS_SCHEMA);
		assert_eq!(loaded.endpoint.as_deref(), Some("ws://127.0.0.1:9100"));
		assert_eq!(loaded.listen_port, Some(9200));
	}

	#[test]
	fn corrupt_file_loads_defaults() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("config.json");
		fs::write(&path, "{broken").unwrap();
		assert_eq!(Settings::load(&path), Settings::default());
	}
}
