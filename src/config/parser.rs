use crate::config::types::Config;
use crate::config::validation::validate;
use crate::{ConfigError, ConfigResult};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Reads a pipeline configuration, applying defaults to missing sections
///
/// The file is validated before it is returned, so an orchestrator built from
/// it never has to re-check worker counts, retry bounds or extraction selectors.
///
/// ```no_run
/// use std::path::Path;
/// use lurker::config::load_config;
///
/// let config = load_config(Path::new("lurker.toml")).unwrap();
/// println!("Workers: {}", config.pipeline.workers);
/// ```
pub fn load_config(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

/// Hex SHA-256 of the raw file bytes
///
/// Every run records this hash. A resumed job compares it with the previous
/// run's hash and warns when the extraction rules or scope may have changed
/// under items that are still queued.
pub fn compute_config_hash(path: &Path) -> ConfigResult<String> {
    let content = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&content)))
}

/// [`load_config`] plus the hash stored on the run record
pub fn load_config_with_hash(path: &Path) -> ConfigResult<(Config, String)> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}
