//! Configuration loading

use std::path::Path;

use anyhow::Result;
use docstore_common::config::Config;

/// Load configuration from file, falling back to defaults when it is missing.
///
/// Returns the configuration and whether it came from the file.
pub async fn load(path: &str) -> Result<(Config, bool)> {
    let path = Path::new(path);

    if path.exists() {
        let config = Config::load(path).await.map_err(|e| anyhow::anyhow!(e))?;
        Ok((config, true))
    } else {
        Ok((Config::default(), false))
    }
}
