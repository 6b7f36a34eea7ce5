//! State-root configuration file parsing (rollfs.toml)

use serde::Deserialize;

use crate::layout::StateRoot;

/// Tunable policy for a state root
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Remove directories that end up empty during the hash-tree removal pass
    pub remove_empty_dirs: bool,

    /// Verify cached pre-image blocks against their recorded hashes while
    /// restoring; any mismatch aborts the rollback
    pub verify_restore: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            remove_empty_dirs: true,
            verify_restore: false,
        }
    }
}

impl StateConfig {
    /// Load config from the state root.
    ///
    /// Returns the defaults if `rollfs.toml` doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(root: &StateRoot) -> color_eyre::Result<Self> {
        let config_path = root.config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
