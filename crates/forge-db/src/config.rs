use std::env;
use std::path::PathBuf;

/// Database configuration.
///
/// Reads from the `DB_PATH` environment variable, falling back to
/// `forge.db` in the current directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl DbConfig {
    /// The default database file used when no environment variable is set.
    pub const DEFAULT_PATH: &str = "forge.db";

    /// Build a config from the environment.
    ///
    /// Priority: `DB_PATH` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let db_path = env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_PATH));
        Self { db_path }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
