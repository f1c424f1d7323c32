/// Application name used for directory names and environment variable prefixes.
pub const APP_NAME: &str = "kiln";

/// Directory inside the install prefix that holds engine state (manifest, lock, work dirs, logs).
pub const STATE_DIR: &str = ".kiln";

/// Canonical install root inside the prefix referenced by build steps.
pub const EMBEDDED_DIR: &str = "embedded";

pub const MANIFEST_FILENAME: &str = "manifest.json";

pub const LOCK_FILENAME: &str = "lock";

/// Length of truncated hashes used for cache directory names.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Fixed timestamp exported to build steps (1980-01-01T00:00:00Z, the ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Maximum number of bytes of step output kept in a `BuildFailed` error.
pub const CAPTURED_OUTPUT_LIMIT: usize = 16 * 1024;
