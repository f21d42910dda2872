// Policy engine defaults.
// These are the fallback values used when a config file doesn't override
// them; see `config.rs` for the recognized options.

pub const CATALOG_FILENAME: &str = "catalog.db";

// Backend archive defaults
pub const DEFAULT_COPY_TIMEOUT_SECS: i64 = 7200; // 2 hours
pub const XFER_SUFFIX: &str = ".xfer";
pub const ORPHAN_DIR: &str = ".orphans";
pub const UNKNOWN_PATH_DIR: &str = "__unknown_path";
pub const UNKNOWN_NAME: &str = "__unknown_name";

// Pipeline / concurrency defaults
pub const DEFAULT_STAGE_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_HIGH_WATER_MARK: usize = 1000;
pub const STAGE_RETRY_BASE_BACKOFF_MS: u64 = 500;
pub const STAGE_RETRY_MAX_BACKOFF_MS: u64 = 30_000;
pub const STAGE_RETRY_MAX_ATTEMPTS: u32 = 8;

// Scrubber
pub const SCRUBBER_BATCH_SIZE: usize = 50;

// Fs identity
pub const FS_PATH_VAR: &str = "FS_path";
pub const FS_KEY_VAR: &str = "FS_key";
