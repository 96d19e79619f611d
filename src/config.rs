use std::path::PathBuf;

/// Initial capacity of a freshly created map file (64 MiB).
pub const DEFAULT_INITIAL_CAPACITY: u64 = 64 * 1024 * 1024;

/// Growth step once the mapping stops doubling (1 GiB).
pub const DEFAULT_MAX_GROWTH_STEP: u64 = 1024 * 1024 * 1024;

/// Configuration for a CinderMap.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the memory-mapped file.
    pub path: PathBuf,

    /// Size the file is grown to on first creation (default: 64 MiB).
    pub initial_capacity: u64,

    /// Linear growth step, and the threshold at which growth switches from
    /// doubling to linear (default: 1 GiB).
    pub max_growth_step: u64,
}

impl Config {
    /// Create a new config for the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            max_growth_step: DEFAULT_MAX_GROWTH_STEP,
        }
    }

    /// Set the initial file capacity.
    pub fn initial_capacity(mut self, bytes: u64) -> Self {
        self.initial_capacity = bytes;
        self
    }

    /// Set the linear growth step.
    pub fn max_growth_step(mut self, bytes: u64) -> Self {
        self.max_growth_step = bytes;
        self
    }

    /// The next capacity on the growth schedule: double until the mapping
    /// reaches `max_growth_step`, then advance linearly by that step.
    pub fn next_capacity(&self, current: u64) -> u64 {
        if current == 0 {
            self.initial_capacity
        } else if current >= self.max_growth_step {
            current + self.max_growth_step
        } else {
            current * 2
        }
    }
}
