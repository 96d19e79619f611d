//! Scratch files for tests. Each helper hands out a unique path under a
//! shared scratch directory and removes it (and the sibling lock file a
//! map leaves behind) on drop.

use std::fs;
use std::path::{Path, PathBuf};

const SCRATCH_DIR: &str = "/tmp/cinderdb_tests";

pub struct NamedTempFile {
    path: PathBuf,
}

impl NamedTempFile {
    pub fn new() -> std::io::Result<Self> {
        let base = PathBuf::from(SCRATCH_DIR);
        fs::create_dir_all(&base)?;

        let unique_name = format!("map_{}_{}", std::process::id(), nano_suffix());
        Ok(Self { path: base.join(unique_name) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamedTempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);

        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        let _ = fs::remove_file(PathBuf::from(lock_path));
    }
}

fn nano_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
}
