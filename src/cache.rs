use color_eyre::Result;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Log file written by the tracing subscriber while the UI owns the terminal
pub const LOG_FILE: &str = "dyntable.log";

/// Registry of known cache files
const CACHE_FILES: &[&str] = &[LOG_FILE];

/// Manages cache directory and cache file operations
#[derive(Clone)]
pub struct CacheManager {
    pub(crate) cache_dir: PathBuf,
}

impl CacheManager {
    pub fn new(app_name: &str) -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| color_eyre::eyre::eyre!("Could not determine cache directory"))?
            .join(app_name);

        Ok(Self { cache_dir })
    }

    /// Create a CacheManager rooted at a custom directory (primarily for testing)
    pub fn with_dir(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn cache_file(&self, filename: &str) -> PathBuf {
        self.cache_dir.join(filename)
    }

    pub fn ensure_cache_dir(&self) -> Result<()> {
        if !self.cache_dir.exists() {
            fs::create_dir_all(&self.cache_dir)?;
        }
        Ok(())
    }

    /// Open the log file for appending, creating the cache directory if needed
    pub fn open_log(&self) -> Result<File> {
        self.ensure_cache_dir()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.cache_file(LOG_FILE))?;
        Ok(file)
    }

    /// Remove every registered cache file. Missing files are not an error.
    pub fn clear_all(&self) -> Result<()> {
        for filename in CACHE_FILES {
            let file_path = self.cache_file(filename);
            if file_path.exists() {
                if let Err(e) = fs::remove_file(&file_path) {
                    eprintln!("Warning: Could not remove cache file {}: {}", filename, e);
                }
            }
        }

        Ok(())
    }
}
