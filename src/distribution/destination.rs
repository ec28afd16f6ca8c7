use crate::config::{DestinationConfig, DestinationKind};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A sink for exported window artifacts.
///
/// Anything that can store or forward a named blob qualifies (local disk,
/// remote file transfer, object storage). Writes are called from a blocking
/// worker thread under a timeout; retry policy, if any, belongs here rather
/// than in the dispatcher.
pub trait Destination: Send + Sync {
    /// Identifier used in logs and delivery reports
    fn name(&self) -> &str;

    /// Store `bytes` under `name`. Writing the same name twice must leave the
    /// latest bytes in place.
    fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()>;
}

/// Writes artifacts as files in a local directory
pub struct LocalDirectory {
    name: String,
    directory: PathBuf,
}

impl LocalDirectory {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl Destination for LocalDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    /// Atomic write: temp file, fsync, then rename over the final path.
    /// Readers never observe a partial artifact.
    fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid artifact name '{}'", name),
            ));
        }

        fs::create_dir_all(&self.directory)?;

        let path = self.directory.join(name);
        let tmp_path = self.directory.join(format!(".{}.tmp", name));

        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(bytes)?;
            tmp_file.sync_all()?;
        }

        fs::rename(&tmp_path, &path)
    }
}

/// Build a destination from its configuration entry
pub fn from_config(config: &DestinationConfig) -> Arc<dyn Destination> {
    match &config.kind {
        DestinationKind::Local { directory } => {
            Arc::new(LocalDirectory::new(config.name.clone(), directory.clone()))
        }
    }
}
