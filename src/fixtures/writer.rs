use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use tracing::{info, warn};

use super::{Fixture, MetadataValue, TokenFixture};
use crate::error::{Error, Result};

/// Collects serialized fixtures in memory and writes them out together.
///
/// Serialization happens at record time, so a bad tensor fails the run before
/// anything touches the disk. Each file is written to a temporary sibling and
/// renamed into place.
#[derive(Debug)]
pub struct FixtureRecorder {
    dir: PathBuf,
    pending: Vec<(String, Vec<u8>)>,
}

impl FixtureRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pending: Vec::new(),
        }
    }

    /// Snapshots `tensors` into a fixture without recording it.
    pub fn capture<'a>(
        name: &str,
        tensors: impl IntoIterator<Item = (&'a str, &'a Tensor)>,
        metadata: impl IntoIterator<Item = (&'a str, MetadataValue)>,
    ) -> Result<Fixture> {
        Fixture::capture(name, tensors, metadata)
    }

    pub fn serialize(fixture: &Fixture) -> Result<Vec<u8>> {
        fixture.to_json_bytes()
    }

    pub fn deserialize(name: &str, bytes: &[u8]) -> Result<Fixture> {
        Fixture::from_json_slice(name, bytes)
    }

    pub fn record(&mut self, fixture: &Fixture) -> Result<()> {
        let bytes = Self::serialize(fixture)?;
        self.push(fixture.file_name(), bytes)
    }

    /// Records a token fixture under `name` (`text_encoder`,
    /// `text_encoder_empty`).
    pub fn record_tokens(&mut self, name: &str, tokens: &TokenFixture) -> Result<()> {
        let bytes = tokens.to_json_bytes()?;
        self.push(format!("{name}.json"), bytes)
    }

    fn push(&mut self, file_name: String, bytes: Vec<u8>) -> Result<()> {
        if self.pending.iter().any(|(name, _)| *name == file_name) {
            return Err(Error::Serialization {
                fixture: file_name,
                tensor: String::new(),
                reason: "fixture recorded twice".to_string(),
            });
        }
        self.pending.push((file_name, bytes));
        Ok(())
    }

    /// File names recorded so far, in capture order.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|(name, _)| name.as_str())
    }

    /// Writes every recorded fixture and returns the paths written.
    ///
    /// The set is all or nothing: if any write fails, the files this flush
    /// already put in place are removed before the error is returned.
    pub fn flush(self) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let mut written = Vec::with_capacity(self.pending.len());
        for (file_name, bytes) in &self.pending {
            let path = self.dir.join(file_name);
            if let Err(err) = write_atomic(&path, bytes) {
                warn!("Writing {:?} failed, removing {} fixture(s)", path, written.len());
                for done in &written {
                    if let Err(e) = std::fs::remove_file(done) {
                        warn!("Could not remove {:?}: {}", done, e);
                    }
                }
                return Err(err);
            }
            info!("Saved fixture {:?} ({} bytes)", path, bytes.len());
            written.push(path);
        }
        Ok(written)
    }
}

/// Writes `bytes` to `path` via a temporary file in the same directory, so
/// readers see either the previous content or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| Error::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}
