/// Manifest sidecar tracking the durable segment
///
/// A small JSON file updated atomically (write-to-temp then rename) so the
/// segment/WAL handoff survives crashes: WAL replay starts at the first
/// sequence past `last_segment_seq`.
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Highest WAL sequence covered by the current segment file
    pub last_segment_seq: u64,
    /// Vector dimension, immutable after first open
    pub vector_dim: u32,
    /// Which shard this directory belongs to
    pub shard_id: u32,
    /// Format version
    pub version: u32,
}

impl Manifest {
    pub fn new(vector_dim: u32, shard_id: u32) -> Self {
        Self {
            last_segment_seq: 0,
            vector_dim,
            shard_id,
            version: MANIFEST_VERSION,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let manifest = serde_json::from_reader(reader)
            .map_err(|e| crate::error::StoreError::Corrupt(format!("manifest: {}", e)))?;
        Ok(manifest)
    }

    /// Save atomically: write to temp, fsync, rename over the target
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;

            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, self)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}
