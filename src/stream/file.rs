use super::reshape::decode_le_i16;
use crate::error::{NeuroLayerError, Result};

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Finds the first file under `root` whose name starts with `prefix`, searching
/// depth-first with entries visited in name order.
pub fn discover(root: &Path, prefix: &str) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in &entries {
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with(prefix));
        if path.is_file() && matches {
            return Some(path.clone());
        }
    }
    entries
        .iter()
        .filter(|p| p.is_dir())
        .find_map(|dir| discover(dir, prefix))
}

/// Read-only view of the growing recording on disk.
#[derive(Debug, Clone)]
pub struct SampleFile {
    path: PathBuf,
    frame_bytes: usize,
}

impl SampleFile {
    pub fn new<P: Into<PathBuf>>(path: P, frame_bytes: usize) -> Self {
        Self {
            path: path.into(),
            frame_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len_bytes(&self) -> Result<u64> {
        fs::metadata(&self.path).map(|m| m.len()).map_err(|e| {
            NeuroLayerError::SourceUnavailable(format!("{}: {}", self.path.display(), e))
        })
    }

    /// Whole frames currently on disk.
    pub fn frames_available(&self) -> Result<u64> {
        Ok(self.len_bytes()? / self.frame_bytes as u64)
    }

    /// Reads up to `count` frames starting at frame `start`; may return fewer.
    pub fn read_frames(&self, start: u64, count: u64) -> Result<Vec<i16>> {
        let available = self.frames_available()?;
        let to_read = available.saturating_sub(start).min(count);
        if to_read == 0 {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start * self.frame_bytes as u64))?;
        let mut raw = vec![0u8; to_read as usize * self.frame_bytes];
        file.read_exact(&mut raw)?;
        Ok(decode_le_i16(&raw))
    }

    /// Same as [`SampleFile::read_frames`], zero-filled to exactly `count` frames.
    pub fn read_frames_padded(&self, start: u64, count: u64) -> Result<Vec<i16>> {
        let mut samples = self.read_frames(start, count)?;
        let channels = self.frame_bytes / std::mem::size_of::<i16>();
        samples.resize(count as usize * channels, 0);
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_samples(path: &Path, samples: &[i16]) {
        let mut file = File::create(path).unwrap();
        for s in samples {
            file.write_all(&s.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn test_discover_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("Record Node 103").join("experiment1");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("settings.xml"), b"").unwrap();
        fs::write(nested.join("continuous.dat"), b"").unwrap();

        let found = discover(dir.path(), "continuous.").unwrap();
        assert_eq!(found, nested.join("continuous.dat"));
        assert!(discover(dir.path(), "spikes.").is_none());
    }

    #[test]
    fn test_reads_whole_frames_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("continuous.dat");
        // 3 frames of 2 channels plus half a frame
        write_samples(&path, &[1, 2, 3, 4, 5, 6, 7]);

        let file = SampleFile::new(&path, 4);
        assert_eq!(file.frames_available().unwrap(), 3);
        assert_eq!(file.read_frames(1, 10).unwrap(), vec![3, 4, 5, 6]);
        assert!(file.read_frames(5, 2).unwrap().is_empty());
    }

    #[test]
    fn test_padded_read_has_exact_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("continuous.dat");
        write_samples(&path, &[1, 2, 3, 4]);

        let file = SampleFile::new(&path, 4);
        assert_eq!(file.read_frames_padded(1, 3).unwrap(), vec![3, 4, 0, 0, 0, 0]);
        assert_eq!(file.read_frames_padded(9, 1).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let file = SampleFile::new("/nonexistent/continuous.dat", 4);
        assert!(matches!(
            file.len_bytes(),
            Err(NeuroLayerError::SourceUnavailable(_))
        ));
    }
}
