//! Access to the cache that scripts are read from.
//!
//! Archive formats and index parsing live outside this crate; anything
//! that can hand out files by `(major, minor)` can drive calibration.

use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::bounded;
use cs2script::BuildNumber;
use tracing::debug;

use crate::error::{CoreError, Result};

/// Index major holding compiled client scripts.
pub const CLIENTSCRIPT_MAJOR: u32 = 12;

/// One file listed in a cache index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub major: u32,
    pub minor: u32,
    /// Checksum recorded in the index, 0 when the source has none.
    pub crc: u32,
    /// Name hash, if the index carries names.
    pub name: Option<i32>,
}

/// A game cache, or anything that looks like one.
pub trait CacheSource: Sync {
    fn get_file(&self, major: u32, minor: u32, crc: Option<u32>) -> Result<Vec<u8>>;

    fn get_cache_index(&self, major: u32) -> Result<Vec<IndexEntry>>;

    fn build_number(&self) -> BuildNumber;
}

/// Fetch all `entries` on up to `workers` threads. Results come back in
/// index order; the first failed file aborts the fetch.
pub fn fetch_files(source: &dyn CacheSource, entries: &[IndexEntry], workers: usize) -> Result<Vec<(u32, Vec<u8>)>> {
    let workers = workers.clamp(1, entries.len().max(1));

    let mut files = thread::scope(|scope| {
        let (job_tx, job_rx) = bounded::<usize>(workers * 4);
        let (result_tx, result_rx) = bounded::<(usize, Result<Vec<u8>>)>(workers * 8);

        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for i in &job_rx {
                    let entry = &entries[i];
                    let crc = (entry.crc != 0).then_some(entry.crc);
                    let res = source.get_file(entry.major, entry.minor, crc);
                    if result_tx.send((i, res)).is_err() {
                        break;
                    }
                }
            });
        }
        // the channels close once the workers drop their copies
        drop(job_rx);
        drop(result_tx);

        scope.spawn(move || {
            for i in 0..entries.len() {
                if job_tx.send(i).is_err() {
                    break;
                }
            }
        });

        let mut files = Vec::with_capacity(entries.len());
        for (i, res) in &result_rx {
            let entry = &entries[i];
            match res {
                Ok(data) => files.push((i, entry.minor, data)),
                Err(e) => {
                    return Err(CoreError::Source(format!(
                        "file {}.{}: {e}",
                        entry.major, entry.minor
                    )))
                }
            }
        }
        Ok(files)
    })?;

    files.sort_by_key(|&(i, _, _)| i);
    debug!(count = files.len(), workers, "fetched files");
    Ok(files.into_iter().map(|(_, minor, data)| (minor, data)).collect())
}

/// Fetch every client script of `source`, keyed by script id.
pub fn fetch_scripts(source: &dyn CacheSource, workers: usize) -> Result<Vec<(u32, Vec<u8>)>> {
    let index = source.get_cache_index(CLIENTSCRIPT_MAJOR)?;
    fetch_files(source, &index, workers)
}

/// Cache extracted to disk as `<root>/<major>/<minor>.bin`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    build: BuildNumber,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, build: BuildNumber) -> Self {
        Self {
            root: root.into(),
            build,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self, major: u32, minor: u32) -> PathBuf {
        self.root.join(major.to_string()).join(format!("{minor}.bin"))
    }

    /// Write one file in the layout this source reads.
    pub fn put_file(&self, major: u32, minor: u32, data: &[u8]) -> Result<()> {
        let path = self.file_path(major, minor);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }
}

impl CacheSource for DirectorySource {
    fn get_file(&self, major: u32, minor: u32, _crc: Option<u32>) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.file_path(major, minor))?)
    }

    fn get_cache_index(&self, major: u32) -> Result<Vec<IndexEntry>> {
        let dir = self.root.join(major.to_string());
        let mut entries = Vec::new();
        for file in std::fs::read_dir(&dir)? {
            let path = file?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let Some(minor) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            entries.push(IndexEntry {
                major,
                minor,
                crc: 0,
                name: None,
            });
        }
        entries.sort_by_key(|e| e.minor);
        Ok(entries)
    }

    fn build_number(&self) -> BuildNumber {
        self.build
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn directory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path(), BuildNumber(900));
        for minor in [7, 2, 30] {
            source.put_file(CLIENTSCRIPT_MAJOR, minor, &[minor as u8; 3]).unwrap();
        }
        std::fs::write(dir.path().join("12/notes.txt"), b"ignored").unwrap();

        let index = source.get_cache_index(CLIENTSCRIPT_MAJOR).unwrap();
        let minors: Vec<_> = index.iter().map(|e| e.minor).collect();
        assert_eq!(minors, [2, 7, 30]);

        let files = fetch_scripts(&source, 2).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[1], (7, vec![7, 7, 7]));
    }

    /// In-memory cache; minors listed in `broken` fail to load.
    struct MemorySource {
        files: BTreeMap<u32, Vec<u8>>,
        broken: Vec<u32>,
    }

    impl CacheSource for MemorySource {
        fn get_file(&self, _major: u32, minor: u32, _crc: Option<u32>) -> Result<Vec<u8>> {
            if self.broken.contains(&minor) {
                return Err(CoreError::Source(format!("minor {minor} is corrupt")));
            }
            self.files
                .get(&minor)
                .cloned()
                .ok_or_else(|| CoreError::Source(format!("no minor {minor}")))
        }

        fn get_cache_index(&self, major: u32) -> Result<Vec<IndexEntry>> {
            Ok(self
                .files
                .keys()
                .map(|&minor| IndexEntry {
                    major,
                    minor,
                    crc: minor + 1,
                    name: None,
                })
                .collect())
        }

        fn build_number(&self) -> BuildNumber {
            BuildNumber(900)
        }
    }

    fn memory(count: u32, broken: Vec<u32>) -> MemorySource {
        MemorySource {
            files: (0..count).map(|m| (m, m.to_be_bytes().to_vec())).collect(),
            broken,
        }
    }

    #[test]
    fn many_files_keep_index_order() {
        let source = memory(200, vec![]);
        for workers in [1, 3, 10, 500] {
            let files = fetch_scripts(&source, workers).unwrap();
            assert_eq!(files.len(), 200);
            for (i, (minor, data)) in files.iter().enumerate() {
                assert_eq!(*minor, i as u32);
                assert_eq!(data, &minor.to_be_bytes());
            }
        }
    }

    #[test]
    fn failure_in_a_large_batch_aborts() {
        let source = memory(300, vec![150]);
        match fetch_scripts(&source, 4) {
            Err(CoreError::Source(msg)) => assert!(msg.contains("12.150"), "{msg}"),
            other => panic!("expected a source error, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path(), BuildNumber(900));
        let entries = [IndexEntry {
            major: CLIENTSCRIPT_MAJOR,
            minor: 1,
            crc: 0,
            name: None,
        }];
        assert!(matches!(fetch_files(&source, &entries, 4), Err(CoreError::Source(_))));
        assert!(fetch_files(&source, &[], 4).unwrap().is_empty());
    }
}
