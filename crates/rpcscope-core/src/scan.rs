//! Endpoint map construction.
//!
//! Walks a directory tree, runs every library/executable through the
//! identity extractor, and accumulates `identifier -> binary path`
//! discoveries. Individual failures (unreadable directories, non-regular
//! entries, binaries without an identity) are diagnostics, never fatal; the
//! walk is interruptible once the map grows past a configured threshold so
//! a scan over a full system volume stays bounded.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::guid::InterfaceId;
use crate::pe;

/// Discovered endpoints, keyed by interface identifier. Duplicate
/// identifiers across binaries resolve last-writer-wins.
pub type EndpointMap = BTreeMap<InterfaceId, PathBuf>;

/// Default cap on accumulated endpoints before the walk is interrupted.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 100;

/// How a scan over one root finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// The whole subtree was visited.
    Completed,
    /// The map exceeded the flush threshold; the map was flushed to the
    /// sink and the caller may halt further scanning.
    ThresholdReached,
}

/// Scanner configuration.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Candidate file extensions, lowercase without the dot.
    pub extensions: Vec<String>,
    /// Map cardinality that interrupts the walk.
    pub flush_threshold: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extensions: vec!["dll".into(), "exe".into()],
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

/// Recursive endpoint discovery over a directory tree.
pub struct EndpointScanner {
    options: ScanOptions,
}

impl EndpointScanner {
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// Scan `root`, inserting discoveries into `map`.
    ///
    /// When the map outgrows the flush threshold it is written to `sink`
    /// (if one is configured) and the walk stops with
    /// [`ScanStatus::ThresholdReached`]. The only error this returns is a
    /// failed sink write; everything else is logged and skipped.
    pub fn scan(
        &self,
        root: &Path,
        map: &mut EndpointMap,
        sink: Option<&Path>,
    ) -> Result<ScanStatus> {
        info!(root = %root.display(), "scanning for RPC server binaries");
        self.walk(root, map, sink)
    }

    fn walk(&self, dir: &Path, map: &mut EndpointMap, sink: Option<&Path>) -> Result<ScanStatus> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "failed to access directory, skipping subtree");
                return Ok(ScanStatus::Completed);
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(dir = %dir.display(), %err, "failed to read directory entry");
                    continue;
                }
            };
            let path = entry.path();
            // file_type() does not traverse symlinks, so a symlinked
            // directory is neither a dir nor a file here and falls through
            // to the skip arm. That keeps the walk cycle-free.
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to stat directory entry");
                    continue;
                }
            };

            if file_type.is_dir() {
                if self.walk(&path, map, sink)? == ScanStatus::ThresholdReached {
                    return Ok(ScanStatus::ThresholdReached);
                }
            } else if file_type.is_file() {
                if !self.is_candidate(&path) {
                    continue;
                }
                let Some(id) = pe::extract_interface_id(&path) else {
                    continue;
                };
                debug!(uuid = %id, path = %path.display(), "discovered endpoint");
                map.insert(id, path);
                if map.len() > self.options.flush_threshold {
                    if let Some(sink) = sink {
                        save_endpoints(map, sink)?;
                    }
                    info!(
                        count = map.len(),
                        "endpoint map exceeded flush threshold, interrupting scan"
                    );
                    return Ok(ScanStatus::ThresholdReached);
                }
            } else {
                debug!(path = %path.display(), "skipping non-regular directory entry");
            }
        }

        Ok(ScanStatus::Completed)
    }

    fn is_candidate(&self, path: &Path) -> bool {
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let extension = extension.to_ascii_lowercase();
        self.options.extensions.iter().any(|e| *e == extension)
    }
}

/// Write the endpoint map as a flat dump, one line per endpoint.
pub fn save_endpoints(map: &EndpointMap, path: &Path) -> Result<()> {
    let mut file = fs::File::create(path)?;
    for (id, binary) in map {
        writeln!(file, "Endpoint: {} in {}", id, binary.display())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn id(n: u8) -> InterfaceId {
        InterfaceId::from_str(&format!("{n:08}-0000-0000-0000-000000000000")).unwrap()
    }

    fn write_binary(dir: &Path, name: &str, id: InterfaceId) {
        fs::write(dir.join(name), pe::build_image_with_identity(&id.to_le_bytes())).unwrap();
    }

    fn scanner() -> EndpointScanner {
        EndpointScanner::new(ScanOptions::default())
    }

    #[test]
    fn discovers_identified_binaries() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("nested");
        fs::create_dir(&nested).unwrap();
        write_binary(root.path(), "a.dll", id(1));
        write_binary(&nested, "b.exe", id(2));
        fs::write(root.path().join("notes.txt"), b"ignored").unwrap();

        let mut map = EndpointMap::new();
        let status = scanner().scan(root.path(), &mut map, None).unwrap();

        assert_eq!(status, ScanStatus::Completed);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&id(1)], root.path().join("a.dll"));
        assert_eq!(map[&id(2)], nested.join("b.exe"));
    }

    #[test]
    fn binary_without_identity_yields_empty_map() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("plain.dll"), b"MZ but nothing else").unwrap();

        let mut map = EndpointMap::new();
        let status = scanner().scan(root.path(), &mut map, None).unwrap();

        assert_eq!(status, ScanStatus::Completed);
        assert!(map.is_empty());
    }

    #[test]
    fn rescans_are_idempotent() {
        let root = tempfile::tempdir().unwrap();
        write_binary(root.path(), "a.dll", id(1));
        write_binary(root.path(), "b.dll", id(2));

        let mut first = EndpointMap::new();
        scanner().scan(root.path(), &mut first, None).unwrap();
        let mut second = EndpointMap::new();
        scanner().scan(root.path(), &mut second, None).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_identifier_is_last_writer_wins() {
        let root = tempfile::tempdir().unwrap();
        write_binary(root.path(), "a.dll", id(7));
        write_binary(root.path(), "b.dll", id(7));

        let mut map = EndpointMap::new();
        scanner().scan(root.path(), &mut map, None).unwrap();

        assert_eq!(map.len(), 1);
        let kept = &map[&id(7)];
        assert!(kept.ends_with("a.dll") || kept.ends_with("b.dll"));
    }

    #[test]
    fn threshold_interrupts_and_flushes() {
        let root = tempfile::tempdir().unwrap();
        for n in 1..=5 {
            write_binary(root.path(), &format!("s{n}.dll"), id(n));
        }
        let dump = root.path().join("endpoints.txt");

        let scanner = EndpointScanner::new(ScanOptions {
            flush_threshold: 2,
            ..ScanOptions::default()
        });
        let mut map = EndpointMap::new();
        let status = scanner
            .scan(root.path(), &mut map, Some(dump.as_path()))
            .unwrap();

        assert_eq!(status, ScanStatus::ThresholdReached);
        assert_eq!(map.len(), 3);
        let text = fs::read_to_string(&dump).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().all(|l| l.starts_with("Endpoint: {")));
    }

    #[test]
    fn dump_format_is_one_line_per_endpoint() {
        let root = tempfile::tempdir().unwrap();
        let mut map = EndpointMap::new();
        map.insert(id(1), PathBuf::from("/bin/svc.dll"));
        let dump = root.path().join("endpoints.txt");

        save_endpoints(&map, &dump).unwrap();

        let text = fs::read_to_string(&dump).unwrap();
        assert_eq!(
            text,
            format!("Endpoint: {} in /bin/svc.dll\n", id(1))
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_not_followed() {
        let root = tempfile::tempdir().unwrap();
        let real = root.path().join("real");
        fs::create_dir(&real).unwrap();
        write_binary(&real, "a.dll", id(1));
        std::os::unix::fs::symlink(&real, root.path().join("loop")).unwrap();

        let mut map = EndpointMap::new();
        scanner().scan(root.path(), &mut map, None).unwrap();

        // Reached once through the real directory, not again through the link.
        assert_eq!(map.len(), 1);
        assert_eq!(map[&id(1)], real.join("a.dll"));
    }
}
