//! Candidate configuration file discovery.
//!
//! Finds registry source files under a root by extension, filtered through
//! an externally-supplied "is this RPC-related" predicate. Directory access
//! failures are logged and skipped, like the endpoint scanner's walk.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Externally-defined relevance predicate for candidate files.
pub trait RpcRelatedProbe {
    fn is_rpc_related(&self, path: &Path) -> bool;
}

/// Probe accepting every candidate.
pub struct AcceptAll;

impl RpcRelatedProbe for AcceptAll {
    fn is_rpc_related(&self, _path: &Path) -> bool {
        true
    }
}

/// Probe matching paths that mention a known interface UUID.
pub struct KnownInterfaceProbe {
    uuids: Vec<String>,
}

impl KnownInterfaceProbe {
    pub fn new(uuids: Vec<String>) -> Self {
        Self {
            uuids: uuids.into_iter().map(|u| u.to_ascii_lowercase()).collect(),
        }
    }
}

impl RpcRelatedProbe for KnownInterfaceProbe {
    fn is_rpc_related(&self, path: &Path) -> bool {
        let path = path.to_string_lossy().to_ascii_lowercase();
        self.uuids.iter().any(|uuid| path.contains(uuid))
    }
}

/// Recursive extension-filtered file search.
pub struct ConfigCrawler {
    root: PathBuf,
    extensions: Vec<String>,
}

impl ConfigCrawler {
    /// `extensions` are matched case-insensitively, without the dot.
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            extensions: extensions
                .into_iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn find_files(&self, probe: &dyn RpcRelatedProbe) -> Vec<PathBuf> {
        let mut found = Vec::new();
        self.search(&self.root, probe, &mut found);
        found
    }

    fn search(&self, dir: &Path, probe: &dyn RpcRelatedProbe, found: &mut Vec<PathBuf>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "failed to access directory, skipping");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                self.search(&path, probe, found);
            } else if file_type.is_file()
                && self.matches_extension(&path)
                && probe.is_rpc_related(&path)
            {
                found.push(path);
            }
        }
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|e| self.extensions.contains(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_files_by_extension() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("conf");
        fs::create_dir(&nested).unwrap();
        fs::write(root.path().join("servers.json"), b"[]").unwrap();
        fs::write(nested.join("more.JSON"), b"[]").unwrap();
        fs::write(nested.join("readme.txt"), b"").unwrap();

        let crawler = ConfigCrawler::new(root.path(), vec!["json".into()]);
        let mut found = crawler.find_files(&AcceptAll);
        found.sort();

        assert_eq!(
            found,
            vec![nested.join("more.JSON"), root.path().join("servers.json")]
        );
    }

    #[test]
    fn probe_filters_candidates() {
        let root = tempfile::tempdir().unwrap();
        fs::write(
            root.path()
                .join("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee.json"),
            b"[]",
        )
        .unwrap();
        fs::write(root.path().join("unrelated.json"), b"[]").unwrap();

        let crawler = ConfigCrawler::new(root.path(), vec!["json".into()]);
        let probe =
            KnownInterfaceProbe::new(vec!["AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE".to_string()]);
        let found = crawler.find_files(&probe);

        assert_eq!(found.len(), 1);
        assert!(found[0].to_string_lossy().contains("aaaaaaaa"));
    }

    #[test]
    fn missing_root_finds_nothing() {
        let root = tempfile::tempdir().unwrap();
        let crawler = ConfigCrawler::new(root.path().join("absent"), vec!["json".into()]);
        assert!(crawler.find_files(&AcceptAll).is_empty());
    }
}
