use crate::buckets::{self, bucket_path};
use crate::config::{CHECKPOINT_GROWTH_DIVISOR, CHECKPOINT_VERSION};
use crate::models::WikitextMap;
use crate::stats::{ConversionStats, Diagnostics, UnresolvedLink};
use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Clone, Default, Debug, PartialEq, Eq)]
pub struct CheckpointStats {
    pub pages_converted: u64,
    pub revisions_converted: u64,
    pub links_resolved: u64,
    pub links_unresolved: u64,
    pub converter_calls: u64,
    pub converter_failures: u64,
    pub converter_timeouts: u64,
    pub code_blocks: u64,
    pub macros_expanded: u64,
}

#[derive(Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// Page bucket the run was started from
    pub pages_path: String,
    pub pages_mtime: u64,
    pub pages_size: u64,
    pub converted: WikitextMap,
    pub unresolved_links: BTreeMap<u32, Vec<UnresolvedLink>>,
    pub stats: CheckpointStats,
}

/// Borrowed mirror of [`Checkpoint`]; serializes to the same bytes.
#[derive(Serialize)]
struct CheckpointRef<'a> {
    version: u32,
    pages_path: &'a str,
    pages_mtime: u64,
    pages_size: u64,
    converted: &'a WikitextMap,
    unresolved_links: BTreeMap<u32, Vec<UnresolvedLink>>,
    stats: CheckpointStats,
}

/// Pages to accumulate before the next save once `done` pages are converted.
pub fn effective_interval(interval: u32, done: usize) -> u32 {
    let growth = u32::try_from(done).unwrap_or(u32::MAX) / CHECKPOINT_GROWTH_DIVISOR;
    interval.max(growth).max(1)
}

pub fn checkpoint_path(workspace: &Path) -> PathBuf {
    workspace.join("convert.checkpoint")
}

fn pages_fingerprint(pages_path: &Path) -> Result<(u64, u64)> {
    let metadata = fs::metadata(pages_path)
        .with_context(|| format!("Failed to get metadata for: {:?}", pages_path))?;
    let mtime = metadata
        .modified()
        .context("Failed to get modification time")?
        .duration_since(SystemTime::UNIX_EPOCH)
        .context("Invalid modification time")?
        .as_secs();
    Ok((mtime, metadata.len()))
}

/// Loads the convert checkpoint if it still matches the page bucket on disk.
pub fn load_if_valid(workspace: &Path) -> Result<Option<Checkpoint>> {
    let path = checkpoint_path(workspace);

    if !path.exists() {
        return Ok(None);
    }

    let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    let file = File::open(&path).context("Failed to open checkpoint file")?;
    let reader = BufReader::new(file);

    let options = bincode::options().with_limit(file_size.saturating_add(1024));

    let checkpoint: Checkpoint = match options.deserialize_from(reader) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Checkpoint file is corrupt or unreadable");
            return Ok(None);
        }
    };

    if checkpoint.version != CHECKPOINT_VERSION {
        info!(
            cached = checkpoint.version,
            current = CHECKPOINT_VERSION,
            "Checkpoint version mismatch"
        );
        return Ok(None);
    }

    let pages_path = bucket_path(workspace, buckets::WIKI_PAGES);
    if checkpoint.pages_path != pages_path.to_string_lossy() {
        info!(
            cached = checkpoint.pages_path,
            current = ?pages_path,
            "Checkpoint page bucket mismatch"
        );
        return Ok(None);
    }

    let (mtime, size) = pages_fingerprint(&pages_path)?;
    if checkpoint.pages_mtime != mtime || checkpoint.pages_size != size {
        info!(
            cached_mtime = checkpoint.pages_mtime,
            current_mtime = mtime,
            cached_size = checkpoint.pages_size,
            current_size = size,
            "Page bucket has changed since checkpoint was created"
        );
        return Ok(None);
    }

    info!(
        pages = checkpoint.converted.len(),
        revisions = checkpoint.stats.revisions_converted,
        "Loaded valid checkpoint"
    );

    Ok(Some(checkpoint))
}

pub fn clear(workspace: &Path) -> Result<()> {
    let path = checkpoint_path(workspace);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("Failed to remove checkpoint file: {:?}", path))?;
        info!("Checkpoint cleared");
    }
    Ok(())
}

pub struct CheckpointManager {
    checkpoint_path: PathBuf,
    workspace: PathBuf,
    pages_path: String,
    pages_mtime: u64,
    pages_size: u64,
    interval: u32,
    pages_since_save: AtomicU32,
    save_lock: Mutex<()>,
}

impl CheckpointManager {
    pub fn new(workspace: &Path, interval: u32) -> Result<Self> {
        let pages_path = bucket_path(workspace, buckets::WIKI_PAGES);
        let (pages_mtime, pages_size) = pages_fingerprint(&pages_path)?;
        Ok(Self {
            checkpoint_path: checkpoint_path(workspace),
            workspace: workspace.to_path_buf(),
            pages_path: pages_path.to_string_lossy().into_owned(),
            pages_mtime,
            pages_size,
            interval,
            pages_since_save: AtomicU32::new(0),
            save_lock: Mutex::new(()),
        })
    }

    /// Counts one finished page and saves once enough pages have accumulated.
    ///
    /// Every save rewrites the whole map, so the interval grows with it.
    pub fn maybe_save(
        &self,
        converted: &WikitextMap,
        stats: &ConversionStats,
        diagnostics: &Diagnostics,
    ) -> Result<bool> {
        let count = self.pages_since_save.fetch_add(1, Ordering::Relaxed) + 1;
        let interval = effective_interval(self.interval, converted.len());

        if count >= interval {
            let _guard = match self.save_lock.lock() {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(error = %e, "Checkpoint save lock poisoned, skipping save");
                    return Ok(false);
                }
            };

            let current = self.pages_since_save.load(Ordering::Relaxed);
            if current < interval {
                return Ok(false);
            }

            self.save(converted, stats, diagnostics)?;
            self.pages_since_save.store(0, Ordering::Relaxed);
            return Ok(true);
        }

        Ok(false)
    }

    pub fn save(
        &self,
        converted: &WikitextMap,
        stats: &ConversionStats,
        diagnostics: &Diagnostics,
    ) -> Result<()> {
        let checkpoint = CheckpointRef {
            version: CHECKPOINT_VERSION,
            pages_path: &self.pages_path,
            pages_mtime: self.pages_mtime,
            pages_size: self.pages_size,
            converted,
            unresolved_links: diagnostics.unresolved_links(),
            stats: stats.to_checkpoint(),
        };

        if let Some(parent) = self.checkpoint_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let tmp_path = self.checkpoint_path.with_extension("checkpoint.tmp");
        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp checkpoint file: {:?}", tmp_path))?;
        let writer = BufWriter::new(file);

        bincode::DefaultOptions::new()
            .serialize_into(writer, &checkpoint)
            .context("Failed to serialize checkpoint")?;

        fs::rename(&tmp_path, &self.checkpoint_path).with_context(|| {
            format!(
                "Failed to rename temp checkpoint: {:?}",
                self.checkpoint_path
            )
        })?;

        debug!(
            pages = converted.len(),
            revisions = stats.revisions(),
            "Checkpoint saved"
        );

        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        clear(&self.workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Page, PageKind};
    use std::io::Write;
    use tempfile::TempDir;

    fn create_pages_bucket(dir: &TempDir, content: &str) {
        let path = bucket_path(dir.path(), buckets::WIKI_PAGES);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = File::create(&path).unwrap();
        write!(file, "{content}").unwrap();
    }

    fn converted() -> WikitextMap {
        let mut map = WikitextMap::new();
        map.entry(7).or_default().insert(1, "== Converted ==".to_string());
        map
    }

    fn page(id: u32) -> Page {
        Page {
            id,
            kind: PageKind::Native,
            namespace: 0,
            wiki_id: None,
            project_id: None,
            project_name: None,
            project_identifier: None,
            title: "T".to_string(),
            parent_id: None,
            content_id: None,
            version: 1,
            protected: false,
            categories: Vec::new(),
            formatted_title: "T".to_string(),
            redirects_to: None,
        }
    }

    #[test]
    fn checkpoint_path_returns_correct_path() {
        let path = checkpoint_path(Path::new("/work"));
        assert_eq!(path, PathBuf::from("/work/convert.checkpoint"));
    }

    #[test]
    fn load_if_valid_returns_none_when_no_checkpoint() {
        let dir = TempDir::new().unwrap();
        create_pages_bucket(&dir, "{}");
        assert!(load_if_valid(dir.path()).unwrap().is_none());
    }

    #[test]
    fn checkpoint_manager_save_and_load() {
        let dir = TempDir::new().unwrap();
        create_pages_bucket(&dir, "{}");
        let manager = CheckpointManager::new(dir.path(), 100).unwrap();

        let stats = ConversionStats::new();
        stats.inc_pages();
        stats.inc_revisions();
        let diagnostics = Diagnostics::default();
        diagnostics.record_unresolved_link(&page(7), 1, "Ghost");

        manager.save(&converted(), &stats, &diagnostics).unwrap();

        let loaded = load_if_valid(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.converted, converted());
        assert_eq!(loaded.stats.pages_converted, 1);
        assert_eq!(loaded.stats.revisions_converted, 1);
        assert_eq!(loaded.unresolved_links[&7][0].target, "Ghost");
    }

    #[test]
    fn checkpoint_invalidated_by_page_bucket_change() {
        let dir = TempDir::new().unwrap();
        create_pages_bucket(&dir, "{}");
        let manager = CheckpointManager::new(dir.path(), 100).unwrap();
        manager
            .save(&converted(), &ConversionStats::new(), &Diagnostics::default())
            .unwrap();

        create_pages_bucket(&dir, r#"{"1": {"changed": true}}"#);

        assert!(load_if_valid(dir.path()).unwrap().is_none());
    }

    #[test]
    fn clear_removes_checkpoint() {
        let dir = TempDir::new().unwrap();
        create_pages_bucket(&dir, "{}");
        let manager = CheckpointManager::new(dir.path(), 100).unwrap();
        manager
            .save(&converted(), &ConversionStats::new(), &Diagnostics::default())
            .unwrap();

        let path = checkpoint_path(dir.path());
        assert!(path.exists());

        manager.clear().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn clear_ok_when_no_checkpoint() {
        let dir = TempDir::new().unwrap();
        assert!(clear(dir.path()).is_ok());
    }

    #[test]
    fn maybe_save_respects_interval() {
        let dir = TempDir::new().unwrap();
        create_pages_bucket(&dir, "{}");
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();
        let stats = ConversionStats::new();
        let diagnostics = Diagnostics::default();
        let map = converted();

        assert!(!manager.maybe_save(&map, &stats, &diagnostics).unwrap());
        assert!(!manager.maybe_save(&map, &stats, &diagnostics).unwrap());
        assert!(manager.maybe_save(&map, &stats, &diagnostics).unwrap());

        // Counter resets
        assert!(!manager.maybe_save(&map, &stats, &diagnostics).unwrap());
        assert!(!manager.maybe_save(&map, &stats, &diagnostics).unwrap());
        assert!(manager.maybe_save(&map, &stats, &diagnostics).unwrap());
    }

    #[test]
    fn interval_grows_with_converted_pages() {
        assert_eq!(effective_interval(200, 0), 200);
        assert_eq!(effective_interval(200, 1_999), 200);
        assert_eq!(effective_interval(200, 50_000), 5_000);
        assert_eq!(effective_interval(0, 0), 1);
    }

    #[test]
    fn large_map_defers_saves() {
        let dir = TempDir::new().unwrap();
        create_pages_bucket(&dir, "{}");
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let stats = ConversionStats::new();
        let diagnostics = Diagnostics::default();
        let mut map = WikitextMap::new();
        for id in 0..40 {
            map.entry(id).or_default().insert(1, String::new());
        }

        // 40 pages done: saves every 4 pages instead of every 2
        for _ in 0..3 {
            assert!(!manager.maybe_save(&map, &stats, &diagnostics).unwrap());
        }
        assert!(manager.maybe_save(&map, &stats, &diagnostics).unwrap());
        assert_eq!(load_if_valid(dir.path()).unwrap().unwrap().converted, map);
    }

    #[test]
    fn corrupt_checkpoint_returns_none() {
        let dir = TempDir::new().unwrap();
        create_pages_bucket(&dir, "{}");
        let mut file = File::create(checkpoint_path(dir.path())).unwrap();
        file.write_all(b"not valid bincode").unwrap();

        assert!(load_if_valid(dir.path()).unwrap().is_none());
    }
}
