//! Named JSON buckets that carry intermediate results between stages.
//!
//! Each stage opens the buckets it reads or writes, works on them in memory
//! and flushes them once at the end. Files live under `<workspace>/buckets/`.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const WIKI_PAGES: &str = "wiki-pages";
pub const PAGE_REVISIONS: &str = "page-revisions";
pub const ATTACHMENT_FILES: &str = "attachment-files";
pub const DIAGRAM_CONTENTS: &str = "diagram-contents";
pub const SAMENAME_ATTACHMENTS: &str = "samename-attachments";
pub const REVISION_WIKITEXT: &str = "revision-wikitext";
pub const CUSTOMIZATIONS: &str = "customizations";
pub const MISSING_TITLES: &str = "missing-titles";
pub const MISSING_ATTACHMENTS: &str = "missing-attachments";
pub const UNRESOLVED_LINKS: &str = "unresolved-links";
pub const UNRESOLVED_REDIRECTS: &str = "unresolved-redirects";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Deep-merge objects into what is already there
    Merge,
    Overwrite,
}

pub fn bucket_path(workspace: &Path, name: &str) -> PathBuf {
    workspace.join("buckets").join(format!("{name}.json"))
}

pub struct DataBuckets {
    workspace: PathBuf,
    buckets: BTreeMap<String, Value>,
}

impl DataBuckets {
    /// Loads the named buckets; ones that do not exist yet start empty.
    pub fn open(workspace: &Path, names: &[&str]) -> Result<Self> {
        let mut buckets = BTreeMap::new();
        for name in names {
            let path = bucket_path(workspace, name);
            let value = if path.exists() {
                let file = File::open(&path)
                    .with_context(|| format!("Failed to open bucket: {:?}", path))?;
                serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("Failed to parse bucket: {:?}", path))?
            } else {
                Value::Object(Map::new())
            };
            buckets.insert(name.to_string(), value);
        }
        debug!(workspace = ?workspace, buckets = names.len(), "Buckets loaded");
        Ok(Self {
            workspace: workspace.to_path_buf(),
            buckets,
        })
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .buckets
            .get(name)
            .ok_or_else(|| anyhow!("Bucket not loaded: {name}"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("Bucket has unexpected shape: {name}"))
    }

    pub fn is_empty(&self, name: &str) -> bool {
        match self.buckets.get(name) {
            Some(Value::Object(map)) => map.is_empty(),
            Some(Value::Null) | None => true,
            Some(_) => false,
        }
    }

    pub fn put<T: Serialize>(&mut self, name: &str, data: &T, mode: WriteMode) -> Result<()> {
        let incoming = serde_json::to_value(data)
            .with_context(|| format!("Failed to serialize bucket: {name}"))?;
        let slot = self
            .buckets
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match mode {
            WriteMode::Overwrite => *slot = incoming,
            WriteMode::Merge => merge_values(slot, incoming),
        }
        Ok(())
    }

    /// Writes every loaded bucket via temp file + rename.
    pub fn flush(&self) -> Result<()> {
        let dir = self.workspace.join("buckets");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {:?}", dir))?;

        for (name, value) in &self.buckets {
            let path = bucket_path(&self.workspace, name);
            let tmp_path = path.with_extension("json.tmp");
            let file = File::create(&tmp_path)
                .with_context(|| format!("Failed to create temp bucket file: {:?}", tmp_path))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, value)
                .with_context(|| format!("Failed to write bucket: {name}"))?;
            writer.flush()?;
            drop(writer);
            fs::rename(&tmp_path, &path)
                .with_context(|| format!("Failed to rename temp bucket file to: {:?}", path))?;
        }

        info!(buckets = self.buckets.len(), "Buckets saved");
        Ok(())
    }
}

fn merge_values(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(update)) => {
            for (key, value) in update {
                match existing.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
