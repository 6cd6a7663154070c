//! Attachment payload extraction into the workspace upload directory.
//!
//! A payload that cannot be found or decoded is logged and counted; the
//! stage only fails on errors writing to the workspace itself.

use crate::attachment::{AttachmentMap, DiagramMap};
use crate::buckets::{self, DataBuckets};
use crate::config::UPLOAD_DIR;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractSummary {
    pub attachments_copied: usize,
    pub attachments_missing: usize,
    pub diagrams_written: usize,
    pub diagrams_invalid: usize,
    pub bytes_written: u64,
}

pub fn upload_dir(workspace: &Path) -> PathBuf {
    workspace.join(UPLOAD_DIR)
}

pub fn decode_diagram(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .context("Diagram payload is not valid base64")
}

/// Copies the latest version of every attachment from `files_dir`.
pub fn copy_attachments(attachments: &AttachmentMap, files_dir: &Path, out_dir: &Path, summary: &mut ExtractSummary) -> Result<()> {
    for file in attachments.values() {
        let Some(latest) = file.latest() else {
            continue;
        };
        let source = files_dir.join(&latest.source_path);
        let dest = out_dir.join(&latest.target_filename);
        if !source.is_file() {
            warn!(attachment_id = file.id, source = ?source, "Attachment file missing");
            summary.attachments_missing += 1;
            continue;
        }
        let bytes = fs::copy(&source, &dest)
            .with_context(|| format!("Failed to copy {:?} to {:?}", source, dest))?;
        debug!(attachment_id = file.id, file = %latest.target_filename, bytes, "Attachment copied");
        summary.attachments_copied += 1;
        summary.bytes_written += bytes;
    }
    Ok(())
}

pub fn write_diagrams(diagrams: &DiagramMap, out_dir: &Path, summary: &mut ExtractSummary) -> Result<()> {
    for diagram in diagrams.values() {
        let bytes = match decode_diagram(&diagram.data_base64) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(diagram_id = diagram.id, error = %e, "Skipping diagram");
                summary.diagrams_invalid += 1;
                continue;
            }
        };
        let dest = out_dir.join(&diagram.target_filename);
        fs::write(&dest, &bytes).with_context(|| format!("Failed to write diagram: {:?}", dest))?;
        summary.diagrams_written += 1;
        summary.bytes_written += bytes.len() as u64;
    }
    Ok(())
}

pub fn run(workspace: &Path, files_dir: &Path) -> Result<ExtractSummary> {
    let store = DataBuckets::open(workspace, &[buckets::ATTACHMENT_FILES, buckets::DIAGRAM_CONTENTS])?;
    let attachments: AttachmentMap = store.get(buckets::ATTACHMENT_FILES)?;
    let diagrams: DiagramMap = store.get(buckets::DIAGRAM_CONTENTS)?;

    let out_dir = upload_dir(workspace);
    fs::create_dir_all(&out_dir).with_context(|| format!("Failed to create {:?}", out_dir))?;

    let mut summary = ExtractSummary::default();
    copy_attachments(&attachments, files_dir, &out_dir, &mut summary)?;
    write_diagrams(&diagrams, &out_dir, &mut summary)?;

    info!(
        copied = summary.attachments_copied,
        missing = summary.attachments_missing,
        diagrams = summary.diagrams_written,
        "Extraction complete"
    );
    Ok(summary)
}
