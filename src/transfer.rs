//! `FileTransfer(src, dst, list)` (§1's external collaborator): copies
//! missing/changed files from a source root into a destination root.
//!
//! Grounded on `original_source/utils.py::rsync`'s intent (`-a --inplace
//! --partial`: copy in place, skip files that already match) without
//! shelling out to `rsync`: a same-host backup controller can do the
//! equivalent with `std::fs::copy` plus a size/mtime comparison, and a
//! remote source is explicitly out of scope for this module (the planner
//! retries it next cycle, per §7's I/O error taxonomy).

use std::path::Path;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Copied,
    AlreadyCurrent,
    Failed,
    Unavailable,
}

pub struct TransferReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

/// Copies every path in `list` from `src_root` to `dst_root`, skipping
/// paths whose destination already matches size and mtime. Only a local
/// (same-host) source is supported; anything else returns
/// [`Outcome::Unavailable`] for every path.
pub fn sync_files(src_root: &Path, dst_root: &Path, list: &[String]) -> TransferReport {
    let mut report = TransferReport { succeeded: Vec::new(), failed: Vec::new() };
    if !src_root.exists() {
        warn!(src = %src_root.display(), "transfer source root unavailable, skipping batch");
        report.failed = list.to_vec();
        return report;
    }

    for rel in list {
        match sync_one(src_root, dst_root, rel) {
            Outcome::Copied | Outcome::AlreadyCurrent => report.succeeded.push(rel.clone()),
            Outcome::Failed | Outcome::Unavailable => report.failed.push(rel.clone()),
        }
    }
    report
}

fn sync_one(src_root: &Path, dst_root: &Path, rel: &str) -> Outcome {
    let src = src_root.join(rel);
    let dst = dst_root.join(rel);

    let src_meta = match std::fs::metadata(&src) {
        Ok(m) => m,
        Err(_) => return Outcome::Failed,
    };

    if let Ok(dst_meta) = std::fs::metadata(&dst) {
        if dst_meta.len() == src_meta.len() && mtimes_match(&src_meta, &dst_meta) {
            return Outcome::AlreadyCurrent;
        }
    }

    if let Some(parent) = dst.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %dst.display(), error = %e, "could not create destination directory");
            return Outcome::Failed;
        }
    }

    match std::fs::copy(&src, &dst) {
        Ok(_) => Outcome::Copied,
        Err(e) => {
            warn!(path = %rel, error = %e, "file copy failed");
            Outcome::Failed
        }
    }
}

fn mtimes_match(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    match (a.modified(), b.modified()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
