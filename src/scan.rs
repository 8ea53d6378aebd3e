use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::ExtractConfig;
use crate::extract::content_type_for_path;
use crate::models::SourceFile;

/// Result of walking a source directory.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Matching files, sorted by path.
    pub files: Vec<SourceFile>,
    /// Entries that could not be walked (permissions, broken or looping
    /// symlinks), one message each.
    pub errors: Vec<String>,
}

/// Walk `root` and return every file matching the configured globs,
/// sorted by path for deterministic processing order.
///
/// Only a missing `root` or a bad glob is an error; an entry that cannot
/// be walked is reported in [`ScanReport::errors`] and skipped.
pub fn scan_directory(root: &Path, config: &ExtractConfig) -> Result<ScanReport> {
    if !root.is_dir() {
        bail!("Source directory does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec!["**/.git/**".to_string()];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut report = ScanReport::default();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                report.errors.push(e.to_string());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        // Match case-insensitively on the extension: `REPORT.PDF` is a PDF.
        let rel_str = relative.to_string_lossy().to_lowercase();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        report.files.push(SourceFile {
            path: path.to_path_buf(),
            file_name,
            content_type: content_type_for_path(path).to_string(),
        });
    }

    report.files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(report)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(&pattern.to_lowercase())?);
    }
    Ok(builder.build()?)
}
