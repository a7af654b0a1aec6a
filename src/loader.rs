//! Per-user PDF directories.
//!
//! Every user owns `<documents.root>/<user_id>/`. Files matching
//! `documents.include_globs` (default `**/*.pdf`) are the user's documents;
//! each page becomes one [`PageRecord`] whose `source` is the path relative
//! to the user directory and whose `page` is one-based.
//!
//! User ids pick a directory, so they are restricted to
//! `[A-Za-z0-9_-]{1,64}` before any path is built.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use pdf_rag_core::models::PageRecord;

use crate::config::Config;
use crate::extract::{content_type_for, extract_pages};

const MAX_USER_ID_LEN: usize = 64;

/// A user id that cannot be used as a directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidUser(pub String);

impl std::fmt::Display for InvalidUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid user id '{}': expected 1-{} characters of [A-Za-z0-9_-]",
            self.0, MAX_USER_ID_LEN
        )
    }
}

impl std::error::Error for InvalidUser {}

pub fn validate_user(user_id: &str) -> Result<(), InvalidUser> {
    let valid = !user_id.is_empty()
        && user_id.len() <= MAX_USER_ID_LEN
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(InvalidUser(user_id.to_string()))
    }
}

/// `<documents.root>/<user_id>`, after validating the id.
pub fn tenant_dir(config: &Config, user_id: &str) -> Result<PathBuf> {
    validate_user(user_id)?;
    Ok(config.documents.root.join(user_id))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocumentInfo {
    /// Path relative to the user directory, `/`-separated.
    pub filename: String,
    pub size_bytes: u64,
    /// RFC 3339, UTC.
    pub modified_at: String,
}

/// The user's documents, sorted by file name. A missing directory is an
/// empty list.
pub fn list_documents(config: &Config, user_id: &str) -> Result<Vec<DocumentInfo>> {
    let dir = tenant_dir(config, user_id)?;
    let include_set = build_globset(&config.documents.include_globs)?;

    let mut docs = Vec::new();
    for (path, relative) in scan_dir(&dir, &include_set)? {
        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let modified: DateTime<Utc> = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            .into();
        docs.push(DocumentInfo {
            filename: relative,
            size_bytes: metadata.len(),
            modified_at: modified.to_rfc3339(),
        });
    }
    Ok(docs)
}

/// Extract every page of every document of the user, in file-name order.
///
/// Files that fail to parse are logged and skipped.
pub fn load_pages(config: &Config, user_id: &str) -> Result<Vec<PageRecord>> {
    let dir = tenant_dir(config, user_id)?;
    let include_set = build_globset(&config.documents.include_globs)?;

    let mut pages = Vec::new();
    for (path, relative) in scan_dir(&dir, &include_set)? {
        let Some(content_type) = content_type_for(&relative) else {
            debug!(file = %relative, "skipping non-PDF file");
            continue;
        };

        let bytes =
            std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;

        match extract_pages(&bytes, content_type) {
            Ok(texts) => {
                debug!(file = %relative, pages = texts.len(), "extracted pages");
                for (i, text) in texts.into_iter().enumerate() {
                    pages.push(PageRecord::new(relative.clone(), i as u32 + 1, text));
                }
            }
            Err(e) => warn!(file = %relative, error = %e, "skipping unreadable document"),
        }
    }
    Ok(pages)
}

/// Write an uploaded file into the user directory. Returns the stored name.
///
/// Only the final path component of `filename` is kept, and it must be a
/// PDF.
pub fn save_upload(config: &Config, user_id: &str, filename: &str, bytes: &[u8]) -> Result<String> {
    let name = sanitize_filename(filename)?;
    let dir = tenant_dir(config, user_id)?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let path = dir.join(&name);
    std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(name)
}

pub fn sanitize_filename(filename: &str) -> Result<String> {
    let name = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        bail!("invalid file name: '{}'", filename);
    }
    if content_type_for(name).is_none() {
        bail!("only PDF uploads are accepted: '{}'", name);
    }
    Ok(name.to_string())
}

/// Matching files under `dir` as (absolute path, relative name), sorted.
fn scan_dir(dir: &Path, include_set: &GlobSet) -> Result<Vec<(PathBuf, String)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if !include_set.is_match(&rel_str) {
            continue;
        }
        files.push((path.to_path_buf(), rel_str));
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}
