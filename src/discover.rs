//! Workflow file discovery
//!
//! Walks the given roots and keeps files whose name matches an include glob
//! and whose path matches no exclude glob. Files named explicitly are kept
//! unless excluded.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::DiscoveryConfig;

/// Errors for discovery
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    #[error("Glob pattern error: {0}")]
    GlobError(#[from] globset::Error),

    #[error("Walk error: {0}")]
    WalkError(#[from] walkdir::Error),
}

/// Include/exclude rules for workflow files
#[derive(Debug)]
pub struct WorkflowFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl WorkflowFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, DiscoveryError> {
        Ok(Self {
            include: build_set(include)?,
            exclude: build_set(exclude)?,
        })
    }

    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        Self::new(&config.include, &config.exclude)
    }

    /// Include globs match the file name
    pub fn is_included(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.include.is_match(Path::new(name)))
            .unwrap_or(false)
    }

    /// Exclude globs match the whole path or the file name
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.exclude.is_match(path) {
            return true;
        }
        path.file_name()
            .map(|name| self.exclude.is_match(Path::new(name)))
            .unwrap_or(false)
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, DiscoveryError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns.iter().filter(|p| !p.is_empty()) {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Discover workflow files under `roots`, or the configured defaults when empty.
///
/// Output is sorted and deduplicated.
pub fn discover(roots: &[PathBuf], config: &DiscoveryConfig) -> Result<Vec<PathBuf>, DiscoveryError> {
    let filter = WorkflowFilter::from_config(config)?;
    let roots: &[PathBuf] = if roots.is_empty() { &config.paths } else { roots };

    let mut found = BTreeSet::new();
    for root in roots {
        if root.is_file() {
            if !filter.is_excluded(root) {
                found.insert(root.clone());
            }
            continue;
        }
        if !root.is_dir() {
            return Err(DiscoveryError::NotFound(root.clone()));
        }

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if filter.is_included(path) && !filter.is_excluded(path) {
                found.insert(path.to_path_buf());
            }
        }
    }

    Ok(found.into_iter().collect())
}
