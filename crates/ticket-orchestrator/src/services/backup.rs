//! Pre-run project snapshots as zip archives

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::store::Project;

const SKIP_DIRS: &[&str] = &[".git", "node_modules", "vendor", "target", "__pycache__", ".venv"];

#[async_trait]
pub trait BackupService: Send + Sync {
    /// Snapshot a project's files; returns the archive path when one was written.
    async fn backup(&self, project: &Project) -> anyhow::Result<Option<PathBuf>>;
}

pub struct NoopBackup;

#[async_trait]
impl BackupService for NoopBackup {
    async fn backup(&self, _project: &Project) -> anyhow::Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Writes `<root>/<code>/<code>_<timestamp>_auto.zip` and keeps the newest
/// `max_backups` archives per project.
pub struct ZipBackupService {
    root: PathBuf,
    max_backups: usize,
}

impl ZipBackupService {
    pub fn new(root: PathBuf, max_backups: usize) -> Self {
        Self { root, max_backups }
    }

    fn write_archive(root: &Path, max_backups: usize, project: &Project) -> anyhow::Result<Option<PathBuf>> {
        let sources: Vec<(&str, &Path)> = [("web", project.web_path.as_deref()), ("app", project.app_path.as_deref())]
            .into_iter()
            .filter_map(|(label, path)| path.map(|p| (label, Path::new(p))))
            .filter(|(_, path)| path.is_dir())
            .collect();
        if sources.is_empty() {
            debug!(project = %project.code, "nothing to back up");
            return Ok(None);
        }

        let dir = root.join(&project.code);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let path = dir.join(format!("{}_{}_auto.zip", project.code, stamp));

        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut files = 0usize;
        for (label, source) in &sources {
            files += add_tree(&mut zip, options, source, source, label)?;
        }
        zip.finish()?;

        info!(project = %project.code, files, archive = %path.display(), "project backup written");
        prune(&dir, &project.code, max_backups)?;
        Ok(Some(path))
    }
}

#[async_trait]
impl BackupService for ZipBackupService {
    async fn backup(&self, project: &Project) -> anyhow::Result<Option<PathBuf>> {
        let root = self.root.clone();
        let max_backups = self.max_backups;
        let project = project.clone();
        tokio::task::spawn_blocking(move || Self::write_archive(&root, max_backups, &project)).await?
    }
}

fn add_tree(
    zip: &mut ZipWriter<File>,
    options: SimpleFileOptions,
    base: &Path,
    dir: &Path,
    prefix: &str,
) -> anyhow::Result<usize> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?.filter_map(Result::ok).collect();
    children.sort_by_key(|e| e.file_name());

    let mut count = 0;
    let mut buffer = Vec::new();
    for entry in children {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else { continue };
        let rel = match path.strip_prefix(base) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        let archive_name = format!("{}/{}", prefix, rel);

        if file_type.is_dir() {
            if SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            zip.add_directory(archive_name, options)?;
            count += add_tree(zip, options, base, &path, prefix)?;
        } else if file_type.is_file() {
            buffer.clear();
            match File::open(&path).and_then(|mut f| f.read_to_end(&mut buffer)) {
                Ok(_) => {
                    zip.start_file(archive_name, options)?;
                    zip.write_all(&buffer)?;
                    count += 1;
                }
                Err(e) => warn!("skipping {} in backup: {}", path.display(), e),
            }
        }
    }
    Ok(count)
}

/// Delete the oldest automatic archives beyond `keep`.
fn prune(dir: &Path, code: &str, keep: usize) -> anyhow::Result<usize> {
    let prefix = format!("{}_", code);
    let mut archives: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with("_auto.zip"))
                .unwrap_or(false)
        })
        .collect();
    if archives.len() <= keep {
        return Ok(0);
    }

    // Timestamped names sort chronologically.
    archives.sort();
    let excess = archives.len() - keep;
    for old in &archives[..excess] {
        if let Err(e) = std::fs::remove_file(old) {
            warn!("failed to remove old backup {}: {}", old.display(), e);
        }
    }
    Ok(excess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProjectStatus;

    fn project(code: &str, web: Option<&Path>) -> Project {
        Project {
            id: 1,
            name: code.to_string(),
            code: code.to_string(),
            web_path: web.map(|p| p.display().to_string()),
            app_path: None,
            project_type: None,
            tech_stack: Vec::new(),
            context: None,
            status: ProjectStatus::Active,
            total_tokens: 0,
            total_duration_seconds: 0,
        }
    }

    #[tokio::test]
    async fn test_backup_archives_tree_without_vcs() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("site");
        std::fs::create_dir_all(site.join("src")).unwrap();
        std::fs::create_dir_all(site.join(".git")).unwrap();
        std::fs::write(site.join("index.php"), "<?php echo 1;").unwrap();
        std::fs::write(site.join("src/app.php"), "<?php").unwrap();
        std::fs::write(site.join(".git/HEAD"), "ref").unwrap();

        let service = ZipBackupService::new(dir.path().join("backups"), 30);
        let archive = service.backup(&project("SITE", Some(&site))).await.unwrap().unwrap();

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let names: Vec<String> = (0..zip.len()).map(|i| zip.by_index(i).unwrap().name().to_string()).collect();
        assert!(names.contains(&"web/index.php".to_string()));
        assert!(names.contains(&"web/src/app.php".to_string()));
        assert!(!names.iter().any(|n| n.contains(".git")));
    }

    #[tokio::test]
    async fn test_project_without_paths_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let service = ZipBackupService::new(dir.path().to_path_buf(), 30);
        assert!(service.backup(&project("EMPTY", None)).await.unwrap().is_none());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("ABC_2024010{}_000000000_auto.zip", i)), "").unwrap();
        }
        std::fs::write(dir.path().join("ABC_manual.zip"), "").unwrap();

        assert_eq!(prune(dir.path(), "ABC", 3).unwrap(), 2);
        assert!(!dir.path().join("ABC_20240100_000000000_auto.zip").exists());
        assert!(dir.path().join("ABC_20240104_000000000_auto.zip").exists());
        assert!(dir.path().join("ABC_manual.zip").exists());
    }
}
