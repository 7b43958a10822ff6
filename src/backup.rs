//! Rotates timestamped copies of the database file. A backup is named
//! `{dbfile}.{version}` with every `.` inside `version` replaced by `_` (so a
//! dotted version string like a timestamp doesn't get mistaken for another
//! extension), and only the newest `max_backups` are kept, oldest evicted
//! first by name, falling back to mtime for ties.

use std::{fs, path::{Path, PathBuf}};

use crate::error::ImportError;

fn version_suffix(version: &str) -> String {
    version.replace('.', "_")
}

pub fn backup_file_name(db_path: &Path, version: &str) -> PathBuf {
    let file_name = db_path.file_name().and_then(|n| n.to_str()).unwrap_or("db");
    db_path.with_file_name(format!("{file_name}.{}", version_suffix(version)))
}

/// Copies `db_path` to a new backup named after `version`, then deletes the
/// oldest backups beyond `max_backups` in the same directory.
pub fn create_backup(db_path: &Path, version: &str, max_backups: usize) -> Result<PathBuf, ImportError> {
    let backup_path = backup_file_name(db_path, version);
    fs::copy(db_path, &backup_path).map_err(|e| ImportError::Io {
        path: db_path.display().to_string(),
        source: e,
    })?;
    prune_backups(db_path, max_backups)?;
    Ok(backup_path)
}

fn prune_backups(db_path: &Path, max_backups: usize) -> Result<(), ImportError> {
    let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = db_path.file_name().and_then(|n| n.to_str()).unwrap_or("db").to_string();
    let prefix = format!("{stem}.");

    let mut backups: Vec<(PathBuf, std::time::SystemTime, String)> = fs::read_dir(dir)
        .map_err(|e| ImportError::Io { path: dir.display().to_string(), source: e })?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?.to_string();
            if !name.starts_with(&prefix) || name == stem {
                return None;
            }
            let mtime = entry.metadata().ok()?.modified().ok()?;
            Some((path, mtime, name))
        })
        .collect();

    backups.sort_by(|a, b| a.2.cmp(&b.2).then(a.1.cmp(&b.1)));

    if backups.len() > max_backups {
        let excess = backups.len() - max_backups;
        for (path, _, _) in &backups[..excess] {
            if let Err(e) = fs::remove_file(path) {
                log::warn!("failed to prune old backup {}: {e}", path.display());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    #[test]
    fn backup_name_replaces_dots_in_version() {
        let name = backup_file_name(Path::new("/var/lib/bot/state.db"), "1.2.3");
        assert_eq!(name, Path::new("/var/lib/bot/state.db.1_2_3"));
    }

    #[test]
    fn retains_only_the_newest_n_backups() {
        let dir = std::env::temp_dir().join(format!("backup_test_{}", std::process::id()));
        stdfs::create_dir_all(&dir).unwrap();
        let db_path = dir.join("state.db");
        stdfs::write(&db_path, b"db contents").unwrap();

        for v in ["1", "2", "3", "4"] {
            create_backup(&db_path, v, 2).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let remaining: Vec<String> = stdfs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("state.db."))
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"state.db.3".to_string()));
        assert!(remaining.contains(&"state.db.4".to_string()));

        stdfs::remove_dir_all(&dir).unwrap();
    }
}
