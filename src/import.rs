//! One-shot file-to-database migration. Each recognized file under the import
//! directory is read once, loaded into the matching store, then renamed to
//! `{name}.loaded` so a restart never re-imports it. Files already ending in
//! `.loaded` are skipped on sight.

use std::{ffi::OsStr, fs, path::Path};

use crate::error::ImportError;
use crate::storage::dictionary::{DictionaryStore, DictionaryType};
use crate::storage::samples::{SampleOrigin, SampleType, SamplesStore};

const LOADED_SUFFIX: &str = ".loaded";

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportSummary {
    pub files_imported: u32,
    pub files_skipped: u32,
}

/// Recognized source file names, mapped to what they populate. Anything else
/// under the directory is left alone.
enum Target {
    Samples(SampleType),
    Dictionary(DictionaryType),
}

fn target_for(file_name: &str) -> Option<Target> {
    match file_name {
        "spam.txt" => Some(Target::Samples(SampleType::Spam)),
        "ham.txt" => Some(Target::Samples(SampleType::Ham)),
        "stop_words.txt" => Some(Target::Dictionary(DictionaryType::StopPhrase)),
        "ignored_words.txt" => Some(Target::Dictionary(DictionaryType::IgnoredWord)),
        _ => None,
    }
}

/// Scans `dir` for recognized, not-yet-loaded source files and imports each
/// one with `origin = preset`, replacing the existing preset set. Files whose
/// name doesn't match a known target, or that already end in `.loaded`, are
/// left untouched and counted in `files_skipped`.
pub async fn import_directory(
    dir: &Path,
    samples: &SamplesStore,
    dictionary: &DictionaryStore,
) -> Result<ImportSummary, ImportError> {
    let mut summary = ImportSummary::default();

    let entries = fs::read_dir(dir).map_err(|e| ImportError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| ImportError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        if file_name.ends_with(LOADED_SUFFIX) {
            summary.files_skipped += 1;
            continue;
        }
        let Some(target) = target_for(file_name) else {
            summary.files_skipped += 1;
            continue;
        };

        let content = fs::read_to_string(&path).map_err(|e| ImportError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        match target {
            Target::Samples(kind) => {
                samples.import(kind, SampleOrigin::Preset, &content, true).await?;
            }
            Target::Dictionary(kind) => {
                dictionary.import(kind, &content, true).await?;
            }
        }

        let loaded_path = path.with_file_name(format!("{file_name}{LOADED_SUFFIX}"));
        fs::rename(&path, &loaded_path).map_err(|e| ImportError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        summary.files_imported += 1;
        log::info!("imported {file_name} into the database");
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Engine;
    use std::fs as stdfs;

    async fn stores() -> (SamplesStore, DictionaryStore) {
        let e1 = Engine::open("memory", "g1").await.unwrap();
        let e2 = Engine::open("memory", "g1").await.unwrap();
        (
            SamplesStore::new(e1).await.unwrap(),
            DictionaryStore::new(e2).await.unwrap(),
        )
    }

    #[tokio::test]
    async fn imports_recognized_files_and_renames_them() {
        let dir = std::env::temp_dir().join(format!("import_test_{}", std::process::id()));
        stdfs::create_dir_all(&dir).unwrap();
        stdfs::write(dir.join("spam.txt"), "buy now\ncheap meds\n").unwrap();
        stdfs::write(dir.join("notes.txt"), "not a recognized file").unwrap();

        let (samples, dictionary) = stores().await;
        let summary = import_directory(&dir, &samples, &dictionary).await.unwrap();

        assert_eq!(summary.files_imported, 1);
        assert_eq!(summary.files_skipped, 1);
        assert!(dir.join("spam.txt.loaded").exists());
        assert!(!dir.join("spam.txt").exists());

        let rows = samples.read(SampleType::Spam, SampleOrigin::Any).await.unwrap();
        assert_eq!(rows.len(), 2);

        stdfs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn already_loaded_files_are_skipped() {
        let dir = std::env::temp_dir().join(format!("import_test_loaded_{}", std::process::id()));
        stdfs::create_dir_all(&dir).unwrap();
        stdfs::write(dir.join("ham.txt.loaded"), "hello there\n").unwrap();

        let (samples, dictionary) = stores().await;
        let summary = import_directory(&dir, &samples, &dictionary).await.unwrap();

        assert_eq!(summary.files_imported, 0);
        assert_eq!(summary.files_skipped, 1);

        stdfs::remove_dir_all(&dir).unwrap();
    }
}
