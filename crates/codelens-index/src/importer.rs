//! Local directory import: walk → filter → replace the repository's file set.

use std::path::{Path, PathBuf};

use codelens_store::{DocumentStore, Repository, SourceFile};

use crate::error::{IndexError, Result};
use crate::languages::detect_language;

/// Files above this size are skipped.
pub const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Bytes inspected for NUL when sniffing binary content.
const BINARY_SNIFF_BYTES: usize = 8192;

/// Summary of an import run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub files_scanned: usize,
    pub files_imported: usize,
    pub skipped_unsupported: usize,
    pub skipped_oversized: usize,
    pub skipped_binary: usize,
    pub errors: Vec<String>,
}

/// Walk `root` honouring `.gitignore` and hidden-file rules and read every
/// file with a recognised language.
///
/// # Errors
///
/// Returns an error if `root` is not a readable directory.
pub fn collect_files(repository_id: &str, root: &Path) -> Result<(Vec<SourceFile>, ImportReport)> {
    if !root.is_dir() {
        return Err(IndexError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("not a directory: {}", root.display()),
        )));
    }

    let mut report = ImportReport::default();
    let mut files = Vec::new();

    let entries = ignore::WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .build();

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                report.errors.push(e.to_string());
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        report.files_scanned += 1;

        let path = entry.path();
        let Some(lang) = detect_language(path) else {
            report.skipped_unsupported += 1;
            continue;
        };
        let rel_path = relative_path(root, path);

        match entry.metadata() {
            Ok(meta) if meta.len() > MAX_FILE_BYTES => {
                tracing::debug!(file = %rel_path, bytes = meta.len(), "skipping oversized file");
                report.skipped_oversized += 1;
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                report.errors.push(format!("{rel_path}: {e}"));
                continue;
            }
        }

        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                report.errors.push(format!("{rel_path}: {e}"));
                continue;
            }
        };
        let Some(content) = decode_text(bytes) else {
            report.skipped_binary += 1;
            continue;
        };

        files.push(SourceFile {
            repository_id: repository_id.to_owned(),
            path: rel_path,
            language: lang.id().to_owned(),
            content,
        });
        report.files_imported += 1;
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok((files, report))
}

/// Register `repository` and replace its files with the contents of `root`.
///
/// Chunks are not touched; the next embedding run reconciles them.
///
/// # Errors
///
/// Returns an error if the directory cannot be walked or the store fails.
pub async fn import_directory(
    store: &dyn DocumentStore,
    repository: Repository,
    root: PathBuf,
) -> Result<ImportReport> {
    let repository_id = repository.id.clone();
    let walk_id = repository_id.clone();
    let (files, report) =
        tokio::task::spawn_blocking(move || collect_files(&walk_id, &root))
            .await
            .map_err(|e| IndexError::Io(std::io::Error::other(e)))??;

    store.upsert_repository(repository).await?;
    store.replace_files(&repository_id, files).await?;

    tracing::info!(
        repository_id = %repository_id,
        scanned = report.files_scanned,
        imported = report.files_imported,
        skipped = report.skipped_unsupported + report.skipped_oversized + report.skipped_binary,
        "repository imported"
    );
    Ok(report)
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn decode_text(bytes: Vec<u8>) -> Option<String> {
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return None;
    }
    String::from_utf8(bytes).ok()
}
