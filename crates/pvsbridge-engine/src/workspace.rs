//! Workspace files: specification listings, theory discovery, cache cleanup
//! and the `.tccs` obligation artifacts

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::types::TccDescriptor;

pub const PVS_EXTENSIONS: [&str; 2] = [".pvs", ".hpvs"];
pub const CACHE_FOLDER: &str = "pvsbin";
pub const CONTEXT_FILE: &str = ".pvscontext";
pub const TCCS_EXTENSION: &str = ".tccs";

static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"%.*").expect("valid regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

static THEORY_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?mi)^[ \t]*(?P<id>[A-Za-z][A-Za-z0-9_?]*)\s*(?:\[(?:[^\[\]]|\[[^\[\]]*\])*\])?\s*:\s*(?:THEORY|DATATYPE|CODATATYPE)\b",
    )
    .expect("valid regex")
});

/// Specification files of one context folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    pub context_folder: String,
    pub file_names: Vec<String>,
}

/// A theory declared in a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TheoryRef {
    pub theory_name: String,
    /// File name without extension
    pub file_name: String,
    /// 1-based line of the declaration
    pub line: u32,
}

/// A file path split the way requests name files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub context_folder: String,
    pub file_name: String,
    pub file_extension: String,
}

/// Strip a `file://` scheme, expand `~` and drop trailing separators
pub fn normalize_context_folder(folder: &str) -> String {
    let folder = folder.trim();
    let folder = folder.strip_prefix("file://").unwrap_or(folder);
    let expanded = match folder.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => dirs::home_dir()
            .map(|home| format!("{}{}", home.display(), rest))
            .unwrap_or_else(|| folder.to_string()),
        _ => folder.to_string(),
    };
    crate::handle::normalize_folder(&expanded)
}

/// Split `/ctx/foo.pvs` into folder, name and extension
pub fn normalize_file_name(path: &str) -> FileDescriptor {
    let path = path.trim();
    let path = path.strip_prefix("file://").unwrap_or(path);
    let (folder, base) = match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    };
    let (name, ext) = match base.rfind('.') {
        Some(idx) if idx > 0 => (&base[..idx], &base[idx..]),
        _ => (base, ""),
    };
    FileDescriptor {
        context_folder: normalize_context_folder(folder),
        file_name: name.to_string(),
        file_extension: ext.to_string(),
    }
}

/// Files under the engine installation are prelude or library files
pub fn is_library_file(path: &Path, pvs_path: &Path) -> bool {
    !pvs_path.as_os_str().is_empty() && path.starts_with(pvs_path)
}

pub fn is_pvs_file(name: &str) -> bool {
    !name.starts_with('.') && PVS_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// `.pvs` and `.hpvs` files in `folder`, sorted; dotfiles are engine temporaries
pub async fn list_pvs_files(folder: &Path) -> Result<FileList> {
    let mut entries = fs::read_dir(folder).await?;
    let mut file_names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_pvs_file(&name) {
            file_names.push(name);
        }
    }
    file_names.sort();
    Ok(FileList {
        context_folder: folder.to_string_lossy().into_owned(),
        file_names,
    })
}

/// Theory declarations in specification text, in order of appearance
pub fn theories_in_text(text: &str, file_name: &str) -> Vec<TheoryRef> {
    let stripped = COMMENT.replace_all(text, "");
    THEORY_DECL
        .captures_iter(&stripped)
        .filter_map(|caps| {
            let id = caps.name("id")?;
            let line = stripped[..id.start()].matches('\n').count() as u32 + 1;
            Some(TheoryRef {
                theory_name: id.as_str().to_string(),
                file_name: file_name.to_string(),
                line,
            })
        })
        .collect()
}

pub async fn list_theories(path: &Path) -> Result<Vec<TheoryRef>> {
    let text = fs::read_to_string(path).await?;
    let file_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(theories_in_text(&text, &file_name))
}

/// Theory name to declaring file (without extension) for a whole folder
pub async fn list_context_theories(folder: &Path) -> Result<BTreeMap<String, String>> {
    let files = list_pvs_files(folder).await?;
    let mut theories = BTreeMap::new();
    for name in &files.file_names {
        for theory in list_theories(&folder.join(name)).await? {
            theories.entry(theory.theory_name).or_insert(theory.file_name);
        }
    }
    Ok(theories)
}

/// sha256 of the text with `%` comments and all whitespace removed
pub fn shasum(text: &str) -> String {
    let uncommented = COMMENT.replace_all(text, "");
    let spaceless = WHITESPACE.replace_all(&uncommented, "");
    hex::encode(Sha256::digest(spaceless.as_bytes()))
}

pub async fn shasum_file(path: &Path) -> Result<String> {
    Ok(shasum(&fs::read_to_string(path).await?))
}

/// Remove the engine's derived files from `folder`.
///
/// Deletes `pvsbin/`, `.pvscontext`, `*.prlite`, `*.log`, `*~` and, unless
/// `keep_tccs`, `*.tccs`. With `recursive`, immediate subfolders are cleaned
/// too. Returns the number of folders cleaned.
pub async fn clean_bin(folder: &Path, keep_tccs: bool, recursive: bool) -> Result<usize> {
    let mut cleaned = clean_folder(folder, keep_tccs).await?;
    if recursive {
        let mut entries = fs::read_dir(folder).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                cleaned += clean_folder(&entry.path(), keep_tccs).await?;
            }
        }
    }
    info!(folder = %folder.display(), cleaned, "Workspace cache cleaned");
    Ok(cleaned)
}

async fn clean_folder(folder: &Path, keep_tccs: bool) -> Result<usize> {
    let cache = folder.join(CACHE_FOLDER);
    if fs::metadata(&cache).await.is_ok() {
        fs::remove_dir_all(&cache).await?;
    }
    remove_if_exists(&folder.join(CONTEXT_FILE)).await?;

    let mut entries = fs::read_dir(folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let derived = name.ends_with(".prlite") || name.ends_with(".log") || name.ends_with('~');
        let tccs = !keep_tccs && name.ends_with(TCCS_EXTENSION);
        if derived || tccs {
            debug!(file = %name, "Removing derived file");
            remove_if_exists(&entry.path()).await?;
        }
    }
    Ok(1)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Writes `<theory>.tccs` files.
///
/// Writes for the same (folder, theory) pair are serialized and every write
/// lands through a temporary file and a rename, so readers never see a
/// partial file.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    locks: DashMap<(PathBuf, String), Arc<Mutex<()>>>,
    counter: AtomicU64,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tccs_path(folder: &Path, theory_name: &str) -> PathBuf {
        folder.join(format!("{theory_name}{TCCS_EXTENSION}"))
    }

    pub async fn write_tccs(
        &self,
        folder: &Path,
        theory_name: &str,
        tccs: &[TccDescriptor],
    ) -> Result<PathBuf> {
        let mut content = format!("%% Proof obligations for theory {theory_name}\n\n");
        for tcc in tccs {
            content.push_str(&tcc.artifact_text());
        }
        let path = Self::tccs_path(folder, theory_name);
        self.write_atomic(folder, theory_name, &path, &content).await?;
        info!(path = %path.display(), count = tccs.len(), "Wrote obligations");
        Ok(path)
    }

    async fn write_atomic(
        &self,
        folder: &Path,
        theory_name: &str,
        path: &Path,
        content: &str,
    ) -> Result<()> {
        let lock = self
            .locks
            .entry((folder.to_path_buf(), theory_name.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;

        let temp = folder.join(format!(
            ".{theory_name}{TCCS_EXTENSION}.{}-{}.tmp",
            std::process::id(),
            self.counter.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&temp, content).await?;
        if let Err(e) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}
