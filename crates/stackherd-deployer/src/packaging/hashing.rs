//! Content hashing and deterministic archives
//!
//! Everything here is blocking file IO. Callers run it on the blocking pool.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Length of the hash suffix in image tags
const IMAGE_TAG_HASH_LEN: usize = 12;

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("read {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether a file is already an archive that can be uploaded as-is
pub fn is_archive(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("zip" | "jar")
    )
}

fn file_options(path: &Path) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(if is_executable(path) { 0o755 } else { 0o644 })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

/// Regular files below `dir`, sorted, with their `/`-separated names.
fn sorted_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .min_depth(1)
    {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir)?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((name, entry.into_path()));
    }
    Ok(files)
}

/// Zip a directory or single file into `dest`.
///
/// Entries are sorted, timestamps fixed at 1980-01-01 and permissions
/// normalised, so identical content always yields identical bytes.
pub fn write_zip(source: &Path, dest: &Path) -> Result<()> {
    let entries = if source.is_dir() {
        sorted_files(source)?
    } else {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        vec![(name, source.to_path_buf())]
    };

    let out = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut zip = zip::ZipWriter::new(out);
    for (name, path) in entries {
        zip.start_file(name, file_options(&path))?;
        let mut file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        io::copy(&mut file, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

/// Content hash of a container build context.
///
/// Covers the dockerfile name, every file's relative path and content, and
/// the `package.json` name and version when one exists at the root.
pub fn image_context_hash(context: &Path, dockerfile: &str) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(dockerfile.as_bytes());
    hasher.update([0]);
    for (name, path) in sorted_files(context)? {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        let mut content = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut content))
            .with_context(|| format!("read {}", path.display()))?;
        hasher.update(&content);
        hasher.update([0]);
    }
    if let Some(package) = package_identity(context) {
        hasher.update(package.as_bytes());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn package_identity(context: &Path) -> Option<String> {
    let body = std::fs::read_to_string(context.join("package.json")).ok()?;
    let json: serde_json::Value = serde_json::from_str(&body).ok()?;
    Some(format!(
        "{}@{}",
        json.get("name")?.as_str()?,
        json.get("version").and_then(|v| v.as_str()).unwrap_or("")
    ))
}

/// Deterministic image tag: `<dir-name>-<hash12>`
pub fn image_tag(context: &Path, hash: &str) -> String {
    let name: String = context
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let name = if name.is_empty() { "image" } else { &name };
    format!("{}-{}", name, &hash[..hash.len().min(IMAGE_TAG_HASH_LEN)])
}
