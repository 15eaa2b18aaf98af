// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Archive Codec
//!
//! Blocking archive plumbing shared by every storage backend: compression
//! dispatch keyed on filename suffix, the guarded tar walk, zip extraction,
//! and the tar builder used by deposits. Callers wrap these in
//! `spawn_blocking`; nothing here is async.
//!
//! ## Compression dispatch
//!
//! `.gz/.gzip/.tgz/.tar.gz` - gzip; `.bz2/.tbz/.tbz2/.bzip2` - bzip2;
//! `.zip` - zip; anything else - raw.
//!
//! ## Path-escape guard
//!
//! Every archive member path is normalized component-by-component before a
//! byte is written. A member that climbs above the output directory
//! (`../../etc/passwd`), is absolute, or carries a drive prefix aborts the
//! extraction with `BadArchive` having written nothing outside `out_dir`.
//!
//! Escape attempts and corruption are distinct failures: an escaping
//! member condemns the archive (`BadArchive`, never retried), while an
//! unreadable stream (`CorruptArchive` - truncated object, bad magic, a
//! failed entry read) may be a flaky download and stays retryable.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use experiment_runner_domain::RunnerError;

/// Compression applied around an object, per its name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Bzip2,
    Zip,
    Raw,
}

/// Suffix dispatch. Case-insensitive, longest suffix wins.
pub fn codec_for(name: &str) -> Codec {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".gz") || lower.ends_with(".gzip") || lower.ends_with(".tgz") {
        Codec::Gzip
    } else if lower.ends_with(".bz2")
        || lower.ends_with(".tbz")
        || lower.ends_with(".tbz2")
        || lower.ends_with(".bzip2")
    {
        Codec::Bzip2
    } else if lower.ends_with(".zip") {
        Codec::Zip
    } else {
        Codec::Raw
    }
}

/// True when the name may be used as a deposit destination.
pub fn is_tar_family(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".tar")
        || lower.ends_with(".tar.gz")
        || lower.ends_with(".tgz")
        || lower.ends_with(".tar.bz2")
        || lower.ends_with(".tbz")
        || lower.ends_with(".tbz2")
}

/// Normalizes a member path under `out_dir`, rejecting escapes.
fn safe_join(out_dir: &Path, member: &Path) -> Result<PathBuf, RunnerError> {
    let mut depth: usize = 0;
    let mut joined = out_dir.to_path_buf();
    for component in member.components() {
        match component {
            Component::Normal(part) => {
                joined.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(RunnerError::BadArchive(format!(
                        "member {:?} escapes the output directory",
                        member
                    )));
                }
                joined.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(RunnerError::BadArchive(format!(
                    "member {:?} is absolute",
                    member
                )));
            }
        }
    }
    Ok(joined)
}

/// Extracts the archive at `archive` (named `name` for dispatch) into
/// `out_dir`. Returns non-fatal warnings (skipped entry kinds).
pub fn unpack_archive(
    archive: &Path,
    name: &str,
    out_dir: &Path,
) -> Result<Vec<String>, RunnerError> {
    std::fs::create_dir_all(out_dir)?;
    match codec_for(name) {
        Codec::Zip => unpack_zip(archive, out_dir),
        Codec::Gzip => {
            let file = File::open(archive)?;
            unpack_tar(flate2::read::GzDecoder::new(file), out_dir)
        }
        Codec::Bzip2 => {
            let file = File::open(archive)?;
            unpack_tar(bzip2::read::BzDecoder::new(file), out_dir)
        }
        Codec::Raw => {
            let file = File::open(archive)?;
            unpack_tar(file, out_dir)
        }
    }
}

/// Walks a tar stream: directories are created, regular files written
/// through truncating opens, symlinks recreated relative to `out_dir`.
fn unpack_tar<R: Read>(reader: R, out_dir: &Path) -> Result<Vec<String>, RunnerError> {
    let mut warnings = Vec::new();
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| RunnerError::CorruptArchive(format!("not a tar stream: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| RunnerError::CorruptArchive(e.to_string()))?;
        let member = entry
            .path()
            .map_err(|e| RunnerError::CorruptArchive(e.to_string()))?
            .into_owned();
        let dest = safe_join(out_dir, &member)?;
        let kind = entry.header().entry_type();

        match kind {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&dest)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&dest)?;
                std::io::copy(&mut entry, &mut file)
                    .map_err(|e| RunnerError::CorruptArchive(format!("{:?}: {}", member, e)))?;
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| RunnerError::CorruptArchive(e.to_string()))?
                    .ok_or_else(|| {
                        RunnerError::CorruptArchive(format!("symlink {:?} has no target", member))
                    })?;
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                #[cfg(unix)]
                {
                    let _ = std::fs::remove_file(&dest);
                    std::os::unix::fs::symlink(&target, &dest)?;
                }
                #[cfg(not(unix))]
                {
                    warnings.push(format!(
                        "symlink {:?} -> {:?} skipped on this platform",
                        member, target
                    ));
                }
            }
            other => {
                warnings.push(format!("entry {:?} of kind {:?} skipped", member, other));
            }
        }
    }
    Ok(warnings)
}

/// Extracts a zip archive. Entry names are validated the same way as tar
/// members; the zip crate's `enclosed_name` mirrors the escape guard.
fn unpack_zip(path: &Path, out_dir: &Path) -> Result<Vec<String>, RunnerError> {
    let file = File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| RunnerError::CorruptArchive(e.to_string()))?;

    let warnings: Vec<String> = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| RunnerError::CorruptArchive(e.to_string()))?;
        let member = entry.enclosed_name().ok_or_else(|| {
            RunnerError::BadArchive(format!("member {:?} escapes the output directory", entry.name()))
        })?;
        let dest = safe_join(out_dir, &member)?;
        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&dest)?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| RunnerError::CorruptArchive(format!("{:?}: {}", dest, e)))?;
        }
    }
    Ok(warnings)
}

/// Copies a non-archive object into `out_dir` under its base name.
pub fn place_file(spool: &Path, name: &str, out_dir: &Path) -> Result<PathBuf, RunnerError> {
    std::fs::create_dir_all(out_dir)?;
    let base = Path::new(name)
        .file_name()
        .ok_or_else(|| RunnerError::io_error(format!("object name {:?} has no base name", name)))?;
    let dest = out_dir.join(base);
    std::fs::copy(spool, &dest)?;
    Ok(dest)
}

/// Archives `src_dir` into `writer`, compressed per the destination
/// suffix. Symlinks are stored as symlink entries, never followed.
pub fn build_archive(
    src_dir: &Path,
    dest_name: &str,
    writer: impl Write,
) -> Result<(), RunnerError> {
    if !is_tar_family(dest_name) {
        return Err(RunnerError::invalid_request(format!(
            "deposit destination {:?} is not a tar-family archive",
            dest_name
        )));
    }
    match codec_for(dest_name) {
        Codec::Gzip => {
            let encoder =
                flate2::write::GzEncoder::new(writer, flate2::Compression::default());
            let encoder = build_tar(src_dir, encoder)?;
            encoder
                .finish()
                .map_err(|e| RunnerError::io_error(format!("finalizing gzip stream: {}", e)))?;
            Ok(())
        }
        Codec::Bzip2 => {
            let encoder = bzip2::write::BzEncoder::new(writer, bzip2::Compression::default());
            let encoder = build_tar(src_dir, encoder)?;
            encoder
                .finish()
                .map_err(|e| RunnerError::io_error(format!("finalizing bzip2 stream: {}", e)))?;
            Ok(())
        }
        _ => {
            let mut writer = build_tar(src_dir, writer)?;
            writer
                .flush()
                .map_err(|e| RunnerError::io_error(format!("flushing archive: {}", e)))?;
            Ok(())
        }
    }
}

fn build_tar<W: Write>(src_dir: &Path, writer: W) -> Result<W, RunnerError> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    append_dir(&mut builder, src_dir, Path::new(""))?;
    builder
        .into_inner()
        .map_err(|e| RunnerError::io_error(format!("finalizing archive: {}", e)))
}

fn append_dir(
    builder: &mut tar::Builder<impl Write>,
    dir: &Path,
    prefix: &Path,
) -> Result<(), RunnerError> {
    let mut names: Vec<PathBuf> = std::fs::read_dir(dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    names.sort();

    for path in names {
        let file_name = match path.file_name() {
            Some(n) => n,
            None => continue,
        };
        let rel = prefix.join(file_name);
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            builder
                .append_path_with_name(&path, &rel)
                .map_err(|e| RunnerError::io_error(format!("{:?}: {}", path, e)))?;
            append_dir(builder, &path, &rel)?;
        } else {
            builder
                .append_path_with_name(&path, &rel)
                .map_err(|e| RunnerError::io_error(format!("{:?}: {}", path, e)))?;
        }
    }
    Ok(())
}
