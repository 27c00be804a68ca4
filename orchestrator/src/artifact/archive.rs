//! Directory <-> zip archive conversion.
//!
//! Archives list members relative to the artifact directory in sorted path order, every regular
//! file deflated. Symlinks are stored as symlink members and recreated on extraction.

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::artifact::error::ArtifactError;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

fn is_symlink_mode(mode: Option<u32>) -> bool {
    mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK)
}

/// True when `dir` exists and holds at least one entry
pub fn has_entries(dir: &Path) -> io::Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Archive the content of `dir` (not `dir` itself).
pub fn zip_directory(dir: &Path) -> Result<Vec<u8>, ArtifactError> {
    if !dir.is_dir() {
        return Err(ArtifactError::MissingDirectory(dir.to_path_buf()));
    }

    let mut members = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| ArtifactError::UnsafePath(entry.path().display().to_string()))?;
        let name = relative.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
        members.push((name, entry));
    }
    if members.is_empty() {
        return Err(ArtifactError::EmptyArtifact(dir.to_path_buf()));
    }
    members.sort_by(|a, b| a.0.cmp(&b.0));

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, entry) in members {
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            writer.add_symlink(name, target.to_string_lossy(), base)?;
        } else if file_type.is_dir() {
            writer.add_directory(format!("{name}/"), with_mode(base, &entry)?)?;
        } else {
            let metadata = entry.metadata()?;
            let options = with_mode(base, &entry)?.large_file(metadata.len() >= u64::from(u32::MAX));
            writer.start_file(name, options)?;
            io::copy(&mut File::open(entry.path())?, &mut writer)?;
        }
    }

    Ok(writer.finish()?.into_inner())
}

#[cfg(unix)]
fn with_mode(options: SimpleFileOptions, entry: &walkdir::DirEntry) -> Result<SimpleFileOptions, ArtifactError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = entry.metadata()?.permissions().mode();
    Ok(options.unix_permissions(mode & 0o7777))
}

#[cfg(not(unix))]
fn with_mode(options: SimpleFileOptions, _entry: &walkdir::DirEntry) -> Result<SimpleFileOptions, ArtifactError> {
    Ok(options)
}

/// Unpack `archive` into `dest`. Returns the number of members written.
pub fn unzip_archive(archive: &[u8], dest: &Path) -> Result<usize, ArtifactError> {
    let mut archive = ZipArchive::new(Cursor::new(archive))?;
    fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut member = archive.by_index(i)?;
        let relative = member.enclosed_name().ok_or_else(|| ArtifactError::UnsafePath(member.name().to_string()))?;
        let target = dest.join(&relative);
        refuse_symlink_ancestors(dest, &relative)?;

        if member.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if is_symlink_mode(member.unix_mode()) {
            let mut link_target = String::new();
            member.read_to_string(&mut link_target)?;
            if !link_stays_inside(&relative, Path::new(&link_target)) {
                return Err(ArtifactError::UnsafePath(format!("{} -> {link_target}", member.name())));
            }
            create_symlink(&link_target, &target)?;
            continue;
        }

        let mut file = File::create(&target)?;
        io::copy(&mut member, &mut file)?;
        file.flush()?;
        set_mode(&target, member.unix_mode())?;
    }

    Ok(archive.len())
}

/// A link at `link` (relative to the extraction root) whose target resolves inside the root.
/// Absolute targets are refused.
fn link_stays_inside(link: &Path, link_target: &Path) -> bool {
    let mut depth = link.components().count().saturating_sub(1);
    for component in link_target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(parent) => depth = parent,
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Members are never written through a symlink extracted earlier.
fn refuse_symlink_ancestors(dest: &Path, relative: &Path) -> Result<(), ArtifactError> {
    let mut current = dest.to_path_buf();
    let Some(parent) = relative.parent() else {
        return Ok(());
    };
    for component in parent.components() {
        current.push(component);
        if fs::symlink_metadata(&current).is_ok_and(|metadata| metadata.file_type().is_symlink()) {
            return Err(ArtifactError::UnsafePath(relative.display().to_string()));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link_target: &str, path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path)?;
    }
    std::os::unix::fs::symlink(link_target, path)
}

#[cfg(not(unix))]
fn create_symlink(link_target: &str, path: &Path) -> io::Result<()> {
    fs::write(path, link_target)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}
