// src/deb.rs

//! In-process `.deb` assembly
//!
//! A binary debian package is an `ar` archive holding, in order,
//! `debian-binary` (the literal bytes `2.0\n`), a control tarball and a data
//! tarball. The control tarball carries the binary `control` file and
//! `md5sums`; the data tarball carries the staged filesystem with ownership
//! `root:root`. Both tarballs are zstd-compressed by default with gzip as
//! the fallback.

use crate::error::{Error, Result};
use md5::{Digest as Md5Digest, Md5};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Compression used for the control and data tarballs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebCompression {
    #[default]
    Zstd,
    Gzip,
}

impl DebCompression {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zstd => ".zst",
            Self::Gzip => ".gz",
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Zstd => zstd::encode_all(data, 0)
                .map_err(|e| Error::BuildError(format!("zstd compression failed: {e}"))),
            Self::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| Error::BuildError(format!("gzip compression failed: {e}")))
            }
        }
    }
}

/// Assemble `<package dir>/../<name>_<version>_<arch>.deb` from a generated
/// source tree and return the path of the produced package
pub fn assemble(package_directory: &Path, compression: DebCompression) -> Result<PathBuf> {
    let control_fields = parse_control(package_directory)?;
    let version = parse_changelog_version(package_directory)?;
    let package = control_fields
        .field("Package")
        .ok_or_else(|| Error::BuildError("debian/control has no Package field".into()))?;
    let architecture = control_fields
        .field("Architecture")
        .ok_or_else(|| Error::BuildError("debian/control has no Architecture field".into()))?;

    let source_path = package_directory.join("src");
    if !source_path.is_dir() {
        return Err(Error::BuildError(format!(
            "no src directory in {}",
            package_directory.display()
        )));
    }
    fix_permissions(&source_path)?;

    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let control_content = binary_control(&control_fields, &version, &source_path)?;
    let md5sums = build_md5sums(&source_path)?;
    let control_tar = {
        let mut builder = tar::Builder::new(Vec::new());
        append_file_bytes(&mut builder, "./control", control_content.as_bytes(), mtime)?;
        append_file_bytes(&mut builder, "./md5sums", md5sums.as_bytes(), mtime)?;
        builder
            .into_inner()
            .map_err(|e| Error::BuildError(format!("failed to build control tarball: {e}")))?
    };
    let data_tar = build_data_tar(&source_path, mtime)?;

    let deb_name = format!("{package}_{version}_{architecture}.deb");
    let output_path = package_directory
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(deb_name);
    write_deb(
        &output_path,
        &control_tar,
        &data_tar,
        compression,
        mtime,
    )?;
    Ok(output_path)
}

/// Parsed fields of the binary stanza of `debian/control`
pub struct ControlFields {
    fields: Vec<(String, String)>,
}

impl ControlFields {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse `debian/control`, keeping the binary stanza fields in order.
///
/// The generated control files hold exactly one source and one binary
/// stanza; fields of the source stanza other than Maintainer are dropped.
pub fn parse_control(package_directory: &Path) -> Result<ControlFields> {
    let path = package_directory.join("debian/control");
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::BuildError(format!("cannot read {}: {e}", path.display())))?;

    let mut fields: Vec<(String, String)> = Vec::new();
    for line in raw.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            // continuation of the previous field
            if let Some((_, value)) = fields.last_mut() {
                value.push('\n');
                value.push_str(line.trim_start());
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            fields.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    fields.retain(|(k, _)| k != "Source" && k != "Build-Depends" && k != "Section" && k != "Priority");
    Ok(ControlFields { fields })
}

/// Package version from the first `debian/changelog` entry
pub fn parse_changelog_version(package_directory: &Path) -> Result<String> {
    let path = package_directory.join("debian/changelog");
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::BuildError(format!("cannot read {}: {e}", path.display())))?;
    let first = raw.lines().next().unwrap_or_default();
    let version = first
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(version, _)| version.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::BuildError("Could not read package version from changelog".to_string())
        })?;
    Ok(version.to_string())
}

/// Content of the binary `control` file inside `control.tar`
fn binary_control(fields: &ControlFields, version: &str, source_path: &Path) -> Result<String> {
    let installed_size = compute_installed_size(source_path)?;
    let package = fields.field("Package").unwrap_or_default();
    let maintainer = fields
        .field("Maintainer")
        .unwrap_or(crate::generator::MAINTAINER);

    let mut control = format!(
        "Package: {package}\nVersion: {version}\nMaintainer: {maintainer}\nInstalled-Size: {installed_size}\n"
    );
    for (key, value) in &fields.fields {
        if key == "Package" || key == "Maintainer" {
            continue;
        }
        if key == "Description" {
            let mut lines = value.lines();
            control.push_str(&format!("Description: {}\n", lines.next().unwrap_or_default()));
            for line in lines {
                if line == "." {
                    control.push_str(" .\n");
                } else {
                    control.push_str(&format!(" {line}\n"));
                }
            }
        } else {
            control.push_str(&format!("{key}: {value}\n"));
        }
    }
    Ok(control)
}

/// Total payload size in kibibytes, symlinks not followed
fn compute_installed_size(source_path: &Path) -> Result<u64> {
    let mut size = 0;
    walk(source_path, &mut |path, file_type| {
        if file_type.is_file() {
            size += fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(())
    })?;
    Ok(size / 1024)
}

/// Normalise payload permissions: directories 0755, files 0644, executables
/// under `bin`/`sbin` directories 0755
fn fix_permissions(source_path: &Path) -> Result<()> {
    walk(source_path, &mut |path, file_type| {
        if file_type.is_symlink() {
            return Ok(());
        }
        let mode = if file_type.is_dir() {
            0o755
        } else if is_binary_path(path, source_path) {
            0o755
        } else {
            0o644
        };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::IoError(format!("chmod {} failed: {e}", path.display())))
    })
}

fn is_binary_path(path: &Path, root: &Path) -> bool {
    let Some(parent) = path.parent().and_then(|p| p.strip_prefix(root).ok()) else {
        return false;
    };
    matches!(
        parent.to_string_lossy().as_ref(),
        "bin" | "sbin" | "usr/bin" | "usr/sbin" | "usr/games" | "usr/local/bin"
    )
}

/// `md5sums` member content: one line per regular file, sorted paths
fn build_md5sums(source_path: &Path) -> Result<String> {
    let mut entries = Vec::new();
    walk(source_path, &mut |path, file_type| {
        if file_type.is_file() {
            let mut file = File::open(path)
                .map_err(|e| Error::IoError(format!("cannot open {}: {e}", path.display())))?;
            let mut hasher = Md5::new();
            let mut buffer = [0u8; 8192];
            loop {
                let read = file
                    .read(&mut buffer)
                    .map_err(|e| Error::IoError(e.to_string()))?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
            let relative = path.strip_prefix(source_path).unwrap_or(path);
            entries.push(format!("{:x}  {}", hasher.finalize(), relative.display()));
        }
        Ok(())
    })?;
    entries.sort();
    let mut output = entries.join("\n");
    if !output.is_empty() {
        output.push('\n');
    }
    Ok(output)
}

/// Build the data tarball: the staged tree with uid/gid 0 and `./` paths
fn build_data_tar(source_path: &Path, mtime: u64) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let mut paths = Vec::new();
    walk(source_path, &mut |path, _| {
        paths.push(path.to_path_buf());
        Ok(())
    })?;
    paths.sort();

    for path in paths {
        let relative = path.strip_prefix(source_path).unwrap_or(&path);
        let name = PathBuf::from(".").join(relative);
        let metadata = fs::symlink_metadata(&path)
            .map_err(|e| Error::IoError(format!("stat {} failed: {e}", path.display())))?;

        let mut header = tar::Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header
            .set_username("root")
            .and_then(|_| header.set_groupname("root"))
            .map_err(|e| Error::BuildError(format!("bad tar header: {e}")))?;
        header.set_mtime(mtime);

        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder
                .append_link(&mut header, &name, &target)
                .map_err(|e| Error::BuildError(format!("failed to add symlink: {e}")))?;
        } else if metadata.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder
                .append_data(&mut header, &name, std::io::empty())
                .map_err(|e| Error::BuildError(format!("failed to add directory: {e}")))?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(metadata.permissions().mode() & 0o7777);
            header.set_size(metadata.len());
            let file = File::open(&path)
                .map_err(|e| Error::IoError(format!("cannot open {}: {e}", path.display())))?;
            builder
                .append_data(&mut header, &name, file)
                .map_err(|e| Error::BuildError(format!("failed to add file: {e}")))?;
        }
    }

    builder
        .into_inner()
        .map_err(|e| Error::BuildError(format!("failed to build data tarball: {e}")))
}

fn append_file_bytes(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    data: &[u8],
    mtime: u64,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_uid(0);
    header.set_gid(0);
    header
        .set_username("root")
        .and_then(|_| header.set_groupname("root"))
        .map_err(|e| Error::BuildError(format!("bad tar header: {e}")))?;
    header.set_mtime(mtime);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| Error::BuildError(format!("failed to add {name}: {e}")))
}

/// Write the final ar archive: debian-binary, control tarball, data tarball
fn write_deb(
    output_path: &Path,
    control_tar: &[u8],
    data_tar: &[u8],
    compression: DebCompression,
    mtime: u64,
) -> Result<()> {
    let file = File::create(output_path)
        .map_err(|e| Error::BuildError(format!("cannot create {}: {e}", output_path.display())))?;
    let mut archive = ar::Builder::new(file);

    // debian-binary must come first
    let data: &[u8] = b"2.0\n";
    let mut header = ar::Header::new(b"debian-binary".to_vec(), data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    archive
        .append(&header, data)
        .map_err(|e| Error::BuildError(format!("failed to add debian-binary: {e}")))?;

    for (name, tarball) in [("control.tar", control_tar), ("data.tar", data_tar)] {
        let compressed = compression.compress(tarball)?;
        let member = format!("{name}{}", compression.extension());
        let mut header = ar::Header::new(member.clone().into_bytes(), compressed.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_uid(0);
        header.set_gid(0);
        archive
            .append(&header, compressed.as_slice())
            .map_err(|e| Error::BuildError(format!("failed to add {member}: {e}")))?;
    }
    Ok(())
}

fn walk(
    dir: &Path,
    visit: &mut dyn FnMut(&Path, fs::FileType) -> Result<()>,
) -> Result<()> {
    for entry in fs::read_dir(dir)
        .map_err(|e| Error::IoError(format!("cannot read {}: {e}", dir.display())))?
    {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        visit(&path, file_type)?;
        if file_type.is_dir() {
            walk(&path, visit)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_source_tree(root: &Path) {
        let debian = root.join("demo_1.0.0_amd64/debian");
        let src = root.join("demo_1.0.0_amd64/src");
        fs::create_dir_all(&debian).unwrap();
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        fs::write(src.join("usr/bin/demo"), "#!/bin/sh\necho demo\n").unwrap();
        fs::write(
            debian.join("control"),
            "Source: demo\nSection: devops\nPriority: optional\n\
             Maintainer: ops2deb <ops2deb@upciti.com>\n\
             Build-Depends: debhelper-compat (= 13)\n\n\
             Package: demo\nArchitecture: amd64\nDepends: curl\n\
             Description: hi\n there\n",
        )
        .unwrap();
        fs::write(
            debian.join("changelog"),
            "demo (1.0.0-1~ops2deb) unstable; urgency=medium\n",
        )
        .unwrap();
    }

    #[test]
    fn test_parse_control() {
        let temp = TempDir::new().unwrap();
        make_source_tree(temp.path());
        let fields = parse_control(&temp.path().join("demo_1.0.0_amd64")).unwrap();
        assert_eq!(fields.field("Package"), Some("demo"));
        assert_eq!(fields.field("Architecture"), Some("amd64"));
        assert_eq!(fields.field("Depends"), Some("curl"));
        assert_eq!(fields.field("Description"), Some("hi\nthere"));
        assert_eq!(fields.field("Source"), None);
    }

    #[test]
    fn test_parse_changelog_version() {
        let temp = TempDir::new().unwrap();
        make_source_tree(temp.path());
        let version = parse_changelog_version(&temp.path().join("demo_1.0.0_amd64")).unwrap();
        assert_eq!(version, "1.0.0-1~ops2deb");
    }

    #[test]
    fn test_assemble_produces_ar_archive() {
        let temp = TempDir::new().unwrap();
        make_source_tree(temp.path());
        let deb = assemble(
            &temp.path().join("demo_1.0.0_amd64"),
            DebCompression::Zstd,
        )
        .unwrap();
        assert_eq!(deb, temp.path().join("demo_1.0.0-1~ops2deb_amd64.deb"));

        let bytes = fs::read(&deb).unwrap();
        assert!(bytes.starts_with(b"!<arch>\n"), "not an ar archive");

        let mut archive = ar::Archive::new(File::open(&deb).unwrap());
        let mut names = Vec::new();
        while let Some(entry) = archive.next_entry() {
            let entry = entry.unwrap();
            names.push(String::from_utf8_lossy(entry.header().identifier()).to_string());
        }
        assert_eq!(names, vec!["debian-binary", "control.tar.zst", "data.tar.zst"]);
    }

    #[test]
    fn test_debian_binary_member_content() {
        let temp = TempDir::new().unwrap();
        make_source_tree(temp.path());
        let deb = assemble(
            &temp.path().join("demo_1.0.0_amd64"),
            DebCompression::Gzip,
        )
        .unwrap();
        let mut archive = ar::Archive::new(File::open(&deb).unwrap());
        let mut entry = archive.next_entry().unwrap().unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "2.0\n");
    }

    #[test]
    fn test_control_member_fields() {
        let temp = TempDir::new().unwrap();
        make_source_tree(temp.path());
        let deb = assemble(
            &temp.path().join("demo_1.0.0_amd64"),
            DebCompression::Gzip,
        )
        .unwrap();

        let mut archive = ar::Archive::new(File::open(&deb).unwrap());
        archive.next_entry().unwrap().unwrap(); // debian-binary
        let control_member = archive.next_entry().unwrap().unwrap();
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(control_member));
        let mut control = String::new();
        let mut md5sums = String::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            if path.ends_with("control") {
                entry.read_to_string(&mut control).unwrap();
            } else if path.ends_with("md5sums") {
                entry.read_to_string(&mut md5sums).unwrap();
            }
        }
        assert!(control.contains("Package: demo"));
        assert!(control.contains("Version: 1.0.0-1~ops2deb"));
        assert!(control.contains("Architecture: amd64"));
        assert!(control.contains("Depends: curl"));
        assert!(control.contains("Installed-Size: "));
        assert!(md5sums.contains("usr/bin/demo"));
    }

    #[test]
    fn test_data_member_is_root_owned(){
        let temp = TempDir::new().unwrap();
        make_source_tree(temp.path());
        let deb = assemble(
            &temp.path().join("demo_1.0.0_amd64"),
            DebCompression::Gzip,
        )
        .unwrap();

        let mut archive = ar::Archive::new(File::open(&deb).unwrap());
        archive.next_entry().unwrap().unwrap();
        archive.next_entry().unwrap().unwrap();
        let data_member = archive.next_entry().unwrap().unwrap();
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(data_member));
        let mut saw_binary = false;
        for entry in tar.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            let path = entry.path().unwrap().display().to_string();
            if path == "./usr/bin/demo" {
                saw_binary = true;
                // binaries under usr/bin get the executable bit
                assert_eq!(header.mode().unwrap() & 0o777, 0o755);
            }
        }
        assert!(saw_binary, "data.tar misses ./usr/bin/demo");
    }
}
