// src/fetcher/extract.rs

//! Archive extraction for fetched upstream artifacts
//!
//! The format is detected from the file name extension. Tarballs in every
//! common compression flavour, zip files and debian packages extract into a
//! directory tree; bare `.gz`/`.bz2`/`.zst` payloads decompress into a
//! single file named after the archive stem. Extraction runs on a blocking
//! thread since it is CPU-bound.
//!
//! Symlinks inside archives are preserved. Absolute symlink targets are
//! rejected: the extracted tree is published under a different path than the
//! one it is staged in, so an absolute target can never resolve inside it.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Recognised archive and compression formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarXz,
    TarBz2,
    TarZst,
    Zip,
    Deb,
    Gz,
    Bz2,
    Zst,
}

impl ArchiveFormat {
    /// Detect the format from a file name, longest extension first
    pub fn detect(file_name: &str) -> Option<Self> {
        const TABLE: &[(&str, ArchiveFormat)] = &[
            (".tar.gz", ArchiveFormat::TarGz),
            (".tgz", ArchiveFormat::TarGz),
            (".tar.xz", ArchiveFormat::TarXz),
            (".tar.bz2", ArchiveFormat::TarBz2),
            (".tar.zst", ArchiveFormat::TarZst),
            (".tar", ArchiveFormat::Tar),
            (".zip", ArchiveFormat::Zip),
            (".deb", ArchiveFormat::Deb),
            (".gz", ArchiveFormat::Gz),
            (".bz2", ArchiveFormat::Bz2),
            (".zst", ArchiveFormat::Zst),
        ];
        TABLE
            .iter()
            .find(|(ext, _)| file_name.ends_with(ext))
            .map(|(_, format)| *format)
    }
}

/// Whether a file name looks like an archive we can extract
pub fn is_supported(file_name: &str) -> bool {
    ArchiveFormat::detect(file_name).is_some()
}

/// Extract `archive` into the existing directory `dest`
pub async fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|e| Error::ArchiveError(format!("extraction task failed: {e}")))?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<()> {
    let file_name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let format = ArchiveFormat::detect(file_name)
        .ok_or_else(|| Error::UnsupportedFormat(file_name.to_string()))?;
    let file = open(archive)?;

    match format {
        ArchiveFormat::Tar => extract_tar(file, dest),
        ArchiveFormat::TarGz => extract_tar(flate2::read::GzDecoder::new(file), dest),
        ArchiveFormat::TarXz => extract_tar(xz2::read::XzDecoder::new(file), dest),
        ArchiveFormat::TarBz2 => extract_tar(bzip2::read::BzDecoder::new(file), dest),
        ArchiveFormat::TarZst => {
            let decoder = zstd::Decoder::new(file)
                .map_err(|e| Error::ArchiveError(format!("bad zstd stream: {e}")))?;
            extract_tar(decoder, dest)
        }
        ArchiveFormat::Zip => extract_zip(archive, dest),
        ArchiveFormat::Deb => extract_deb(archive, dest),
        ArchiveFormat::Gz => {
            decompress_single(flate2::read::GzDecoder::new(file), archive, dest)
        }
        ArchiveFormat::Bz2 => {
            decompress_single(bzip2::read::BzDecoder::new(file), archive, dest)
        }
        ArchiveFormat::Zst => {
            let decoder = zstd::Decoder::new(file)
                .map_err(|e| Error::ArchiveError(format!("bad zstd stream: {e}")))?;
            decompress_single(decoder, archive, dest)
        }
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path)
        .map_err(|e| Error::ArchiveError(format!("cannot open {}: {e}", path.display())))
}

/// Unpack a tar stream, preserving symlinks and refusing absolute targets
fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| Error::ArchiveError(format!("bad tar stream: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::ArchiveError(format!("bad tar entry: {e}")))?;
        if entry.header().entry_type().is_symlink() {
            let target = entry
                .link_name()
                .map_err(|e| Error::ArchiveError(format!("bad symlink entry: {e}")))?;
            if let Some(target) = target {
                if target.is_absolute() {
                    return Err(Error::ArchiveError(format!(
                        "absolute symlink target {} escapes the extracted tree",
                        target.display()
                    )));
                }
            }
        }
        // unpack_in also refuses `..` traversal out of dest
        entry
            .unpack_in(dest)
            .map_err(|e| Error::ArchiveError(format!("failed to unpack entry: {e}")))?;
    }
    Ok(())
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::ArchiveError(format!("bad zip archive: {e}")))?;
    zip.extract(dest)
        .map_err(|e| Error::ArchiveError(format!("failed to extract zip: {e}")))
}

/// Extract the data tarball tree of a `.deb` package
fn extract_deb(archive: &Path, dest: &Path) -> Result<()> {
    let file = open(archive)?;
    let mut ar = ar::Archive::new(file);
    while let Some(entry) = ar.next_entry() {
        let entry = entry.map_err(|e| Error::ArchiveError(format!("bad ar entry: {e}")))?;
        let name = String::from_utf8_lossy(entry.header().identifier()).to_string();
        if !name.starts_with("data.tar") {
            continue;
        }
        return match name.as_str() {
            "data.tar" => extract_tar(entry, dest),
            "data.tar.gz" => extract_tar(flate2::read::GzDecoder::new(entry), dest),
            "data.tar.xz" => extract_tar(xz2::read::XzDecoder::new(entry), dest),
            "data.tar.bz2" => extract_tar(bzip2::read::BzDecoder::new(entry), dest),
            "data.tar.zst" => {
                let decoder = zstd::Decoder::new(entry)
                    .map_err(|e| Error::ArchiveError(format!("bad zstd stream: {e}")))?;
                extract_tar(decoder, dest)
            }
            other => Err(Error::UnsupportedFormat(other.to_string())),
        };
    }
    Err(Error::ArchiveError(format!(
        "no data tarball found in {}",
        archive.display()
    )))
}

/// Decompress a single-file payload to `dest/<archive stem>`
fn decompress_single<R: Read>(mut reader: R, archive: &Path, dest: &Path) -> Result<()> {
    let output_path = dest.join(stem(archive));
    let mut output = File::create(&output_path)
        .map_err(|e| Error::ArchiveError(format!("cannot create {}: {e}", output_path.display())))?;
    std::io::copy(&mut reader, &mut output)
        .map_err(|e| Error::ArchiveError(format!("failed to decompress {}: {e}", archive.display())))?;
    Ok(())
}

fn stem(archive: &Path) -> PathBuf {
    let name = archive.file_stem().and_then(|n| n.to_str()).unwrap_or("payload");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_format_detection() {
        assert_eq!(ArchiveFormat::detect("a.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect("a.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect("a.tar.xz"), Some(ArchiveFormat::TarXz));
        assert_eq!(ArchiveFormat::detect("a.tar.bz2"), Some(ArchiveFormat::TarBz2));
        assert_eq!(ArchiveFormat::detect("a.tar.zst"), Some(ArchiveFormat::TarZst));
        assert_eq!(ArchiveFormat::detect("a.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::detect("a.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect("a.deb"), Some(ArchiveFormat::Deb));
        assert_eq!(ArchiveFormat::detect("a.gz"), Some(ArchiveFormat::Gz));
        assert_eq!(ArchiveFormat::detect("a.bin"), None);
        assert!(!is_supported("binary"));
    }

    fn make_tar_gz(dir: &Path) -> PathBuf {
        let archive_path = dir.join("payload.tar.gz");
        let file = File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let content_dir = dir.join("content");
        fs::create_dir_all(content_dir.join("bin")).unwrap();
        let mut f = File::create(content_dir.join("bin/app")).unwrap();
        f.write_all(b"#!/bin/sh\necho app\n").unwrap();
        builder.append_dir_all(".", &content_dir).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        archive_path
    }

    #[tokio::test]
    async fn test_extract_tar_gz() {
        let temp = TempDir::new().unwrap();
        let archive = make_tar_gz(temp.path());
        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        extract(&archive, &dest).await.unwrap();
        let payload = fs::read_to_string(dest.join("bin/app")).unwrap();
        assert_eq!(payload, "#!/bin/sh\necho app\n");
    }

    #[test]
    fn test_absolute_symlink_rejected() {
        let temp = TempDir::new().unwrap();
        let archive_path = temp.path().join("bad.tar");
        let file = File::create(&archive_path).unwrap();
        let mut builder = tar::Builder::new(file);

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, "link", "/etc/passwd")
            .unwrap();
        builder.finish().unwrap();
        drop(builder);

        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        let err = extract_blocking(&archive_path, &dest).unwrap_err();
        assert!(matches!(err, Error::ArchiveError(_)));
    }

    #[test]
    fn test_relative_symlink_preserved() {
        let temp = TempDir::new().unwrap();
        let archive_path = temp.path().join("ok.tar");
        let file = File::create(&archive_path).unwrap();
        let mut builder = tar::Builder::new(file);

        let content = temp.path().join("content");
        fs::create_dir_all(&content).unwrap();
        fs::write(content.join("app"), b"bin").unwrap();
        builder.append_dir_all(".", &content).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, "app-link", "app").unwrap();
        builder.finish().unwrap();
        drop(builder);

        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        extract_blocking(&archive_path, &dest).unwrap();
        let link = fs::read_link(dest.join("app-link")).unwrap();
        assert_eq!(link, PathBuf::from("app"));
    }

    #[test]
    fn test_decompress_single_gz() {
        let temp = TempDir::new().unwrap();
        let archive_path = temp.path().join("notes.txt.gz");
        let file = File::create(&archive_path).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(b"hello\n").unwrap();
        encoder.finish().unwrap();

        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        extract_blocking(&archive_path, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("notes.txt")).unwrap(), "hello\n");
    }

    #[test]
    fn test_unsupported_format() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob.bin");
        fs::write(&path, b"data").unwrap();
        let err = extract_blocking(&path, temp.path()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }
}
