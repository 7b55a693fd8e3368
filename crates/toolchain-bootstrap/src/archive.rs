use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ArchiveFormat {
    #[serde(rename = "tar")]
    Tar,
    #[serde(rename = "tar.gz", alias = "tgz")]
    TarGz,
    #[default]
    #[serde(rename = "tar.xz", alias = "txz")]
    TarXz,
}

impl ArchiveFormat {
    pub fn from_filename(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            Some(Self::TarXz)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        path.file_name()
            .and_then(|s| s.to_str())
            .and_then(Self::from_filename)
            .ok_or_else(|| Error::extract(path, "unsupported archive format"))
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Tar => ".tar",
            Self::TarGz => ".tar.gz",
            Self::TarXz => ".tar.xz",
        }
    }

    pub fn decoder<'a, R: Read + 'a>(self, r: R) -> Box<dyn Read + 'a> {
        match self {
            Self::Tar => Box::new(r),
            Self::TarGz => Box::new(GzDecoder::new(r)),
            Self::TarXz => Box::new(XzDecoder::new(r)),
        }
    }

    pub fn encoder<W: Write>(self, w: W) -> Encoder<W> {
        match self {
            Self::Tar => Encoder::Plain(w),
            // GzEncoder writes a zero mtime in its header, keeping output reproducible.
            Self::TarGz => Encoder::Gz(GzEncoder::new(w, Compression::default())),
            Self::TarXz => Encoder::Xz(XzEncoder::new(w, 6)),
        }
    }
}

pub enum Encoder<W: Write> {
    Plain(W),
    Gz(GzEncoder<W>),
    Xz(XzEncoder<W>),
}

impl<W: Write> Encoder<W> {
    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Encoder::Gz(e) => e.finish(),
            Encoder::Xz(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Gz(e) => e.write(buf),
            Encoder::Xz(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(w) => w.flush(),
            Encoder::Gz(e) => e.flush(),
            Encoder::Xz(e) => e.flush(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File { executable: bool },
    Symlink(PathBuf),
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Path relative to the collected root.
    pub rel: PathBuf,
    pub source: PathBuf,
    pub kind: EntryKind,
}

/// Walks `root` in sorted order, skipping the root itself and anything under `exclude`.
pub fn collect_tree(root: &Path, exclude: &[PathBuf]) -> Result<Vec<TreeEntry>> {
    let mut out = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(root).unwrap_or(e.path());
            !exclude.iter().any(|ex| rel.starts_with(ex))
        });
    for entry in walker {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        out.push(tree_entry(entry.path(), rel)?);
    }
    Ok(out)
}

/// Collects an explicit list of paths (files or whole subtrees) relative to `root`.
pub fn collect_listed(root: &Path, listed: &[PathBuf]) -> Result<Vec<TreeEntry>> {
    let mut out = Vec::new();
    for rel in listed {
        let src = root.join(rel);
        let meta = fs::symlink_metadata(&src)
            .map_err(|e| Error::msg(format!("failed to stat {}: {e}", src.display())))?;
        out.push(tree_entry(&src, rel)?);
        if meta.is_dir() {
            for child in collect_tree(&src, &[])? {
                out.push(TreeEntry {
                    rel: rel.join(&child.rel),
                    ..child
                });
            }
        }
    }
    out.sort_by(|a, b| a.rel.cmp(&b.rel));
    out.dedup_by(|a, b| a.rel == b.rel);
    Ok(out)
}

fn tree_entry(path: &Path, rel: &Path) -> Result<TreeEntry> {
    let meta = fs::symlink_metadata(path)
        .map_err(|e| Error::msg(format!("failed to stat {}: {e}", path.display())))?;
    let ft = meta.file_type();
    let kind = if ft.is_symlink() {
        let target = fs::read_link(path)
            .map_err(|e| Error::msg(format!("failed to read symlink {}: {e}", path.display())))?;
        EntryKind::Symlink(target)
    } else if ft.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::File {
            executable: is_executable(&meta),
        }
    };
    Ok(TreeEntry {
        rel: rel.to_path_buf(),
        source: path.to_path_buf(),
        kind,
    })
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// Header normalization applied to every entry of a reproducible archive.
#[derive(Debug, Clone, Default)]
pub struct TarOptions {
    pub mtime: u64,
    /// Prepended to every entry path inside the archive.
    pub path_prefix: Option<PathBuf>,
}

/// Writes `entries` in the given order with zeroed ownership, normalized modes and a pinned
/// mtime, so equal trees produce byte-identical archives.
pub fn write_tar<W: Write>(entries: &[TreeEntry], out: W, opts: &TarOptions) -> Result<W> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);

    for entry in entries {
        let name = match &opts.path_prefix {
            Some(p) => p.join(&entry.rel),
            None => entry.rel.clone(),
        };
        let mut header = tar::Header::new_gnu();
        header.set_mtime(opts.mtime);
        header.set_uid(0);
        header.set_gid(0);
        let res = match &entry.kind {
            EntryKind::Dir => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, &name, io::empty())
            }
            EntryKind::File { executable } => {
                let file = File::open(&entry.source).map_err(|e| {
                    Error::msg(format!("failed to open {}: {e}", entry.source.display()))
                })?;
                let len = file
                    .metadata()
                    .map_err(|e| {
                        Error::msg(format!("failed to stat {}: {e}", entry.source.display()))
                    })?
                    .len();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(if *executable { 0o755 } else { 0o644 });
                header.set_size(len);
                builder.append_data(&mut header, &name, BufReader::new(file))
            }
            EntryKind::Symlink(target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder.append_link(&mut header, &name, target)
            }
        };
        res.map_err(|e| Error::msg(format!("failed to append {}: {e}", name.display())))?;
    }

    builder
        .into_inner()
        .map_err(|e| Error::msg(format!("failed to finish tar stream: {e}")))
}

/// Unpacks `archive` into the existing directory `dest`.
pub fn extract_into(archive: &Path, dest: &Path) -> Result<()> {
    let format = ArchiveFormat::from_path(archive)?;
    let file = File::open(archive).map_err(|e| Error::extract(archive, e.to_string()))?;
    let mut tar = tar::Archive::new(format.decoder(BufReader::new(file)));
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(dest)
        .map_err(|e| Error::extract(archive, e.to_string()))
}
