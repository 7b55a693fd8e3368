use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::archive::{self, ArchiveFormat};
use crate::error::{Error, Result};
use crate::interrupt::ScratchGuard;
use crate::store;

/// What the digest of an artifact is computed over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestPolicy {
    /// The artifact's bytes as stored.
    #[default]
    Raw,
    /// Sorted relative paths and contents of every regular file after extraction.
    FullExtract,
    /// The decompressed byte stream, without looking at tar structure.
    #[serde(alias = "decompressed_stream")]
    XzStream,
}

impl DigestPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DigestPolicy::Raw => "raw",
            DigestPolicy::FullExtract => "full_extract",
            DigestPolicy::XzStream => "xz_stream",
        }
    }
}

impl std::str::FromStr for DigestPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "raw" => Ok(Self::Raw),
            "full_extract" | "full-extract" => Ok(Self::FullExtract),
            "xz_stream" | "xz-stream" | "decompressed_stream" => Ok(Self::XzStream),
            other => Err(Error::config(format!(
                "unknown digest policy '{other}' (expected raw, full_extract or xz_stream)"
            ))),
        }
    }
}

fn hash_reader(mut r: impl Read, what: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = r
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", what.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let file = File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    hash_reader(file, path)
}

/// Canonical digest of a directory: for each regular file in sorted path order,
/// `path \0 length \0 contents`. Directories, symlinks and metadata do not contribute.
pub fn tree_digest(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        let mut file = File::open(entry.path())
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", entry.path().display())))?;
        let len = file
            .metadata()
            .map_err(|e| Error::msg(format!("failed to stat {}: {e}", entry.path().display())))?
            .len();
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(len.to_string().as_bytes());
        hasher.update(b"\0");
        loop {
            let n = file.read(&mut buf).map_err(|e| {
                Error::msg(format!("failed to read {}: {e}", entry.path().display()))
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes the digest of `path` under `policy`.
pub fn digest(path: &Path, policy: DigestPolicy) -> Result<String> {
    match policy {
        DigestPolicy::Raw => sha256_file_hex(path),
        DigestPolicy::XzStream => {
            let format = ArchiveFormat::from_path(path)?;
            let file = File::open(path).map_err(|e| Error::extract(path, e.to_string()))?;
            hash_reader(format.decoder(BufReader::new(file)), path)
        }
        DigestPolicy::FullExtract => {
            let scratch = ScratchGuard::sibling_dir(path, "verify")?;
            archive::extract_into(path, scratch.path())?;
            tree_digest(scratch.path())
        }
    }
}

/// Checks `path` against `expected`, or against its stored signature when no digest is given.
pub fn verify(path: &Path, expected: Option<&str>, policy: DigestPolicy) -> Result<()> {
    let expected = match expected {
        Some(d) => normalize_digest(d)?,
        None => store::read_signature(path)?.ok_or_else(|| Error::MissingSignature {
            path: store::signature_path(path),
        })?,
    };
    let actual = digest(path, policy)?;
    debug!(path = %path.display(), policy = policy.as_str(), %actual, "computed digest");
    if actual != expected {
        return Err(Error::IntegrityMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

pub fn normalize_digest(raw: &str) -> Result<String> {
    let d = raw.trim().to_ascii_lowercase();
    if d.len() != 64 || !d.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::config(format!(
            "invalid sha256 digest '{raw}' (expected 64 hex chars)"
        )));
    }
    Ok(d)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::archive::{TarOptions, collect_tree, write_tar};

    fn pack(src: &Path, out: &Path, format: ArchiveFormat, mtime: u64) {
        let entries = collect_tree(src, &[]).expect("collect");
        let file = File::create(out).expect("create");
        let enc = write_tar(
            &entries,
            format.encoder(file),
            &TarOptions {
                mtime,
                path_prefix: Some(PathBuf::from("foo-1.0")),
            },
        )
        .expect("tar");
        enc.finish().expect("finish");
    }

    #[test]
    fn raw_policy_detects_a_single_flipped_byte() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("foo-1.0.tar.gz");
        fs::write(&path, b"not really gzip but bytes are bytes").expect("write");
        let d1 = sha256_file_hex(&path).expect("digest");

        verify(&path, Some(&d1), DigestPolicy::Raw).expect("verify ok");

        let mut bytes = fs::read(&path).expect("read");
        bytes[3] ^= 0x01;
        fs::write(&path, bytes).expect("corrupt");
        match verify(&path, Some(&d1), DigestPolicy::Raw) {
            Err(Error::IntegrityMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, d1);
                assert_ne!(actual, d1);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn full_extract_ignores_archive_metadata() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("lib")).expect("dirs");
        fs::write(src.join("lib/a.c"), "int a;\n").expect("a");
        fs::write(src.join("README"), "hello\n").expect("readme");

        let a = tmp.path().join("a.tar.xz");
        let b = tmp.path().join("b.tar.gz");
        pack(&src, &a, ArchiveFormat::TarXz, 1);
        pack(&src, &b, ArchiveFormat::TarGz, 1_700_000_000);

        assert_ne!(
            sha256_file_hex(&a).expect("a"),
            sha256_file_hex(&b).expect("b")
        );
        let da = digest(&a, DigestPolicy::FullExtract).expect("a");
        let db = digest(&b, DigestPolicy::FullExtract).expect("b");
        assert_eq!(da, db);

        // No scratch directories survive next to the artifacts.
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_signature_without_expected_digest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("bar-2.0.tar");
        fs::write(&path, b"payload").expect("write");
        assert!(matches!(
            verify(&path, None, DigestPolicy::Raw),
            Err(Error::MissingSignature { .. })
        ));

        let d = sha256_file_hex(&path).expect("digest");
        store::write_signature(&path, &d).expect("sig");
        verify(&path, None, DigestPolicy::Raw).expect("verify via signature");
    }

    #[test]
    fn xz_stream_hashes_decompressed_bytes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).expect("src");
        fs::write(src.join("x"), "x\n").expect("x");
        let plain = tmp.path().join("p.tar");
        let xz = tmp.path().join("p.tar.xz");
        pack(&src, &plain, ArchiveFormat::Tar, 5);
        pack(&src, &xz, ArchiveFormat::TarXz, 5);

        assert_eq!(
            digest(&xz, DigestPolicy::XzStream).expect("xz"),
            sha256_file_hex(&plain).expect("plain")
        );
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!(
            "full_extract".parse::<DigestPolicy>().expect("parse"),
            DigestPolicy::FullExtract
        );
        assert!("md5".parse::<DigestPolicy>().is_err());
        assert!(normalize_digest("abc").is_err());
    }
}
