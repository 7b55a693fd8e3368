use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::archive::{self, ArchiveFormat, TarOptions};
use crate::config::PublishConfig;
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::interrupt::{self, ScratchGuard};
use crate::session::SESSION_MARKER;
use crate::store::{self, ContentStore};
use crate::verify;

#[derive(Debug, Clone)]
pub struct Published {
    pub archive: PathBuf,
    pub signature: PathBuf,
    pub digest: String,
    /// Stable name linked to `archive`, when enabled.
    pub pointer: Option<PathBuf>,
}

/// What goes into one published archive.
#[derive(Debug, Clone)]
pub struct ArchiveSpec {
    pub root: PathBuf,
    pub exclude: Vec<PathBuf>,
    /// Explicit relative paths; empty means the whole tree.
    pub files: Vec<PathBuf>,
    pub path_prefix: Option<PathBuf>,
    pub format: ArchiveFormat,
    pub mtime: u64,
}

/// `SOURCE_DATE_EPOCH` when set, else 0, so identical trees give identical archives.
pub fn source_date_epoch() -> u64 {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

pub fn render_name(template: &str, ctx: &BuildContext) -> Result<String> {
    let name = template
        .replace("{name}", &ctx.name)
        .replace("{target}", &ctx.target);
    let name = name.trim().to_string();
    if name.is_empty() || name.starts_with('.') || name.contains('/') || name.contains('{') {
        return Err(Error::config(format!(
            "invalid publish name '{name}' from template '{template}'"
        )));
    }
    Ok(name)
}

/// Writes a deterministic archive of `spec` into the store under `artifact` and signs it.
pub fn archive_into_store(
    store: &ContentStore,
    artifact: &str,
    spec: &ArchiveSpec,
) -> Result<(PathBuf, String)> {
    if !spec.root.is_dir() {
        return Err(Error::publish(format!(
            "{} is not a directory",
            spec.root.display()
        )));
    }
    if store.has(artifact) {
        return Err(Error::publish(format!(
            "{artifact} already exists in {}; published archives are never replaced",
            store.dir().display()
        )));
    }
    let entries = if spec.files.is_empty() {
        archive::collect_tree(&spec.root, &spec.exclude)?
    } else {
        archive::collect_listed(&spec.root, &spec.files)?
            .into_iter()
            .filter(|e| !spec.exclude.iter().any(|ex| e.rel.starts_with(ex)))
            .collect()
    };
    let opts = TarOptions {
        mtime: spec.mtime,
        path_prefix: spec.path_prefix.clone(),
    };
    let path = store.put_with(artifact, |file: &mut File| {
        let enc = archive::write_tar(&entries, spec.format.encoder(file), &opts)?;
        enc.finish()
            .map_err(|e| Error::msg(format!("failed to finish {artifact}: {e}")))?;
        Ok(())
    })?;
    let digest = verify::sha256_file_hex(&path)?;
    store::write_signature(&path, &digest)?;
    Ok((path, digest))
}

/// Archives the Staging Tree as `<name>-<UTC timestamp><ext>` and points `<name><ext>` at it.
pub fn publish(
    ctx: &BuildContext,
    store: &ContentStore,
    cfg: &PublishConfig,
    mtime: u64,
) -> Result<Published> {
    let base = render_name(&cfg.name, ctx)?;
    let ext = cfg.format.extension();
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let artifact = free_name(store, &format!("{base}-{stamp}"), ext);

    let mut exclude: Vec<PathBuf> = cfg.exclude.iter().map(PathBuf::from).collect();
    exclude.push(PathBuf::from(SESSION_MARKER));
    let spec = ArchiveSpec {
        root: ctx.prefix().to_path_buf(),
        exclude,
        files: cfg.files.iter().map(PathBuf::from).collect(),
        path_prefix: cfg.path_prefix.as_deref().map(PathBuf::from),
        format: cfg.format,
        mtime,
    };
    let (path, digest) = archive_into_store(store, &artifact, &spec)
        .map_err(|e| {
            if matches!(e, Error::ArchivePublish(_)) {
                e
            } else {
                Error::publish(e.to_string())
            }
        })?;
    let signature = store::signature_path(&path);

    let pointer = if cfg.release_pointer {
        let pointer = store.dir().join(format!("{base}{ext}"));
        link_atomic(Path::new(&artifact), &pointer)?;
        let sig_name = signature
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| Error::publish("signature has no file name"))?;
        link_atomic(&sig_name, &store::signature_path(&pointer))?;
        Some(pointer)
    } else {
        None
    };

    info!(archive = %path.display(), %digest, "published");
    Ok(Published {
        archive: path,
        signature,
        digest,
        pointer,
    })
}

// Publishes within the same second get `-1`, `-2`, ... appended to the stamp.
fn free_name(store: &ContentStore, stem: &str, ext: &str) -> String {
    let mut name = format!("{stem}{ext}");
    let mut n = 0u32;
    while store.has(&name) {
        n += 1;
        name = format!("{stem}-{n}{ext}");
    }
    name
}

/// Points `link` at `target` (relative), replacing any previous link in one rename.
#[cfg(unix)]
fn link_atomic(target: &Path, link: &Path) -> Result<()> {
    let tmp = ScratchGuard::sibling_file(link, "link")?;
    std::os::unix::fs::symlink(target, tmp.path()).map_err(|e| {
        Error::publish(format!("failed to create symlink {}: {e}", tmp.path().display()))
    })?;
    interrupt::commit_rename(tmp.path(), link).map_err(|e| Error::publish(e.to_string()))?;
    tmp.disarm();
    Ok(())
}

#[cfg(not(unix))]
fn link_atomic(target: &Path, link: &Path) -> Result<()> {
    let src = link.with_file_name(target);
    let tmp = ScratchGuard::sibling_file(link, "link")?;
    std::fs::copy(&src, tmp.path())
        .map_err(|e| Error::publish(format!("failed to copy {}: {e}", src.display())))?;
    interrupt::commit_rename(tmp.path(), link).map_err(|e| Error::publish(e.to_string()))?;
    tmp.disarm();
    Ok(())
}
