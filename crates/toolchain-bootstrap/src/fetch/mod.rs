//! Fetcher: brings a stage's source artifact into the Content Store.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveFormat, TarOptions};
use crate::config::SourceConfig;
use crate::error::{Error, Result};
use crate::interrupt::ScratchGuard;
use crate::store::{self, ContentStore};
use crate::verify::{self, DigestPolicy};

pub mod git;
pub mod http;
pub mod retry;

pub use git::{GitCli, SourceControl};
pub use http::{HttpTransport, Transport};
pub use retry::{RetryPolicy, Sleeper, ThreadSleeper, TransferError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievalMode {
    Download { url: String },
    Snapshot { repo: String, revision: String },
}

impl RetrievalMode {
    pub fn origin(&self) -> String {
        match self {
            RetrievalMode::Download { url } => url.clone(),
            RetrievalMode::Snapshot { repo, revision } => format!("{repo}@{revision}"),
        }
    }

    fn default_policy(&self) -> DigestPolicy {
        match self {
            RetrievalMode::Download { .. } => DigestPolicy::Raw,
            RetrievalMode::Snapshot { .. } => DigestPolicy::FullExtract,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub package: String,
    pub version: String,
    /// Content Store key.
    pub filename: String,
    pub mode: RetrievalMode,
    pub expected: Option<String>,
    pub policy: DigestPolicy,
    /// A copy left behind by an earlier partial run, adopted if it verifies.
    pub leftover: Option<PathBuf>,
}

impl FetchRequest {
    pub fn from_source(package: &str, version: &str, src: &SourceConfig) -> Result<Self> {
        let what = format!("{package}-{version}");
        let mode = match (&src.url, &src.git) {
            (Some(url), None) => RetrievalMode::Download {
                url: url.trim().to_string(),
            },
            (None, Some(repo)) => {
                let revision = src
                    .rev
                    .as_deref()
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| {
                        Error::config(format!("source for {what}: 'git' requires 'rev'"))
                    })?;
                RetrievalMode::Snapshot {
                    repo: repo.trim().to_string(),
                    revision: revision.to_string(),
                }
            }
            (Some(_), Some(_)) => {
                return Err(Error::config(format!(
                    "source for {what}: set either 'url' or 'git', not both"
                )));
            }
            (None, None) => {
                return Err(Error::config(format!(
                    "source for {what}: one of 'url' or 'git' is required"
                )));
            }
        };

        let filename = match src.filename.as_deref().map(str::trim) {
            Some(f) if !f.is_empty() => f.to_string(),
            _ => match &mode {
                RetrievalMode::Download { url } => url_to_filename(url),
                RetrievalMode::Snapshot { revision, .. } => {
                    snapshot_filename(package, version, revision)
                }
            },
        };
        let expected = src
            .sha256
            .as_deref()
            .map(verify::normalize_digest)
            .transpose()?;
        let policy = src.policy.unwrap_or_else(|| mode.default_policy());

        Ok(Self {
            package: package.to_string(),
            version: version.to_string(),
            filename,
            mode,
            expected,
            policy,
            leftover: None,
        })
    }

    pub fn label(&self) -> String {
        format!("{}-{}", self.package, self.version)
    }
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub path: PathBuf,
    /// No network or clone work was needed.
    pub from_cache: bool,
}

pub struct Fetcher {
    store: ContentStore,
    retry: RetryPolicy,
    transport: Box<dyn Transport>,
    sleeper: Box<dyn Sleeper>,
    vcs: Box<dyn SourceControl>,
}

impl Fetcher {
    pub fn new(
        store: ContentStore,
        retry: RetryPolicy,
        transport: Box<dyn Transport>,
        sleeper: Box<dyn Sleeper>,
        vcs: Box<dyn SourceControl>,
    ) -> Self {
        Self {
            store,
            retry,
            transport,
            sleeper,
            vcs,
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn fetch(&self, req: &FetchRequest) -> Result<Fetched> {
        if let Ok(path) = self.store.get(&req.filename) {
            debug!(artifact = %req.filename, "content store hit");
            // A run stopped between the store rename and signing leaves an unsigned artifact.
            if store::read_signature(&path)?.is_none() {
                warn!(artifact = %req.filename, "cached artifact is unsigned; signing it now");
                self.sign(&path, req)?;
            }
            return Ok(Fetched {
                path,
                from_cache: true,
            });
        }
        if let Some(leftover) = req.leftover.as_deref()
            && let Some(path) = self.store.adopt(
                &req.filename,
                leftover,
                req.expected.as_deref(),
                req.policy,
            )?
        {
            self.sign(&path, req)?;
            return Ok(Fetched {
                path,
                from_cache: true,
            });
        }

        info!(artifact = %req.filename, origin = %req.mode.origin(), "fetching");
        let path = match &req.mode {
            RetrievalMode::Download { url } => self.download(req, url)?,
            RetrievalMode::Snapshot { repo, revision } => self.snapshot(req, repo, revision)?,
        };
        self.sign(&path, req)?;
        Ok(Fetched {
            path,
            from_cache: false,
        })
    }

    fn sign(&self, path: &std::path::Path, req: &FetchRequest) -> Result<()> {
        if store::read_signature(path)?.is_some() {
            return Ok(());
        }
        let digest = verify::digest(path, req.policy)?;
        store::write_signature(path, &digest)?;
        Ok(())
    }

    fn download(&self, req: &FetchRequest, url: &str) -> Result<PathBuf> {
        let what = req.label();
        self.store.put_with(&req.filename, |file| {
            let bytes = self.retry.run(&what, self.sleeper.as_ref(), |attempt| {
                if attempt > 1 {
                    file.set_len(0)
                        .and_then(|_| file.seek(SeekFrom::Start(0)))
                        .map_err(|e| TransferError::fatal(format!("failed to reset temp file: {e}")))?;
                }
                self.transport.get(url, &mut *file)
            })?;
            info!(artifact = %req.filename, bytes, "download complete");
            Ok(())
        })
    }

    fn snapshot(&self, req: &FetchRequest, repo: &str, revision: &str) -> Result<PathBuf> {
        let dest = self.store.path_of(&req.filename)?;
        let format = ArchiveFormat::from_path(&dest)?;
        let work = ScratchGuard::sibling_dir(&dest, "clone")?;
        let tree = work.path().join("src");
        let what = req.label();

        let commit_time = self.retry.run(&what, self.sleeper.as_ref(), |_| {
            if tree.exists() {
                fs::remove_dir_all(&tree).map_err(|e| {
                    TransferError::fatal(format!("failed to reset {}: {e}", tree.display()))
                })?;
            }
            self.vcs
                .checkout(repo, revision, &tree)
                .map_err(|e| TransferError::retryable(e.to_string()))
        })?;
        git::strip_vcs_metadata(&tree)?;

        let entries = archive::collect_tree(&tree, &[])?;
        let opts = TarOptions {
            mtime: commit_time.max(0) as u64,
            path_prefix: Some(PathBuf::from(&what)),
        };
        let path = self.store.put_with(&req.filename, |file: &mut File| {
            let enc = archive::write_tar(&entries, format.encoder(file), &opts)?;
            enc.finish()
                .map_err(|e| Error::msg(format!("failed to finish {}: {e}", req.filename)))?;
            Ok(())
        })?;
        info!(artifact = %req.filename, revision, "snapshot archived");
        Ok(path)
    }
}

/// Last path segment of `url` without query or fragment; falls back to a hash of the URL.
pub fn url_to_filename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if let Some(last) = path.rsplit('/').next() {
        let sanitized: String = last
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '+' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if !sanitized.is_empty() && !sanitized.starts_with('.') {
            return sanitized;
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("download_{}", &hex::encode(hasher.finalize())[..16])
}

pub fn snapshot_filename(package: &str, version: &str, revision: &str) -> String {
    let rev: String = revision
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    format!("{package}-{version}-{rev}.tar.xz")
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct FlakyTransport {
        body: Vec<u8>,
        failures: usize,
        calls: AtomicUsize,
    }

    impl Transport for FlakyTransport {
        fn get(&self, _url: &str, out: &mut dyn Write) -> std::result::Result<u64, TransferError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            // Every attempt writes some garbage before failing.
            out.write_all(b"garbage").expect("write");
            if n < self.failures {
                return Err(TransferError::retryable("connection refused"));
            }
            out.write_all(&self.body).expect("write");
            Ok(self.body.len() as u64)
        }
    }

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _d: Duration) {}
    }

    struct TreeVcs {
        calls: Mutex<usize>,
    }

    impl SourceControl for TreeVcs {
        fn checkout(&self, _repo: &str, _revision: &str, dest: &Path) -> Result<i64> {
            *self.calls.lock().expect("lock") += 1;
            fs::create_dir_all(dest.join(".git")).expect("git");
            fs::create_dir_all(dest.join("src")).expect("src");
            fs::write(dest.join("src/main.c"), "int main(void) { return 0; }\n").expect("main");
            fs::write(dest.join(".git/HEAD"), "ref: refs/heads/main\n").expect("head");
            Ok(1_600_000_000)
        }
    }

    fn fetcher(root: &Path, transport: FlakyTransport) -> Fetcher {
        Fetcher::new(
            ContentStore::open(root.join("cache")).expect("store"),
            RetryPolicy::new(3, Duration::from_secs(5)).expect("policy"),
            Box::new(transport),
            Box::new(NoSleep),
            Box::new(TreeVcs {
                calls: Mutex::new(0),
            }),
        )
    }

    fn download_request(url: &str) -> FetchRequest {
        let src = SourceConfig {
            url: Some(url.into()),
            ..SourceConfig::default()
        };
        FetchRequest::from_source("foo", "1.0", &src).expect("request")
    }

    #[test]
    fn request_derives_filename_and_policy() {
        let req = download_request("https://example.org/dl/foo-1.0.tar.gz?mirror=1");
        assert_eq!(req.filename, "foo-1.0.tar.gz");
        assert_eq!(req.policy, DigestPolicy::Raw);

        let src = SourceConfig {
            git: Some("https://example.org/foo.git".into()),
            rev: Some("v1.0".into()),
            ..SourceConfig::default()
        };
        let req = FetchRequest::from_source("foo", "1.0", &src).expect("request");
        assert_eq!(req.filename, "foo-1.0-v1.0.tar.xz");
        assert_eq!(req.policy, DigestPolicy::FullExtract);

        let both = SourceConfig {
            url: Some("https://example.org/a.tar".into()),
            git: Some("https://example.org/a.git".into()),
            ..SourceConfig::default()
        };
        assert!(FetchRequest::from_source("a", "1", &both).is_err());
        let no_rev = SourceConfig {
            git: Some("https://example.org/a.git".into()),
            ..SourceConfig::default()
        };
        assert!(FetchRequest::from_source("a", "1", &no_rev).is_err());
    }

    #[test]
    fn download_retries_then_commits_clean_bytes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let f = fetcher(
            tmp.path(),
            FlakyTransport {
                body: b"real tarball".to_vec(),
                failures: 2,
                calls: AtomicUsize::new(0),
            },
        );
        let req = download_request("https://example.org/foo-1.0.tar.gz");
        let got = f.fetch(&req).expect("fetch");
        assert!(!got.from_cache);
        // Earlier attempts' partial output is discarded.
        assert_eq!(fs::read(&got.path).expect("read"), b"garbagereal tarball");

        let sig = store::read_signature(&got.path).expect("sig").expect("present");
        assert_eq!(sig, verify::sha256_file_hex(&got.path).expect("digest"));

        let again = f.fetch(&req).expect("fetch again");
        assert!(again.from_cache);
    }

    #[test]
    fn unsigned_store_hit_is_signed_without_refetching() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let f = fetcher(
            tmp.path(),
            FlakyTransport {
                body: b"unused".to_vec(),
                failures: 0,
                calls: AtomicUsize::new(0),
            },
        );
        let path = f
            .store()
            .put_with("foo-1.0.tar.gz", |file| {
                file.write_all(b"committed before the signature")
                    .map_err(|e| Error::msg(e.to_string()))
            })
            .expect("put");
        assert!(store::read_signature(&path).expect("sig").is_none());

        let got = f
            .fetch(&download_request("https://example.org/foo-1.0.tar.gz"))
            .expect("fetch");
        assert!(got.from_cache);
        let sig = store::read_signature(&got.path).expect("sig").expect("present");
        assert_eq!(sig, verify::sha256_file_hex(&got.path).expect("digest"));
    }

    #[test]
    fn exhausted_download_leaves_no_artifact() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let f = fetcher(
            tmp.path(),
            FlakyTransport {
                body: b"never".to_vec(),
                failures: 10,
                calls: AtomicUsize::new(0),
            },
        );
        let req = download_request("https://example.org/foo-1.0.tar.gz");
        assert!(matches!(f.fetch(&req), Err(Error::Fetch { .. })));
        assert_eq!(
            fs::read_dir(tmp.path().join("cache")).expect("read_dir").count(),
            0
        );
    }

    #[test]
    fn snapshots_are_byte_identical_and_strip_git() {
        let a = tempfile::tempdir().expect("a");
        let b = tempfile::tempdir().expect("b");
        let src = SourceConfig {
            git: Some("https://example.org/foo.git".into()),
            rev: Some("0123abcd".into()),
            ..SourceConfig::default()
        };
        let req = FetchRequest::from_source("foo", "1.0", &src).expect("request");
        let transport = || FlakyTransport {
            body: Vec::new(),
            failures: 0,
            calls: AtomicUsize::new(0),
        };

        let pa = fetcher(a.path(), transport()).fetch(&req).expect("a").path;
        let pb = fetcher(b.path(), transport()).fetch(&req).expect("b").path;
        assert_eq!(fs::read(&pa).expect("a"), fs::read(&pb).expect("b"));

        let out = tempfile::tempdir().expect("out");
        archive::extract_into(&pa, out.path()).expect("extract");
        assert!(out.path().join("foo-1.0/src/main.c").is_file());
        assert!(!out.path().join("foo-1.0/.git").exists());

        verify::verify(&pa, None, DigestPolicy::FullExtract).expect("signature verifies");
    }

    #[test]
    fn url_filenames() {
        assert_eq!(
            url_to_filename("https://ftp.gnu.org/gnu/gcc/gcc-13.2.0/gcc-13.2.0.tar.xz"),
            "gcc-13.2.0.tar.xz"
        );
        assert_eq!(url_to_filename("https://example.org/a b.tgz#frag"), "a_b.tgz");
        assert!(url_to_filename("https://example.org/").starts_with("download_"));
    }
}
