use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Msg(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("fetch failed for {what}: {message}")]
    Fetch { what: String, message: String },

    #[error(
        "integrity mismatch for {}: expected {expected}, got {actual}",
        path.display()
    )]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("no expected digest given and no signature found at {}", path.display())]
    MissingSignature { path: PathBuf },

    #[error("not found in content store: {0}")]
    NotFound(String),

    #[error("extract failed for {}: {message}", archive.display())]
    Extract { archive: PathBuf, message: String },

    #[error("patch {} failed: {message}", patch.display())]
    Patch { patch: PathBuf, message: String },

    #[error("build operation failed for stage '{stage}': {message}{}", render_hints(hints))]
    BuildOperation {
        stage: String,
        message: String,
        hints: Vec<String>,
    },

    #[error("publish failed: {0}")]
    ArchivePublish(String),

    #[error("interrupted")]
    Interrupted,
}

fn render_hints(hints: &[String]) -> String {
    if hints.is_empty() {
        return String::new();
    }
    let mut out = String::from(" (hints: ");
    out.push_str(&hints.join("; "));
    out.push(')');
    out
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    pub fn fetch(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn extract(archive: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Extract {
            archive: archive.into(),
            message: message.into(),
        }
    }

    pub fn patch(patch: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Patch {
            patch: patch.into(),
            message: message.into(),
        }
    }

    pub fn publish<M: Into<String>>(msg: M) -> Self {
        Self::ArchivePublish(msg.into())
    }

    /// Maps an error onto the process exit status the CLI reports.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Interrupted => 130,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_reports_both_digests() {
        let err = Error::IntegrityMismatch {
            path: PathBuf::from("/cache/foo-1.0.tar.gz"),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        let text = err.to_string();
        assert!(text.contains("expected aa"), "{text}");
        assert!(text.contains("got bb"), "{text}");
    }

    #[test]
    fn build_failure_lists_hints() {
        let err = Error::BuildOperation {
            stage: "gcc-13.2.0-final".into(),
            message: "command failed: exit status: 2".into(),
            hints: vec!["missing symbol".into(), "bad flag".into()],
        };
        assert!(err.to_string().ends_with("(hints: missing symbol; bad flag)"));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(Error::Interrupted.exit_code(), 130);
    }
}
