use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

pub mod schema;

pub use schema::{
    FetchConfig, PhaseConfig, PublishConfig, SourceConfig, StageConfig, ToolchainConfig,
};

/// A build definition after `extends`/`imports` have been folded in.
#[derive(Debug, Clone)]
pub struct BuildDefinition {
    pub path: PathBuf,
    pub value: Value,
}

impl BuildDefinition {
    pub fn from_str(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let value: Value = toml::from_str(raw)?;
        Ok(Self {
            path: path.into(),
            value,
        })
    }

    pub fn lookup(&self, dotted: &str) -> Option<&Value> {
        let dotted = dotted.trim();
        if dotted.is_empty() {
            return Some(&self.value);
        }
        dotted
            .split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn section<T: DeserializeOwned>(&self, dotted: &str) -> Result<Option<T>> {
        let Some(v) = self.lookup(dotted) else {
            return Ok(None);
        };
        v.clone()
            .try_into()
            .map(Some)
            .map_err(|e| Error::config(format!("invalid [{dotted}] in {}: {e}", self.path.display())))
    }

    pub fn section_or_default<T: DeserializeOwned + Default>(&self, dotted: &str) -> Result<T> {
        Ok(self.section(dotted)?.unwrap_or_default())
    }

    /// Directory the definition was loaded from; relative references resolve against it.
    pub fn base_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn stages(&self) -> Result<Vec<StageConfig>> {
        let Some(raw) = self.lookup("stage") else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = raw else {
            return Err(Error::config("'stage' must be an array of tables ([[stage]])"));
        };
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let st: StageConfig = item
                .clone()
                .try_into()
                .map_err(|e| Error::config(format!("invalid [[stage]] #{}: {e}", i + 1)))?;
            out.push(st);
        }
        Ok(out)
    }
}

/// Child values win; tables merge key by key.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(dst), Value::Table(src)) => {
            for (k, v) in src {
                if let Some(slot) = dst.get_mut(&k) {
                    merge(slot, v);
                } else {
                    dst.insert(k, v);
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

struct Loader {
    visiting: HashSet<PathBuf>,
}

impl Loader {
    fn relative_to(file: &Path, reference: &str) -> PathBuf {
        let p = PathBuf::from(reference);
        if p.is_absolute() {
            return p;
        }
        file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }

    fn load_file(&mut self, path: &Path) -> Result<Value> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !self.visiting.insert(key.clone()) {
            return Err(Error::config(format!(
                "import cycle detected at {}",
                key.display()
            )));
        }

        let raw = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        let mut value: Value = toml::from_str(&raw)
            .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

        let mut acc = match value.as_table_mut().and_then(|t| t.remove("extends")) {
            Some(Value::String(parent)) => self.load_file(&Self::relative_to(path, &parent))?,
            Some(_) => {
                return Err(Error::config(format!(
                    "'extends' in {} must be a string",
                    path.display()
                )));
            }
            None => Value::Table(Default::default()),
        };

        self.inline_imports(path, &mut value)?;
        merge(&mut acc, value);

        self.visiting.remove(&key);
        Ok(acc)
    }

    fn inline_imports(&mut self, file: &Path, value: &mut Value) -> Result<()> {
        let Value::Table(tbl) = value else {
            return Ok(());
        };

        if let Some(imports) = tbl.remove("imports") {
            let Value::Array(list) = imports else {
                return Err(Error::config(format!(
                    "'imports' in {} must be an array of strings",
                    file.display()
                )));
            };
            let mut acc = Value::Table(Default::default());
            for entry in list {
                let Some(rel) = entry.as_str() else {
                    return Err(Error::config(format!(
                        "invalid imports entry in {} (expected string)",
                        file.display()
                    )));
                };
                if rel.trim().is_empty() {
                    continue;
                }
                let loaded = self.load_file(&Self::relative_to(file, rel.trim()))?;
                merge(&mut acc, loaded);
            }
            merge(&mut acc, Value::Table(std::mem::take(tbl)));
            if let Value::Table(merged) = acc {
                *tbl = merged;
            }
        }

        for (_, v) in tbl.iter_mut() {
            self.inline_imports(file, v)?;
        }
        Ok(())
    }
}

pub fn load(path: &Path) -> Result<BuildDefinition> {
    let mut loader = Loader {
        visiting: HashSet::new(),
    };
    let value = loader.load_file(path)?;
    Ok(BuildDefinition {
        path: path.to_path_buf(),
        value,
    })
}
