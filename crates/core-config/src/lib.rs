//! Analyzer configuration: `punchcard.toml`.
//!
//! Discovery prefers an explicit path, then the working directory, then
//! the platform config directory. Unknown fields are ignored so the file
//! format can grow without breaking older binaries; a file that fails to
//! parse falls back to defaults rather than aborting an analysis.

use anyhow::Result;
use core_lexing::{Ictl, IctlError};
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone)]
pub struct IctlConfig {
    #[serde(default = "IctlConfig::default_begin")]
    pub begin: usize,
    #[serde(default = "IctlConfig::default_end")]
    pub end: usize,
    #[serde(default = "IctlConfig::default_continuation")]
    pub continuation: usize,
    #[serde(default)]
    pub dbcs: bool,
}

impl IctlConfig {
    const fn default_begin() -> usize {
        1
    }
    const fn default_end() -> usize {
        71
    }
    const fn default_continuation() -> usize {
        16
    }
}

impl Default for IctlConfig {
    fn default() -> Self {
        Self {
            begin: Self::default_begin(),
            end: Self::default_end(),
            continuation: Self::default_continuation(),
            dbcs: false,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LibrariesConfig {
    /// Copybook library roots, searched in order.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct PreprocessorsConfig {
    /// Stage names applied in order: "db2", "cics", "include".
    #[serde(default)]
    pub stages: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub ictl: IctlConfig,
    #[serde(default)]
    pub libraries: LibrariesConfig,
    #[serde(default)]
    pub preprocessors: PreprocessorsConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Original file text, when one was read.
    pub raw: Option<String>,
    pub file: ConfigFile,
}

/// Best-effort config path following platform conventions.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("punchcard.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("punchcard").join("punchcard.toml");
    }
    PathBuf::from("punchcard.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => {
                info!(target: "config", path = %path.display(), "config_loaded");
                Ok(Config {
                    raw: Some(content),
                    file,
                })
            }
            Err(err) => {
                warn!(target: "config", path = %path.display(), %err, "config_parse_failed");
                Ok(Config::default())
            }
        }
    } else {
        Ok(Config::default())
    }
}

impl Config {
    /// The configured columns as validated extractor arguments.
    pub fn ictl(&self) -> Result<Ictl, IctlError> {
        let cfg = &self.file.ictl;
        Ictl::new(cfg.begin, cfg.end, cfg.continuation).map(|i| i.with_dbcs(cfg.dbcs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_when_missing_file() {
        let cfg = load_from(Some(PathBuf::from("__nonexistent_hopefully__.toml"))).unwrap();
        assert_eq!(cfg.file.ictl.begin, 1);
        assert_eq!(cfg.file.ictl.end, 71);
        assert_eq!(cfg.file.ictl.continuation, 16);
        assert!(cfg.file.preprocessors.stages.is_empty());
    }

    #[test]
    fn parses_sections() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "[ictl]\nbegin = 2\ncontinuation = 17\ndbcs = true\n\
             [libraries]\npaths = [\"copybooks\"]\n\
             [preprocessors]\nstages = [\"db2\", \"include\"]\n",
        )
        .unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.ictl.begin, 2);
        assert_eq!(cfg.file.ictl.continuation, 17);
        assert!(cfg.file.ictl.dbcs);
        assert_eq!(cfg.file.libraries.paths, vec![PathBuf::from("copybooks")]);
        assert_eq!(cfg.file.preprocessors.stages, vec!["db2", "include"]);

        let ictl = cfg.ictl().unwrap();
        assert_eq!(ictl.begin, 2);
        assert!(ictl.dbcs);
    }

    #[test]
    fn bad_toml_falls_back_to_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "this is not [toml").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert!(cfg.raw.is_none());
        assert_eq!(cfg.file.ictl.end, 71);
    }

    #[test]
    fn invalid_columns_surface_through_ictl() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[ictl]\nbegin = 20\ncontinuation = 10\n").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert!(cfg.ictl().is_err());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[future]\nsetting = 1\n[ictl]\nend = 72\n").unwrap();
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.file.ictl.end, 72);
    }
}
