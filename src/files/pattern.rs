//! `{index}`-templated filename patterns.
//!
//! A pattern contains exactly one placeholder, `{index}` or `{index:0N}`
//! (zero-padded to `N` digits), e.g. `frame_{index:04}.tif`.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// A filename template with a single frame index placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenamePattern {
    prefix: String,
    suffix: String,
    /// Zero-padding width; 0 means no padding.
    width: usize,
}

impl FilenamePattern {
    /// Parse a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the pattern has no placeholder, more than
    /// one placeholder (ambiguous naming delta), a malformed placeholder, or
    /// a path separator.
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.contains('/') || pattern.contains('\\') {
            return Err(Error::Config(format!(
                "filename pattern '{pattern}' must not contain a directory"
            )));
        }

        let placeholders = pattern.matches("{index").count();
        match placeholders {
            0 => {
                return Err(Error::Config(format!(
                    "filename pattern '{pattern}' has no {{index}} placeholder"
                )));
            }
            1 => {}
            n => {
                return Err(Error::Config(format!(
                    "filename pattern '{pattern}' is ambiguous: {n} index placeholders"
                )));
            }
        }

        let start = pattern.find("{index").unwrap_or_default();
        let end = pattern[start..]
            .find('}')
            .map(|offset| start + offset)
            .ok_or_else(|| {
                Error::Config(format!("unterminated placeholder in pattern '{pattern}'"))
            })?;

        let spec = &pattern[start + "{index".len()..end];
        let width = match spec {
            "" => 0,
            s => {
                let digits = s
                    .strip_prefix(":0")
                    .or_else(|| s.strip_prefix(':'))
                    .ok_or_else(|| {
                        Error::Config(format!("malformed placeholder '{{index{s}}}'"))
                    })?;
                digits.parse::<usize>().map_err(|_| {
                    Error::Config(format!("malformed placeholder '{{index{s}}}'"))
                })?
            }
        };

        let prefix = pattern[..start].to_string();
        let suffix = pattern[end + 1..].to_string();
        if prefix.contains(['{', '}']) || suffix.contains(['{', '}']) {
            return Err(Error::Config(format!(
                "filename pattern '{pattern}' contains stray braces"
            )));
        }

        Ok(Self {
            prefix,
            suffix,
            width,
        })
    }

    /// Filename for `index`.
    pub fn format(&self, index: u64) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            index,
            self.suffix,
            width = self.width
        )
    }

    /// Full path for `index` inside `dir`.
    pub fn path(&self, dir: &Path, index: u64) -> PathBuf {
        dir.join(self.format(index))
    }

    /// Extract the index from a filename matching this pattern.
    pub fn index_of(&self, file_name: &str) -> Option<u64> {
        let digits = file_name
            .strip_prefix(&self.prefix)?
            .strip_suffix(&self.suffix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if self.width > 0 && digits.len() < self.width {
            return None;
        }
        digits.parse().ok()
    }

    /// Glob expression matching every file this pattern could produce.
    pub fn glob(&self, dir: &Path) -> String {
        let escaped = |s: &str| glob::Pattern::escape(s);
        format!(
            "{}/{}*{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            escaped(&self.prefix),
            escaped(&self.suffix)
        )
    }

    /// Highest index among existing files in `dir`.
    pub fn highest_existing(&self, dir: &Path) -> Result<Option<u64>> {
        let mut highest = None;
        for entry in glob::glob(&self.glob(dir))?.flatten() {
            let index = entry
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| self.index_of(n));
            if let Some(index) = index {
                highest = highest.max(Some(index));
            }
        }
        Ok(highest)
    }
}

impl std::fmt::Display for FilenamePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.width > 0 {
            write!(f, "{}{{index:0{}}}{}", self.prefix, self.width, self.suffix)
        } else {
            write!(f, "{}{{index}}{}", self.prefix, self.suffix)
        }
    }
}
