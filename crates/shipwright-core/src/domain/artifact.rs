//! Source artifacts: immutable generated code plus its language tag.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cas::Digest;

use super::error::{Result, ShipwrightError};

/// Languages the pipeline can execute, deploy and syntax-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    #[serde(rename = "javascript")]
    JavaScript,
    /// POSIX shell, run under `/bin/sh`.
    Shell,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::JavaScript, Language::Shell];

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Shell => "shell",
        }
    }

    /// File extension used when the artifact is materialized on disk.
    pub fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
            Language::Shell => "sh",
        }
    }

    /// File name of the entry point inside a scratch or version directory.
    pub fn entry_file(&self) -> String {
        format!("main.{}", self.extension())
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ShipwrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "shell" | "sh" | "bash" => Ok(Language::Shell),
            other => Err(ShipwrightError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Immutable unit of generated source.
///
/// Content is normalized on construction (CRLF → LF, trailing blank space
/// at end of file collapsed to one newline) and `content_hash` is the
/// SHA-256 of the normalized bytes, so cosmetic differences from the
/// generator do not defeat deduplication. Refinement never mutates an
/// artifact; it produces a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceArtifact {
    content: Vec<u8>,
    language: Language,
    content_hash: Digest,
}

impl SourceArtifact {
    pub fn new(content: impl AsRef<[u8]>, language: Language) -> Self {
        let content = normalize_content(content.as_ref());
        let content_hash = Digest::compute(&content);
        Self {
            content,
            language,
            content_hash,
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Content as text, with invalid UTF-8 replaced.
    pub fn content_lossy(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn content_hash(&self) -> Digest {
        self.content_hash
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Canonical byte form that `content_hash` is computed over.
pub fn normalize_content(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 1);
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\r' && raw.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(raw[i]);
        i += 1;
    }

    while matches!(out.last(), Some(b'\n' | b'\r' | b' ' | b'\t')) {
        out.pop();
    }
    if !out.is_empty() {
        out.push(b'\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_parses_aliases() {
        assert_eq!("python3".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("JS".parse::<Language>().unwrap(), Language::JavaScript);
        assert_eq!("bash".parse::<Language>().unwrap(), Language::Shell);
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn language_display_matches_serde() {
        for lang in Language::ALL {
            let json = serde_json::to_string(&lang).unwrap();
            assert_eq!(json, format!("\"{}\"", lang));
        }
    }

    #[test]
    fn normalization_makes_line_endings_irrelevant() {
        let unix = SourceArtifact::new("print(1)\nprint(2)\n", Language::Python);
        let dos = SourceArtifact::new("print(1)\r\nprint(2)\r\n\r\n  ", Language::Python);
        assert_eq!(unix.content_hash(), dos.content_hash());
        assert_eq!(unix.content(), b"print(1)\nprint(2)\n");
    }

    #[test]
    fn empty_content_stays_empty() {
        let a = SourceArtifact::new("\n\n", Language::Shell);
        assert!(a.is_empty());
        assert_eq!(a.content_hash(), Digest::compute(b""));
    }

    #[test]
    fn different_content_different_hash() {
        let a = SourceArtifact::new("echo a", Language::Shell);
        let b = SourceArtifact::new("echo b", Language::Shell);
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
