//! schroot chroot-definition files.
//!
//! The format is line-oriented: a `[name]` header followed by `key=value`
//! lines. schroot tolerates no leading whitespace, so the renderer strips it
//! from every line regardless of how the template was indented.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Parsed view of a chroot definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchrootConfig {
    /// The stable chroot name from the `[name]` header.
    pub name: String,
    /// `key=value` entries in file order.
    pub entries: Vec<(String, String)>,
}

impl SchrootConfig {
    /// Parse chroot-definition text.
    ///
    /// Comments (`#`) and blank lines are skipped. Exactly one `[name]`
    /// header is required and it must come before any entry.
    pub fn parse(content: &str) -> Result<SchrootConfig> {
        let mut name: Option<String> = None;
        let mut entries = Vec::new();

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if name.is_some() {
                    bail!("line {}: multiple chroot headers", lineno + 1);
                }
                if header.is_empty() || !header.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                    bail!("line {}: invalid chroot name '{}'", lineno + 1, header);
                }
                name = Some(header.to_string());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("line {}: expected 'key=value', got '{}'", lineno + 1, line);
            };
            if name.is_none() {
                bail!("line {}: entry before chroot header", lineno + 1);
            }
            entries.push((key.trim().to_string(), value.trim().to_string()));
        }

        let Some(name) = name else {
            bail!("no [name] header found");
        };
        Ok(SchrootConfig { name, entries })
    }

    /// Read and parse a chroot-definition file.
    pub fn load(path: &Path) -> Result<SchrootConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading schroot config '{}'", path.display()))?;
        SchrootConfig::parse(&content)
            .with_context(|| format!("parsing schroot config '{}'", path.display()))
    }

    /// Value of the first entry with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `directory=` entry, if present.
    pub fn directory(&self) -> Option<&str> {
        self.get("directory")
    }

    /// Render to the on-disk format.
    ///
    /// Every line is emitted without leading whitespace; schroot rejects
    /// indented lines.
    pub fn render(&self) -> String {
        let mut out = format!("[{}]\n", self.name);
        for (key, value) in &self.entries {
            out.push_str(key.trim_start());
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[debforge_abcde]
description=debforge build environment
type=directory
directory=/var/lib/debforge/build/debootstrap-root
groups=debforge
root-groups=debforge
profile=debforge
";

    #[test]
    fn parse_extracts_name_and_entries() {
        let config = SchrootConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.name, "debforge_abcde");
        assert_eq!(
            config.directory(),
            Some("/var/lib/debforge/build/debootstrap-root")
        );
        assert_eq!(config.get("type"), Some("directory"));
        assert_eq!(config.entries.len(), 6);
    }

    #[test]
    fn parse_tolerates_indentation_and_comments() {
        let indented = "
            # template left indented on purpose
            [debforge_xyzzy]
            type=directory
            directory=/some/root
        ";
        let config = SchrootConfig::parse(indented).unwrap();
        assert_eq!(config.name, "debforge_xyzzy");
        assert_eq!(config.directory(), Some("/some/root"));
    }

    #[test]
    fn render_strips_leading_whitespace() {
        let config = SchrootConfig::parse(SAMPLE).unwrap();
        let rendered = config.render();
        for line in rendered.lines() {
            assert_eq!(line, line.trim_start(), "indented line: '{line}'");
        }
        // Round-trips through the parser.
        assert_eq!(SchrootConfig::parse(&rendered).unwrap(), config);
    }

    #[test]
    fn parse_rejects_missing_header() {
        assert!(SchrootConfig::parse("directory=/x\n").is_err());
        assert!(SchrootConfig::parse("").is_err());
    }

    #[test]
    fn parse_rejects_garbage_lines() {
        assert!(SchrootConfig::parse("[name]\nnot a key value\n").is_err());
    }
}
