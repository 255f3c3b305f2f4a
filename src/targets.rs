//! Target list loading.

use crate::model::Target;
use anyhow::{Context, Result};
use std::path::Path;

/// Parse a newline-delimited target list. Blank lines are skipped; order and
/// duplicates are kept as given.
pub fn parse_targets(text: &str) -> Vec<Target> {
    text.lines().filter_map(Target::new).collect()
}

pub fn load_targets(path: &Path) -> Result<Vec<Target>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read target list {}", path.display()))?;
    let targets = parse_targets(&text);
    if targets.is_empty() {
        return Err(anyhow::anyhow!(
            "{} does not contain any targets",
            path.display()
        ));
    }
    log::info!("Loaded {} targets from {}", targets.len(), path.display());
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_targets_keeps_order_and_duplicates() {
        let text = "http://b.example\n\n  http://a.example/file.bin  \r\n\t\nhttp://b.example\n";
        let targets: Vec<String> = parse_targets(text)
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        assert_eq!(
            targets,
            vec![
                "http://b.example",
                "http://a.example/file.bin",
                "http://b.example"
            ]
        );
    }

    #[test]
    fn test_load_targets_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "http://one.example").unwrap();
        writeln!(f, "not a url at all").unwrap();
        let targets = load_targets(f.path()).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].as_str(), "not a url at all");
    }

    #[test]
    fn test_load_targets_rejects_empty_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "   ").unwrap();
        assert!(load_targets(f.path()).is_err());
    }
}
