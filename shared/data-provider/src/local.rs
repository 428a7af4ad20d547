use crate::Dataset;
use anyhow::{anyhow, bail, Result};
use std::{fs, path::Path};
use tracing::{info, warn};

/// Text examples read from a directory: one per non-empty line of each `.txt` file and one per
/// `"text"` field of each `.jsonl` line.
#[derive(Debug, Clone)]
pub struct LocalTextDataset {
    examples: Vec<String>,
}

impl LocalTextDataset {
    pub fn new_from_directory(dir: impl AsRef<Path>, limit: Option<usize>) -> Result<Self> {
        let dir = fs::canonicalize(&dir)
            .map_err(|e| anyhow!("Failed to open data directory {:?}: {e}", dir.as_ref()))?;
        let mut files = vec![];
        for file in fs::read_dir(&dir)
            .map_err(|e| anyhow!("couldn't load training data from {}: {e}", dir.display()))?
            .flatten()
        {
            let file = file.path();
            if let Some(extension) = file.extension() {
                if extension == "txt" || extension == "jsonl" {
                    files.push(file)
                }
            }
        }
        if files.is_empty() {
            bail!("No .txt or .jsonl files in directory {:?}", dir);
        }
        // directory iteration order is platform dependent
        files.sort();

        let limit = limit.unwrap_or(usize::MAX);
        let mut examples = Vec::new();
        'files: for file in &files {
            let contents = fs::read_to_string(file)?;
            let is_jsonl = file.extension().is_some_and(|x| x == "jsonl");
            for (line_number, line) in contents.lines().enumerate() {
                if examples.len() >= limit {
                    break 'files;
                }
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !is_jsonl {
                    examples.push(line.to_owned());
                    continue;
                }
                let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
                    anyhow!("{}:{}: invalid json: {e}", file.display(), line_number + 1)
                })?;
                match value.get("text").and_then(|x| x.as_str()) {
                    Some(text) => examples.push(text.to_owned()),
                    None => warn!(
                        file = %file.display(),
                        line = line_number + 1,
                        "Skipping jsonl record without a \"text\" string"
                    ),
                }
            }
        }

        info!(
            "Loaded {} examples from {} files in {}",
            examples.len(),
            files.len(),
            dir.display()
        );
        Ok(Self { examples })
    }

    pub fn from_examples(examples: Vec<String>) -> Self {
        Self { examples }
    }
}

impl Dataset for LocalTextDataset {
    type Item = String;

    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> Result<String> {
        self.examples.get(index).cloned().ok_or_else(|| {
            anyhow!(
                "index {index} is out of bounds, we only have {} samples.",
                self.examples.len()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::write;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path().join("a.txt"), "first line\n\n  second line  \n").unwrap();
        write(
            dir.path().join("b.jsonl"),
            "{\"text\": \"from json\"}\n{\"id\": 3}\n{\"text\": \"again\"}\n",
        )
        .unwrap();
        write(dir.path().join("ignored.csv"), "x,y\n").unwrap();
        dir
    }

    #[test]
    fn reads_txt_and_jsonl() {
        let dir = fixture();
        let dataset = LocalTextDataset::new_from_directory(dir.path(), None).unwrap();
        let all: Vec<String> = (0..dataset.len()).map(|i| dataset.get(i).unwrap()).collect();
        assert_eq!(all, vec!["first line", "second line", "from json", "again"]);
        assert!(dataset.get(4).is_err());
    }

    #[test]
    fn limit_caps_examples() {
        let dir = fixture();
        let dataset = LocalTextDataset::new_from_directory(dir.path(), Some(3)).unwrap();
        assert_eq!(dataset.len(), 3);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalTextDataset::new_from_directory(dir.path(), None).is_err());
    }
}
