//! Pipeline steps and the manifest they are loaded from.
//!
//! A manifest is JSON or TOML. It is either a bare list of entries or an
//! object with a `steps` list. Each entry is a plain instruction string or
//! an object carrying the instruction plus optional acceptance criteria.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{Result, StepwrightError};

/// A single acceptance criterion checked against the artifact tree.
///
/// Paths are relative to the artifact root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Criterion {
    /// The path must exist.
    FileExists { path: String },

    /// The file must exist and contain `needle`.
    FileContains { path: String, needle: String },

    /// At least one file with `extension` must contain `needle`.
    AnyFileContains { extension: String, needle: String },

    /// Files with `extension` must match `pattern` at least `min` times in total.
    MinMatches {
        extension: String,
        pattern: String,
        min: usize,
    },

    /// No file with `extension` may match `pattern`.
    ForbidPattern { extension: String, pattern: String },

    /// The external feature check must pass for `name`.
    Feature { name: String },
}

/// One ordered unit of work in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based ordinal.
    pub index: usize,

    /// Opaque instruction handed to the mutation agent.
    pub instruction: String,

    /// Step-specific acceptance criteria (empty = none declared).
    #[serde(default)]
    pub criteria: Vec<Criterion>,
}

impl Step {
    pub fn new(index: usize, instruction: impl Into<String>) -> Self {
        Self {
            index,
            instruction: instruction.into(),
            criteria: Vec::new(),
        }
    }

    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    /// First line of the instruction, shortened for logs and reports.
    pub fn headline(&self) -> String {
        let first = self.instruction.lines().next().unwrap_or("").trim();
        if first.chars().count() > 72 {
            let short: String = first.chars().take(69).collect();
            format!("{short}...")
        } else {
            first.to_string()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestEntry {
    Plain(String),
    Detailed {
        #[serde(alias = "instruction")]
        prompt: String,
        #[serde(default, alias = "validation_criteria")]
        criteria: Vec<Criterion>,
        #[serde(default)]
        feature: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestDoc {
    List(Vec<ManifestEntry>),
    Wrapped { steps: Vec<ManifestEntry> },
}

/// Ordered step list supplied by the instruction source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepManifest {
    pub steps: Vec<Step>,
}

impl StepManifest {
    /// Build a manifest from plain instruction strings.
    pub fn from_instructions<I, S>(instructions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps = instructions
            .into_iter()
            .enumerate()
            .map(|(i, text)| Step::new(i + 1, text))
            .collect();
        Self { steps }
    }

    /// Load a manifest, picking the format from the file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            _ => Self::from_json_str(&raw),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let doc: ManifestDoc = serde_json::from_str(raw)
            .map_err(|e| StepwrightError::InvalidManifest(e.to_string()))?;
        Self::from_doc(doc)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let doc: ManifestDoc =
            toml::from_str(raw).map_err(|e| StepwrightError::InvalidManifest(e.to_string()))?;
        Self::from_doc(doc)
    }

    fn from_doc(doc: ManifestDoc) -> Result<Self> {
        let entries = match doc {
            ManifestDoc::List(entries) => entries,
            ManifestDoc::Wrapped { steps } => steps,
        };
        if entries.is_empty() {
            return Err(StepwrightError::InvalidManifest(
                "manifest contains no steps".to_string(),
            ));
        }

        let mut steps = Vec::with_capacity(entries.len());
        for (i, entry) in entries.into_iter().enumerate() {
            let step = match entry {
                ManifestEntry::Plain(text) => Step::new(i + 1, text),
                ManifestEntry::Detailed {
                    prompt,
                    mut criteria,
                    feature,
                } => {
                    if let Some(name) = feature {
                        criteria.push(Criterion::Feature { name });
                    }
                    Step {
                        index: i + 1,
                        instruction: prompt,
                        criteria,
                    }
                }
            };
            if step.instruction.trim().is_empty() {
                return Err(StepwrightError::InvalidManifest(format!(
                    "step {} has an empty instruction",
                    i + 1
                )));
            }
            steps.push(step);
        }
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Fetch a step by its 1-based index.
    pub fn get(&self, index: usize) -> Result<&Step> {
        index
            .checked_sub(1)
            .and_then(|i| self.steps.get(i))
            .ok_or(StepwrightError::InvalidStepIndex {
                index,
                len: self.steps.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_json_list() {
        let manifest =
            StepManifest::from_json_str(r#"["Create src/lib.rs", "Add tests"]"#).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.get(1).unwrap().instruction, "Create src/lib.rs");
        assert_eq!(manifest.get(2).unwrap().index, 2);
    }

    #[test]
    fn test_wrapped_json_with_criteria() {
        let raw = r#"{
            "steps": [
                {"prompt": "Add settings screen",
                 "validation_criteria": [{"type": "file_exists", "path": "lib/settings.dart"}],
                 "feature": "settings"},
                "Polish"
            ]
        }"#;
        let manifest = StepManifest::from_json_str(raw).unwrap();
        let first = manifest.get(1).unwrap();
        assert_eq!(first.criteria.len(), 2);
        assert_eq!(
            first.criteria[1],
            Criterion::Feature {
                name: "settings".to_string()
            }
        );
        assert!(manifest.get(2).unwrap().criteria.is_empty());
    }

    #[test]
    fn test_toml_manifest() {
        let raw = r#"
            [[steps]]
            prompt = "Create README.md"

            [[steps]]
            prompt = "Write docs"
            criteria = [{ type = "file_contains", path = "README.md", needle = "Usage" }]
        "#;
        let manifest = StepManifest::from_toml_str(raw).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.get(2).unwrap().criteria.len(), 1);
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let err = StepManifest::from_json_str("[]").unwrap_err();
        assert!(matches!(err, StepwrightError::InvalidManifest(_)));
    }

    #[test]
    fn test_out_of_range_index() {
        let manifest = StepManifest::from_instructions(["one"]);
        assert!(manifest.get(0).is_err());
        assert!(manifest.get(2).is_err());
    }

    #[test]
    fn test_headline_truncates() {
        let step = Step::new(1, "x".repeat(100));
        assert_eq!(step.headline().chars().count(), 72);
        assert!(step.headline().ends_with("..."));
    }
}
