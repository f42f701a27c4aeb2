//! Step validator registry.
//!
//! Validators are read-only inspectors of the artifact tree. Which one
//! applies to a step is decided once, as a [`StepKind`], before the step
//! is validated; re-validation after a fix reuses the same kind.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use stepwright_core::{Criterion, CriterionResult, Step, ValidationReport};
use walkdir::{DirEntry, WalkDir};

use crate::supervisor::{CommandSpec, ProcessSupervisor, SupervisorLimits};

/// Directories never inspected by content criteria.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "build"];

/// Step-specific acceptance check.
#[async_trait]
pub trait StepValidator: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, root: &Path, step: &Step) -> ValidationReport;
}

/// External feature check, invoked with a feature name.
#[async_trait]
pub trait FeatureCheck: Send + Sync {
    async fn check(&self, root: &Path, feature: &str) -> Result<bool>;
}

/// Which validation applies to a step.
#[derive(Clone)]
pub enum StepKind {
    /// A validator registered for this step index.
    Registered(Arc<dyn StepValidator>),
    /// The step declares its own criteria.
    Criteria,
    /// The instruction names a file to create or edit; it must exist.
    Inferred(String),
    /// Nothing to check beyond the gate.
    Unchecked,
}

impl StepKind {
    pub fn label(&self) -> String {
        match self {
            StepKind::Registered(v) => format!("registered:{}", v.name()),
            StepKind::Criteria => "criteria".to_string(),
            StepKind::Inferred(path) => format!("inferred:{path}"),
            StepKind::Unchecked => "unchecked".to_string(),
        }
    }
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

fn topic_regex() -> &'static Regex {
    static TOPIC: OnceLock<Regex> = OnceLock::new();
    TOPIC.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)\b(?:create|edit|update|modify)\s+(?:the\s+|a\s+|new\s+)*(?:file\s+)?",
            r"`?([\w./-]+\.[A-Za-z0-9]+)`?",
        ))
        .expect("valid topic pattern")
    })
}

/// Infer the file an instruction is about, e.g. "Create lib/cart.dart ...".
///
/// Tokens with fewer than three letters ("e.g", "i.e") are not paths.
pub fn infer_topic(instruction: &str) -> Option<String> {
    topic_regex()
        .captures_iter(instruction)
        .map(|caps| caps[1].trim_end_matches('.').to_string())
        .find(|token| token.chars().filter(|c| c.is_alphabetic()).count() >= 3)
}

/// Evaluates declarative [`Criterion`] lists.
#[derive(Clone, Default)]
pub struct CriteriaValidator {
    features: Option<Arc<dyn FeatureCheck>>,
}

impl CriteriaValidator {
    pub fn new(features: Option<Arc<dyn FeatureCheck>>) -> Self {
        Self { features }
    }

    /// One result per criterion, in declaration order.
    pub async fn evaluate(&self, root: &Path, criteria: &[Criterion]) -> Vec<CriterionResult> {
        let mut results = Vec::with_capacity(criteria.len());
        for criterion in criteria {
            let (passed, detail) = self.evaluate_one(root, criterion).await;
            results.push(CriterionResult {
                criterion: criterion_label(criterion),
                passed,
                detail,
            });
        }
        results
    }

    async fn evaluate_one(&self, root: &Path, criterion: &Criterion) -> (bool, String) {
        match criterion {
            Criterion::FileExists { path } => {
                if root.join(path).exists() {
                    (true, "present".to_string())
                } else {
                    (false, format!("{path} does not exist"))
                }
            }
            Criterion::FileContains { path, needle } => {
                match std::fs::read_to_string(root.join(path)) {
                    Ok(text) if text.contains(needle.as_str()) => (true, "found".to_string()),
                    Ok(_) => (false, format!("{path} does not contain '{needle}'")),
                    Err(e) => (false, format!("cannot read {path}: {e}")),
                }
            }
            Criterion::AnyFileContains { extension, needle } => {
                match files_with_extension(root, extension)
                    .into_iter()
                    .find(|(_, text)| text.contains(needle.as_str()))
                {
                    Some((path, _)) => (true, format!("found in {}", path.display())),
                    None => (false, format!("no .{extension} file contains '{needle}'")),
                }
            }
            Criterion::MinMatches {
                extension,
                pattern,
                min,
            } => {
                let re = match Regex::new(pattern) {
                    Ok(re) => re,
                    Err(e) => return (false, format!("invalid pattern '{pattern}': {e}")),
                };
                let found: usize = files_with_extension(root, extension)
                    .iter()
                    .map(|(_, text)| re.find_iter(text).count())
                    .sum();
                (found >= *min, format!("{found} match(es), need at least {min}"))
            }
            Criterion::ForbidPattern { extension, pattern } => {
                let re = match Regex::new(pattern) {
                    Ok(re) => re,
                    Err(e) => return (false, format!("invalid pattern '{pattern}': {e}")),
                };
                match files_with_extension(root, extension)
                    .into_iter()
                    .find(|(_, text)| re.is_match(text))
                {
                    Some((path, _)) => (false, format!("forbidden pattern in {}", path.display())),
                    None => (true, "absent".to_string()),
                }
            }
            Criterion::Feature { name } => match &self.features {
                None => (false, format!("no feature check configured for '{name}'")),
                Some(check) => match check.check(root, name).await {
                    Ok(true) => (true, "feature check passed".to_string()),
                    Ok(false) => (false, format!("feature check failed for '{name}'")),
                    Err(e) => (false, format!("feature check error for '{name}': {e:#}")),
                },
            },
        }
    }
}

#[async_trait]
impl StepValidator for CriteriaValidator {
    fn name(&self) -> &str {
        "criteria"
    }

    async fn validate(&self, root: &Path, step: &Step) -> ValidationReport {
        ValidationReport::from_results(self.name(), self.evaluate(root, &step.criteria).await)
    }
}

/// Checks that the file an instruction names exists.
pub struct TopicValidator {
    path: String,
}

impl TopicValidator {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StepValidator for TopicValidator {
    fn name(&self) -> &str {
        "inferred"
    }

    async fn validate(&self, root: &Path, _step: &Step) -> ValidationReport {
        let exists = root.join(&self.path).exists();
        ValidationReport::from_results(
            self.name(),
            vec![CriterionResult {
                criterion: format!("file_exists({})", self.path),
                passed: exists,
                detail: if exists {
                    "present".to_string()
                } else {
                    format!("{} does not exist", self.path)
                },
            }],
        )
    }
}

/// Feature check that runs `<command> <feature>` in the artifact root.
pub struct CommandFeatureCheck {
    command: Vec<String>,
    supervisor: Arc<ProcessSupervisor>,
    limits: SupervisorLimits,
}

impl CommandFeatureCheck {
    pub fn new(
        command: Vec<String>,
        supervisor: Arc<ProcessSupervisor>,
        timeout: Duration,
    ) -> Self {
        Self {
            command,
            supervisor,
            limits: SupervisorLimits::default()
                .without_sentinel()
                .with_timeout(timeout),
        }
    }
}

#[async_trait]
impl FeatureCheck for CommandFeatureCheck {
    async fn check(&self, root: &Path, feature: &str) -> Result<bool> {
        let spec = CommandSpec::from_argv(&self.command, root)?.arg(feature);
        let output = self.supervisor.run(&spec, &self.limits).await?;
        Ok(output.success())
    }
}

/// Maps steps to validators.
pub struct ValidatorRegistry {
    root: PathBuf,
    registered: HashMap<usize, Arc<dyn StepValidator>>,
    criteria: CriteriaValidator,
}

impl ValidatorRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registered: HashMap::new(),
            criteria: CriteriaValidator::default(),
        }
    }

    /// Register a validator for a 1-based step index, replacing any previous one.
    pub fn register(mut self, index: usize, validator: Arc<dyn StepValidator>) -> Self {
        self.registered.insert(index, validator);
        self
    }

    pub fn with_feature_check(mut self, check: Arc<dyn FeatureCheck>) -> Self {
        self.criteria = CriteriaValidator::new(Some(check));
        self
    }

    /// Decide which validation applies to `step`.
    pub fn resolve(&self, step: &Step) -> StepKind {
        if let Some(validator) = self.registered.get(&step.index) {
            return StepKind::Registered(validator.clone());
        }
        if !step.criteria.is_empty() {
            return StepKind::Criteria;
        }
        match infer_topic(&step.instruction) {
            Some(path) => StepKind::Inferred(path),
            None => StepKind::Unchecked,
        }
    }

    /// Validate `step` with an already resolved kind.
    pub async fn validate(&self, kind: &StepKind, step: &Step) -> ValidationReport {
        match kind {
            StepKind::Registered(validator) => validator.validate(&self.root, step).await,
            StepKind::Criteria => self.criteria.validate(&self.root, step).await,
            StepKind::Inferred(path) => {
                TopicValidator::new(path.as_str())
                    .validate(&self.root, step)
                    .await
            }
            StepKind::Unchecked => ValidationReport::pass("unchecked"),
        }
    }
}

fn criterion_label(criterion: &Criterion) -> String {
    match criterion {
        Criterion::FileExists { path } => format!("file_exists({path})"),
        Criterion::FileContains { path, .. } => format!("file_contains({path})"),
        Criterion::AnyFileContains { extension, .. } => {
            format!("any_file_contains(*.{extension})")
        }
        Criterion::MinMatches { extension, min, .. } => {
            format!("min_matches(*.{extension}, {min})")
        }
        Criterion::ForbidPattern { extension, .. } => format!("forbid_pattern(*.{extension})"),
        Criterion::Feature { name } => format!("feature({name})"),
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&&*name)
}

/// Readable text files under `root` with the given extension, sorted by path.
fn files_with_extension(root: &Path, extension: &str) -> Vec<(PathBuf, String)> {
    let extension = extension.trim_start_matches('.');
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some(extension))
        .filter_map(|e| {
            let text = std::fs::read_to_string(e.path()).ok()?;
            let rel = e.path().strip_prefix(root).unwrap_or(e.path()).to_path_buf();
            Some((rel, text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct AlwaysFeature(bool);

    #[async_trait]
    impl FeatureCheck for AlwaysFeature {
        async fn check(&self, _root: &Path, _feature: &str) -> Result<bool> {
            Ok(self.0)
        }
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib/screens")).unwrap();
        fs::create_dir_all(dir.path().join("build")).unwrap();
        fs::write(
            dir.path().join("lib/main.dart"),
            "import 'screens/cart.dart';\nvoid main() {}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("lib/screens/cart.dart"),
            "class Cart extends StatelessWidget {}\nclass CartItem extends StatelessWidget {}\n",
        )
        .unwrap();
        fs::write(dir.path().join("build/generated.dart"), "print('debug');\n").unwrap();
        dir
    }

    #[test]
    fn test_infer_topic() {
        assert_eq!(
            infer_topic("Create lib/screens/cart.dart with a Cart widget"),
            Some("lib/screens/cart.dart".to_string())
        );
        assert_eq!(infer_topic("Edit pubspec.yaml to add http"), Some("pubspec.yaml".to_string()));
        assert_eq!(
            infer_topic("Update the file `ios/Runner/Info.plist`."),
            Some("ios/Runner/Info.plist".to_string())
        );
        assert_eq!(infer_topic("Improve performance"), None);
    }

    #[test]
    fn test_infer_topic_skips_abbreviations() {
        assert_eq!(infer_topic("Update e.g. the list of items"), None);
        assert_eq!(infer_topic("Edit i.e. the header"), None);
        assert_eq!(
            infer_topic("Update e.g. the list, then create lib/orders.dart"),
            Some("lib/orders.dart".to_string())
        );
        assert_eq!(infer_topic("Create src/a.rs"), Some("src/a.rs".to_string()));
    }

    #[test]
    fn test_resolve_precedence() {
        let registry = ValidatorRegistry::new("/tmp")
            .register(1, Arc::new(TopicValidator::new("x.txt")));

        let registered = Step::new(1, "Create a.rs");
        assert!(matches!(registry.resolve(&registered), StepKind::Registered(_)));

        let criteria = Step::new(2, "Create a.rs").with_criterion(Criterion::FileExists {
            path: "a.rs".to_string(),
        });
        assert!(matches!(registry.resolve(&criteria), StepKind::Criteria));

        let inferred = Step::new(3, "Create src/a.rs");
        assert_eq!(registry.resolve(&inferred).label(), "inferred:src/a.rs");

        let unchecked = Step::new(4, "Refactor the code");
        assert!(matches!(registry.resolve(&unchecked), StepKind::Unchecked));
    }

    #[tokio::test]
    async fn test_criteria_all_kinds() {
        let dir = tree();
        let validator = CriteriaValidator::new(Some(Arc::new(AlwaysFeature(true))));
        let criteria = vec![
            Criterion::FileExists {
                path: "lib/main.dart".to_string(),
            },
            Criterion::FileContains {
                path: "lib/main.dart".to_string(),
                needle: "screens/cart.dart".to_string(),
            },
            Criterion::AnyFileContains {
                extension: "dart".to_string(),
                needle: "class Cart".to_string(),
            },
            Criterion::MinMatches {
                extension: "dart".to_string(),
                pattern: r"extends\s+StatelessWidget".to_string(),
                min: 2,
            },
            Criterion::ForbidPattern {
                extension: "dart".to_string(),
                pattern: r"print\(".to_string(),
            },
            Criterion::Feature {
                name: "cart".to_string(),
            },
        ];
        let results = validator.evaluate(dir.path(), &criteria).await;
        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.passed), "{results:?}");
    }

    #[tokio::test]
    async fn test_failed_criteria_are_listed() {
        let dir = tree();
        let step = Step::new(1, "Add checkout")
            .with_criterion(Criterion::FileExists {
                path: "lib/checkout.dart".to_string(),
            })
            .with_criterion(Criterion::MinMatches {
                extension: "dart".to_string(),
                pattern: "Checkout".to_string(),
                min: 1,
            })
            .with_criterion(Criterion::Feature {
                name: "checkout".to_string(),
            });

        let registry = ValidatorRegistry::new(dir.path());
        let kind = registry.resolve(&step);
        let report = registry.validate(&kind, &step).await;

        assert!(!report.passed);
        assert_eq!(report.failures().len(), 3);
        assert!(report.diagnostics().contains("no feature check configured"));
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_a_failed_criterion() {
        let dir = tree();
        let results = CriteriaValidator::default()
            .evaluate(
                dir.path(),
                &[Criterion::ForbidPattern {
                    extension: "dart".to_string(),
                    pattern: "(".to_string(),
                }],
            )
            .await;
        assert!(!results[0].passed);
        assert!(results[0].detail.contains("invalid pattern"));
    }

    #[tokio::test]
    async fn test_inferred_and_unchecked() {
        let dir = tree();
        let registry = ValidatorRegistry::new(dir.path());

        let present = Step::new(1, "Create lib/main.dart");
        let kind = registry.resolve(&present);
        assert!(registry.validate(&kind, &present).await.passed);

        let missing = Step::new(2, "Create lib/orders.dart");
        let kind = registry.resolve(&missing);
        assert!(!registry.validate(&kind, &missing).await.passed);

        let vague = Step::new(3, "Polish the UI");
        let kind = registry.resolve(&vague);
        assert!(registry.validate(&kind, &vague).await.passed);
    }
}
