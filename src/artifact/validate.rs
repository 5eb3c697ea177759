//! Structural and content invariants for generated artifacts.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{styles, ArtifactKind, GeneratedDocument};

static DOCUMENT_WRAPPER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(!doctype|html|head|body)[\s>/]").expect("Invalid document wrapper regex")
});

static CHROME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(header|footer)[\s>/]").expect("Invalid chrome regex"));

static NON_VISIBLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>|<!--.*?-->")
        .expect("Invalid non-visible block regex")
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("Invalid tag regex"));

static TEXT_NODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r">\s*(undefined|null)\s*<").expect("Invalid text node regex"));

static ATTR_VALUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"=\s*(?:"\s*(?:undefined|null)\s*"|'\s*(?:undefined|null)\s*')"#)
        .expect("Invalid attribute value regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    MissingFiles,
    MissingEntry,
    UnknownEntry,
    NestedDocument,
    DuplicatedChrome,
    LiteralColor,
    ThinBody,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: IssueCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn error(code: IssueCode, path: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            path: path.map(str::to_string),
            message: message.into(),
        }
    }

    fn warning(code: IssueCode, path: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            path: path.map(str::to_string),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn has(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }

    /// One-line summary of the errors, for logs and retry prompts.
    pub fn error_summary(&self) -> String {
        self.errors()
            .map(|i| match &i.path {
                Some(p) => format!("{p}: {}", i.message),
                None => i.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validator {
    /// Page bodies with less visible text than this get a warning.
    pub min_body_chars: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            min_body_chars: 120,
        }
    }
}

fn is_html(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".htm")
}

/// Visible text of an HTML fragment, whitespace collapsed.
pub fn visible_text(html: &str) -> String {
    let without_blocks = NON_VISIBLE_RE.replace_all(html, " ");
    let without_tags = TAG_RE.replace_all(&without_blocks, " ");
    without_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl Validator {
    pub fn new(min_body_chars: usize) -> Self {
        Self { min_body_chars }
    }

    pub fn validate_document(&self, kind: ArtifactKind, doc: &GeneratedDocument) -> ValidationReport {
        let files = doc
            .files
            .clone()
            .map(|f| f.into_map())
            .unwrap_or_default();
        self.validate(kind, &files, doc.entry.as_deref())
    }

    pub fn validate(
        &self,
        kind: ArtifactKind,
        files: &BTreeMap<String, String>,
        entry: Option<&str>,
    ) -> ValidationReport {
        let mut issues = Vec::new();

        if files.is_empty() {
            issues.push(ValidationIssue::error(
                IssueCode::MissingFiles,
                None,
                "no files in response",
            ));
        }
        match entry.map(str::trim).filter(|e| !e.is_empty()) {
            None => issues.push(ValidationIssue::error(
                IssueCode::MissingEntry,
                None,
                "no entry file named",
            )),
            Some(e) if !files.is_empty() && !files.contains_key(e) => {
                issues.push(ValidationIssue::error(
                    IssueCode::UnknownEntry,
                    Some(e),
                    "entry is not among the files",
                ))
            }
            Some(_) => {}
        }

        for (path, content) in files {
            let trimmed = content.trim();
            if trimmed == "undefined" || trimmed == "null" {
                issues.push(ValidationIssue::error(
                    IssueCode::Placeholder,
                    Some(path),
                    format!("file content is the placeholder `{trimmed}`"),
                ));
                continue;
            }
            if !is_html(path) {
                continue;
            }

            if let Some(m) = TEXT_NODE_RE.captures(content).and_then(|c| c.get(1)) {
                issues.push(ValidationIssue::error(
                    IssueCode::Placeholder,
                    Some(path),
                    format!("text node is the placeholder `{}`", m.as_str()),
                ));
            }
            if ATTR_VALUE_RE.is_match(content) {
                issues.push(ValidationIssue::error(
                    IssueCode::Placeholder,
                    Some(path),
                    "attribute value is a placeholder",
                ));
            }

            if kind == ArtifactKind::Page {
                self.check_page_body(path, content, &mut issues);
            }
        }

        for (path, m) in styles::scan_files(files) {
            issues.push(ValidationIssue::warning(
                IssueCode::LiteralColor,
                Some(&path),
                format!("literal color `{}` outside :root", m.literal),
            ));
        }

        ValidationReport { issues }
    }

    fn check_page_body(&self, path: &str, content: &str, issues: &mut Vec<ValidationIssue>) {
        if let Some(c) = DOCUMENT_WRAPPER_RE.captures(content) {
            issues.push(ValidationIssue::error(
                IssueCode::NestedDocument,
                Some(path),
                format!("body region contains a document wrapper `<{}`", &c[1]),
            ));
        }
        if let Some(c) = CHROME_RE.captures(content) {
            issues.push(ValidationIssue::error(
                IssueCode::DuplicatedChrome,
                Some(path),
                format!("body region repeats shared chrome `<{}`", &c[1]),
            ));
        }
        let visible = visible_text(content).chars().count();
        if visible < self.min_body_chars {
            issues.push(ValidationIssue::warning(
                IssueCode::ThinBody,
                Some(path),
                format!("{visible} visible chars (< {})", self.min_body_chars),
            ));
        }
    }
}
