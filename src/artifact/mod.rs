//! Generated artifacts: the lenient parsed document, the validated artifact,
//! and the merged output set.

pub mod repair;
pub mod styles;
pub mod validate;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use repair::{recover, recover_document, recover_where, RepairError, RepairStep, Repaired};
pub use styles::{sanitize_colors, sanitize_colors_into, SanitizeReport};
pub use validate::{IssueCode, Severity, ValidationIssue, ValidationReport, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Site shell: shared chrome, stylesheet, entry page.
    Foundation,
    /// One content page, rendered as a body region.
    Page,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(alias = "name", alias = "filename")]
    pub path: String,
    pub content: String,
}

/// Files as the model sent them: a `{path: content}` object or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileSet {
    Map(BTreeMap<String, String>),
    List(Vec<FileEntry>),
}

impl FileSet {
    pub fn len(&self) -> usize {
        match self {
            FileSet::Map(m) => m.len(),
            FileSet::List(l) => l.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Later duplicates in a list overwrite earlier ones.
    pub fn into_map(self) -> BTreeMap<String, String> {
        match self {
            FileSet::Map(m) => m,
            FileSet::List(l) => l.into_iter().map(|f| (f.path, f.content)).collect(),
        }
    }
}

/// A model response after repair, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    #[serde(default)]
    pub files: Option<FileSet>,
    #[serde(default, alias = "main", alias = "primary")]
    pub entry: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl GeneratedDocument {
    /// True when the value carries a `files` field; an empty object does not.
    pub fn is_structured(&self) -> bool {
        self.files.is_some()
    }
}

/// A validated artifact produced by one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedArtifact {
    pub task_id: String,
    pub backend_id: String,
    pub kind: ArtifactKind,
    pub files: BTreeMap<String, String>,
    pub entry: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub warnings: Vec<ValidationIssue>,
    pub repair_step: RepairStep,
}

/// Final merged output, path → content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub files: BTreeMap<String, String>,
    pub entry: Option<String>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an artifact in. Existing files win; returns the paths that
    /// collided and were kept as they were.
    pub fn merge(&mut self, artifact: &ParsedArtifact) -> Vec<String> {
        let mut conflicts = Vec::new();
        for (path, content) in &artifact.files {
            if self.files.contains_key(path) {
                conflicts.push(path.clone());
                continue;
            }
            self.files.insert(path.clone(), content.clone());
        }
        if self.entry.is_none() && artifact.kind == ArtifactKind::Foundation {
            self.entry = Some(artifact.entry.clone());
        }
        conflicts
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fileset_accepts_map_and_list() {
        let map: GeneratedDocument =
            serde_json::from_str(r#"{"files": {"a.html": "x"}, "main": "a.html"}"#).unwrap();
        let list: GeneratedDocument = serde_json::from_str(
            r#"{"files": [{"path": "a.html", "content": "x"}], "entry": "a.html"}"#,
        )
        .unwrap();
        assert_eq!(map.entry.as_deref(), Some("a.html"));
        assert_eq!(
            map.files.unwrap().into_map(),
            list.files.unwrap().into_map()
        );
    }

    fn artifact(kind: ArtifactKind, files: &[(&str, &str)]) -> ParsedArtifact {
        ParsedArtifact {
            task_id: "t".into(),
            backend_id: "b".into(),
            kind,
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            entry: files[0].0.to_string(),
            notes: None,
            warnings: vec![],
            repair_step: RepairStep::Direct,
        }
    }

    #[test]
    fn first_writer_wins_on_merge() {
        let mut set = ArtifactSet::new();
        set.merge(&artifact(
            ArtifactKind::Foundation,
            &[("index.html", "shell"), ("styles.css", "root")],
        ));
        let conflicts = set.merge(&artifact(
            ArtifactKind::Page,
            &[("about.html", "about"), ("styles.css", "override")],
        ));
        assert_eq!(conflicts, vec!["styles.css".to_string()]);
        assert_eq!(set.files["styles.css"], "root");
        assert_eq!(set.entry.as_deref(), Some("index.html"));
        assert_eq!(set.len(), 3);
    }
}
