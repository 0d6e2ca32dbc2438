//! Typed engine results and request shapes

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{EngineError, ErrorKind};

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A single string or a list of strings, normalised to a list
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s]),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Ok(other.to_string()),
            })
            .collect(),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or list, found {other}"
        ))),
    }
}

/// Source position: `[line, col]` or `[line, col, endLine, endCol]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Place {
    pub line: u32,
    pub character: u32,
    pub end: Option<(u32, u32)>,
}

impl Place {
    pub fn new(line: u32, character: u32) -> Self {
        Self {
            line,
            character,
            end: None,
        }
    }

    pub fn with_end(mut self, line: u32, character: u32) -> Self {
        self.end = Some((line, character));
        self
    }
}

impl Serialize for Place {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut values = vec![self.line, self.character];
        if let Some((line, character)) = self.end {
            values.extend([line, character]);
        }
        values.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Place {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<u32>::deserialize(deserializer)?;
        match values.as_slice() {
            [line, character] => Ok(Place::new(*line, *character)),
            [line, character, end_line, end_character] => {
                Ok(Place::new(*line, *character).with_end(*end_line, *end_character))
            }
            other => Err(D::Error::custom(format!(
                "place must have 2 or 4 elements, found {}",
                other.len()
            ))),
        }
    }
}

/// A generated proof obligation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TccDescriptor {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub definition: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub comment: Vec<String>,
    #[serde(default)]
    pub from_decl: Option<String>,
    #[serde(default)]
    pub proved: Option<bool>,
    #[serde(default)]
    pub theory: Option<String>,
    /// Pretty-printed obligation as the engine renders it in `.tccs` files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl TccDescriptor {
    /// Text written to the `.tccs` artifact for this obligation
    pub fn artifact_text(&self) -> String {
        if let Some(content) = &self.content {
            return content.clone();
        }
        let mut text = String::new();
        for line in &self.comment {
            for l in line.lines() {
                text.push_str("  % ");
                text.push_str(l);
                text.push('\n');
            }
        }
        text.push_str(&format!("  {}: OBLIGATION\n", self.id));
        text.push_str(&self.definition);
        if !self.definition.ends_with('\n') {
            text.push('\n');
        }
        text.push('\n');
        text
    }
}

/// One formula of a sequent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequentFormula {
    #[serde(default, deserialize_with = "string_or_list")]
    pub labels: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub changed: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub formula: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Sequent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub antecedents: Vec<SequentFormula>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub succedents: Vec<SequentFormula>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hidden_antecedents: Vec<SequentFormula>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hidden_succedents: Vec<SequentFormula>,
}

/// Prover state after a proof command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProofState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub current_goal: Option<String>,
    #[serde(default)]
    pub tree_delta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary: Option<String>,
    /// Set when the proof attempt finished, e.g. `proved`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sequent: Sequent,
}

/// Where a name is used and where it is declared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NameInfo {
    pub id: String,
    #[serde(default)]
    pub place: Option<Place>,
    #[serde(default)]
    pub decl: Option<String>,
    #[serde(default)]
    pub decl_file: Option<String>,
    #[serde(default)]
    pub decl_place: Option<Place>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theory: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// A theory with its top-level declarations, as returned by parse-file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTheory {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub decls: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VersionInfo {
    pub pvs_version: String,
    pub lisp_version: Option<String>,
}

/// Success payload; its shape depends on the command family
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EnginePayload {
    Unit,
    Text(String),
    Theories(Vec<ParsedTheory>),
    Tccs(Vec<TccDescriptor>),
    ProofState(Box<ProofState>),
    Names(Vec<NameInfo>),
    Version(VersionInfo),
    Value(Value),
}

/// A failure reported by the engine or detected while talking to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Verbatim engine text describing the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// 1-based line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<u32>,
    /// Restart number the engine offered for returning to top level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_option: Option<u32>,
}

impl EngineFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
            file: None,
            line: None,
            character: None,
            restart_option: None,
        }
    }
}

impl From<&EngineError> for EngineFailure {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Reported(failure) => (**failure).clone(),
            other => EngineFailure::new(other.kind(), other.to_string()),
        }
    }
}

/// Parsed outcome of one command. Callers check `error` first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineResponse {
    pub res: Option<EnginePayload>,
    pub error: Option<EngineFailure>,
    pub raw: String,
}

impl EngineResponse {
    pub fn success(res: EnginePayload, raw: impl Into<String>) -> Self {
        Self {
            res: Some(res),
            error: None,
            raw: raw.into(),
        }
    }

    pub fn failure(error: EngineFailure, raw: impl Into<String>) -> Self {
        Self {
            res: None,
            error: Some(error),
            raw: raw.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Obligations collected for one theory
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TheoryTccs {
    pub theory_name: String,
    pub file_name: String,
    pub tccs: Vec<TccDescriptor>,
    /// Present when the obligations for this theory could not be retrieved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineFailure>,
}

/// Per-theory obligations keyed by theory name
pub type TccMap = BTreeMap<String, TheoryTccs>;

/// Logical request consumed by the facade and coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvsRequest {
    pub file_name: String,
    #[serde(default = "default_extension")]
    pub file_extension: String,
    pub context_folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theory_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula_name: Option<String>,
}

fn default_extension() -> String {
    ".pvs".to_string()
}

impl PvsRequest {
    pub fn new(context_folder: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            file_extension: default_extension(),
            context_folder: context_folder.into(),
            theory_name: None,
            formula_name: None,
        }
    }

    pub fn with_theory(mut self, theory_name: impl Into<String>) -> Self {
        self.theory_name = Some(theory_name.into());
        self
    }

    pub fn with_formula(mut self, formula_name: impl Into<String>) -> Self {
        self.formula_name = Some(formula_name.into());
        self
    }

    /// Absolute path of the file on disk
    pub fn file_path(&self) -> PathBuf {
        let ext = if self.file_extension.starts_with('.') || self.file_extension.is_empty() {
            self.file_extension.clone()
        } else {
            format!(".{}", self.file_extension)
        };
        Path::new(&self.context_folder).join(format!("{}{}", self.file_name, ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_place_serializes_as_array() {
        assert_eq!(serde_json::to_value(Place::new(3, 4)).unwrap(), json!([3, 4]));
        let place: Place = serde_json::from_value(json!([3, 4, 3, 9])).unwrap();
        assert_eq!(place.end, Some((3, 9)));
        assert!(serde_json::from_value::<Place>(json!([1])).is_err());
    }

    #[test]
    fn test_tcc_descriptor_accepts_lisp_shapes() {
        let tcc: TccDescriptor = serde_json::from_value(json!({
            "id": "foo_TCC1",
            "definition": "FORALL (x: nat): x + 1 > 0",
            "comment": "% Subtype TCC generated (at line 5, column 2) for x + 1",
            "from-decl": "foo",
            "proved": null,
            "theory": "foo_th"
        }))
        .unwrap();
        assert_eq!(tcc.comment.len(), 1);
        assert_eq!(tcc.proved, None);
        assert_eq!(tcc.from_decl.as_deref(), Some("foo"));

        let text = tcc.artifact_text();
        assert!(text.contains("foo_TCC1: OBLIGATION"));
        assert!(text.contains("FORALL (x: nat): x + 1 > 0"));
    }

    #[test]
    fn test_sequent_formula_null_fields() {
        let f: SequentFormula =
            serde_json::from_value(json!({"labels": null, "changed": null, "formula": "x > 0"}))
                .unwrap();
        assert!(f.labels.is_empty());
        assert!(!f.changed);
    }

    #[test]
    fn test_payload_unit_serializes_as_null() {
        assert_eq!(serde_json::to_value(EnginePayload::Unit).unwrap(), Value::Null);
    }

    #[test]
    fn test_request_file_path() {
        let req = PvsRequest::new("/work/ctx", "foo");
        assert_eq!(req.file_path(), PathBuf::from("/work/ctx/foo.pvs"));

        let req: PvsRequest = serde_json::from_value(json!({
            "fileName": "bar",
            "fileExtension": "hpvs",
            "contextFolder": "/work/ctx",
            "theoryName": "bar_th"
        }))
        .unwrap();
        assert_eq!(req.file_path(), PathBuf::from("/work/ctx/bar.hpvs"));
        assert_eq!(req.theory_name.as_deref(), Some("bar_th"));
    }
}
