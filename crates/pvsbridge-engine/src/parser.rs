//! Reply parser: delimited engine text to typed results
//!
//! Each [`CommandFamily`] has one extraction rule. Error markers are checked
//! first for every family; the success value is the last complete datum of
//! the reply, with any progress chatter before it kept only in `raw`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::command::CommandFamily;
use crate::error::{EngineError, ErrorKind, Result};
use crate::sexpr;
use crate::types::{
    EngineFailure, EnginePayload, EngineResponse, NameInfo, ParsedTheory, ProofState,
    TccDescriptor, VersionInfo,
};

static PVS_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<pvserror msg="(?P<msg>[^"]*)">(?P<body>[\s\S]*?)</pvserror>"#)
        .expect("valid regex")
});
static LISP_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Error:\s*(?P<msg>.*?)\s*$").expect("valid regex"));
static IN_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"In file (?P<file>\S+) \(line (?P<line>\d+), col (?P<col>\d+)\)")
        .expect("valid regex")
});
static LINE_COL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\(?line (?P<line>\d+),\s*col(?:umn)? (?P<col>\d+)\)?").expect("valid regex")
});
static RESTART_ACTIONS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Restart actions").expect("valid regex"));
static TOP_LEVEL_RESTART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?P<n>\d+): Return to Top Level").expect("valid regex")
});
static EVAL_RESULT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"==>\s*(?P<value>[\s\S]*?)\s*\z").expect("valid regex"));

/// Whether the text carries an engine-reported error
pub fn has_error_marker(text: &str) -> bool {
    text.contains("<pvserror") || LISP_ERROR.is_match(text)
}

/// Extract a structured failure from engine text, if it reports one
pub fn extract_error(text: &str) -> Option<EngineFailure> {
    if let Some(caps) = PVS_ERROR.captures(text) {
        let body = caps["body"].trim();
        let detail = body
            .strip_prefix('"')
            .and_then(|b| b.strip_suffix('"'))
            .unwrap_or(body)
            .to_string();
        let mut failure = EngineFailure::new(ErrorKind::EngineReported, &caps["msg"]);
        if let Some(loc) = IN_FILE.captures(text) {
            failure.file = Some(loc["file"].to_string());
            failure.line = loc["line"].parse().ok();
            failure.character = loc["col"].parse().ok();
        } else if let Some(loc) = LINE_COL.captures(&detail) {
            failure.line = loc["line"].parse().ok();
            failure.character = loc["col"].parse().ok();
        }
        if !detail.is_empty() {
            failure.data = Some(detail);
        }
        return Some(failure);
    }

    let caps = LISP_ERROR.captures(text)?;
    let mut failure = EngineFailure::new(ErrorKind::EngineReported, &caps["msg"]);
    if let Some(loc) = IN_FILE.captures(text) {
        failure.file = Some(loc["file"].to_string());
        failure.line = loc["line"].parse().ok();
        failure.character = loc["col"].parse().ok();
    }
    failure.restart_option = TOP_LEVEL_RESTART
        .captures(text)
        .and_then(|c| c["n"].parse().ok());
    let detail_end = RESTART_ACTIONS
        .find(text)
        .map(|m| m.start())
        .unwrap_or(text.len());
    let detail = text[..detail_end].trim();
    if !detail.is_empty() {
        failure.data = Some(detail.to_string());
    }
    Some(failure)
}

/// The last complete JSON or Lisp value in the text, if any
pub fn last_datum(text: &str) -> Option<Value> {
    let body = text.trim_end();
    if body.is_empty() {
        return None;
    }
    let mut starts: Vec<usize> = vec![0];
    starts.extend(body.match_indices('\n').map(|(i, _)| i + 1));
    for start in starts.into_iter().rev() {
        let candidate = &body[start..];
        if candidate.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Some(value);
        }
        if let Ok(datum) = sexpr::read_one(candidate) {
            return Some(datum.to_json());
        }
    }
    None
}

/// Stateless dispatcher from command family to extraction rule
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyParser;

impl ReplyParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a reply for a family identified by its head symbol.
    ///
    /// Fails closed on heads that do not name a known family.
    pub fn parse_named(&self, head: &str, raw: &str) -> Result<EngineResponse> {
        let family = CommandFamily::from_head(head, None)
            .ok_or_else(|| EngineError::UnrecognizedCommand(head.to_string()))?;
        Ok(self.parse(family, raw))
    }

    /// Parse the delimited text of one reply
    pub fn parse(&self, family: CommandFamily, raw: &str) -> EngineResponse {
        if let Some(failure) = extract_error(raw) {
            return EngineResponse::failure(failure, raw);
        }
        match self.extract(family, raw) {
            Ok(payload) => EngineResponse::success(payload, raw),
            Err(message) => EngineResponse::failure(
                EngineFailure::new(
                    ErrorKind::Protocol,
                    format!("unexpected {family} reply: {message}"),
                ),
                raw,
            ),
        }
    }

    fn extract(&self, family: CommandFamily, raw: &str) -> std::result::Result<EnginePayload, String> {
        match family {
            CommandFamily::Lisp => Ok(EnginePayload::Text(raw.trim().to_string())),
            CommandFamily::EvalExpression => Ok(EnginePayload::Text(
                EVAL_RESULT
                    .captures(raw)
                    .map(|c| c["value"].to_string())
                    .unwrap_or_else(|| raw.trim().to_string()),
            )),
            CommandFamily::ChangeContext | CommandFamily::CurrentContext => {
                Ok(match last_datum(raw) {
                    Some(Value::String(path)) => EnginePayload::Text(path),
                    _ => EnginePayload::Unit,
                })
            }
            CommandFamily::DisableGcPrintout
            | CommandFamily::EmacsInterface
            | CommandFamily::LoadAttachments
            | CommandFamily::EvaluationMode
            | CommandFamily::ClearTheories => Ok(match last_datum(raw) {
                None | Some(Value::Null) | Some(Value::Bool(_)) => EnginePayload::Unit,
                Some(value) => EnginePayload::Value(value),
            }),
            CommandFamily::ParseFile => Ok(match last_datum(raw) {
                None | Some(Value::Null) | Some(Value::Bool(_)) | Some(Value::String(_)) => {
                    EnginePayload::Unit
                }
                Some(value @ Value::Array(_)) => {
                    match serde_json::from_value::<Vec<ParsedTheory>>(value.clone()) {
                        Ok(theories) => EnginePayload::Theories(theories),
                        Err(_) => EnginePayload::Value(value),
                    }
                }
                Some(value) => EnginePayload::Value(value),
            }),
            CommandFamily::TypecheckFile => Ok(match last_datum(raw) {
                None | Some(Value::Null) | Some(Value::Bool(_)) | Some(Value::String(_)) => {
                    EnginePayload::Unit
                }
                Some(value) => EnginePayload::Value(value),
            }),
            CommandFamily::ShowTccs => {
                let tccs: Vec<TccDescriptor> = list_of(last_datum(raw))?;
                Ok(EnginePayload::Tccs(tccs))
            }
            CommandFamily::ProveFormula | CommandFamily::ProofCommand => {
                Ok(EnginePayload::ProofState(Box::new(proof_state(raw)?)))
            }
            CommandFamily::FindDeclaration
            | CommandFamily::NamesInfo
            | CommandFamily::ListDeclarations => {
                Ok(EnginePayload::Names(name_infos(last_datum(raw))?))
            }
            CommandFamily::GetVersion => version_info(raw).map(EnginePayload::Version),
        }
    }
}

/// A list of records; null is empty and a single object is a list of one
fn list_of<T: DeserializeOwned>(datum: Option<Value>) -> std::result::Result<Vec<T>, String> {
    let items = match datum {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(object @ Value::Object(_)) => vec![object],
        Some(other) => return Err(format!("expected a list, found {other}")),
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(|e| e.to_string()))
        .collect()
}

fn proof_state(raw: &str) -> std::result::Result<ProofState, String> {
    match last_datum(raw) {
        Some(value @ Value::Object(_)) => serde_json::from_value(value).map_err(|e| e.to_string()),
        _ if raw.contains("Q.E.D.") => Ok(ProofState {
            status: Some("proved".to_string()),
            commentary: Some(raw.trim().to_string()),
            ..ProofState::default()
        }),
        _ => Ok(ProofState {
            commentary: Some(raw.trim().to_string()),
            ..ProofState::default()
        }),
    }
}

/// Normalise declaration lookups to [`NameInfo`].
///
/// find-declaration records (`declname`, `theoryid`, `filename`,
/// `decl-ppstring`) and list-declarations maps keyed by symbol are both
/// accepted.
fn name_infos(datum: Option<Value>) -> std::result::Result<Vec<NameInfo>, String> {
    let items = match datum {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) if map.contains_key("id") || map.contains_key("declname") => {
            vec![Value::Object(map)]
        }
        Some(Value::Object(map)) => map
            .into_iter()
            .map(|(key, mut value)| {
                if let Value::Object(entry) = &mut value {
                    entry.entry("id").or_insert(Value::String(key));
                }
                value
            })
            .collect(),
        Some(other) => return Err(format!("expected declarations, found {other}")),
    };
    items.into_iter().map(normalize_name_info).collect()
}

fn normalize_name_info(item: Value) -> std::result::Result<NameInfo, String> {
    let mut map = match item {
        Value::Object(map) => map,
        other => return Err(format!("expected a declaration record, found {other}")),
    };
    if let Some(declname) = map.remove("declname") {
        map.entry("id").or_insert(declname);
        if let Some(place) = map.get("place").cloned() {
            map.entry("decl-place").or_insert(place);
        }
        for (from, to) in [
            ("theoryid", "theory"),
            ("filename", "decl-file"),
            ("decl-ppstring", "decl"),
        ] {
            if let Some(value) = map.remove(from) {
                map.entry(to).or_insert(value);
            }
        }
    }
    serde_json::from_value(Value::Object(map)).map_err(|e| e.to_string())
}

fn version_info(raw: &str) -> std::result::Result<VersionInfo, String> {
    match last_datum(raw) {
        Some(Value::Array(items)) => {
            let strings: Vec<String> = items
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect();
            let pvs_version = strings
                .first()
                .cloned()
                .ok_or_else(|| "empty version list".to_string())?;
            let lisp_version = strings
                .get(2)
                .or_else(|| strings.get(1))
                .filter(|s| !s.is_empty())
                .cloned();
            Ok(VersionInfo {
                pvs_version,
                lisp_version,
            })
        }
        Some(Value::String(pvs_version)) => Ok(VersionInfo {
            pvs_version,
            lisp_version: None,
        }),
        Some(Value::Object(map)) => serde_json::from_value(Value::Object(map)).map_err(|e| e.to_string()),
        other => Err(format!("no version information in {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn parse(family: CommandFamily, raw: &str) -> EngineResponse {
        ReplyParser::new().parse(family, raw)
    }

    #[test]
    fn test_raw_mode_error_block() {
        let raw = "Parsing test\n<pvserror msg=\"Parser error\">\n\"Found '-' when expecting 'END' (line 11, col 9)\"\n</pvserror>\n";
        let response = parse(CommandFamily::TypecheckFile, raw);
        let error = response.error.expect("error");
        assert_eq!(error.kind, ErrorKind::EngineReported);
        assert_eq!(error.message, "Parser error");
        assert_eq!(
            error.data.as_deref(),
            Some("Found '-' when expecting 'END' (line 11, col 9)")
        );
        assert_eq!(error.line, Some(11));
        assert_eq!(error.character, Some(9));
        assert!(response.res.is_none());
        assert_eq!(response.raw, raw);
    }

    #[test]
    fn test_emacs_mode_error_block() {
        let raw = "Parsing test\nFound '-' when expecting 'END'\nIn file test (line 11, col 9)\nError: Parse error\nRestart actions (select using :continue):\n 0: Return to Top Level (an \"abort\" restart).\n 1: Abort entirely from this (lisp) process.\n";
        let error = parse(CommandFamily::ParseFile, raw).error.expect("error");
        assert_eq!(error.message, "Parse error");
        assert_eq!(error.file.as_deref(), Some("test"));
        assert_eq!(error.line, Some(11));
        assert_eq!(error.character, Some(9));
        assert_eq!(error.restart_option, Some(0));
        let data = error.data.unwrap();
        assert!(data.contains("Found '-' when expecting 'END'"));
        assert!(!data.contains("Restart actions"));
    }

    #[test]
    fn test_show_tccs_from_lisp_plists() {
        let raw = "foo_th typechecked in 0.1s\n((:id \"foo_TCC1\" :definition \"FORALL (x: nat):\n  x + 1 > 0\" :comment (\"% Subtype TCC\") :from-decl \"foo\" :proved nil :theory \"foo_th\"))\n";
        let response = parse(CommandFamily::ShowTccs, raw);
        match response.res {
            Some(EnginePayload::Tccs(tccs)) => {
                assert_eq!(tccs.len(), 1);
                assert_eq!(tccs[0].id, "foo_TCC1");
                assert_eq!(tccs[0].definition, "FORALL (x: nat):\n  x + 1 > 0");
                assert_eq!(tccs[0].theory.as_deref(), Some("foo_th"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_show_tccs_from_json_and_nil() {
        let raw = r#"[{"id": "t1", "definition": "x > 0", "comment": [], "from-decl": "d", "proved": true, "theory": "th"}]"#;
        assert!(matches!(
            parse(CommandFamily::ShowTccs, raw).res,
            Some(EnginePayload::Tccs(ref t)) if t.len() == 1 && t[0].proved == Some(true)
        ));
        assert_eq!(
            parse(CommandFamily::ShowTccs, "NIL\n").res,
            Some(EnginePayload::Tccs(vec![]))
        );
    }

    #[test]
    fn test_show_tccs_bad_shape_is_protocol_error() {
        let response = parse(CommandFamily::ShowTccs, "42\n");
        assert_eq!(response.error.unwrap().kind, ErrorKind::Protocol);
    }

    #[test]
    fn test_proof_state() {
        let raw = json!({
            "label": "lemma1",
            "current-goal": "lemma1",
            "tree-delta": null,
            "sequent": {
                "succedents": [{"labels": ["1"], "changed": true, "formula": "x > 0"}]
            }
        })
        .to_string();
        match parse(CommandFamily::ProveFormula, &raw).res {
            Some(EnginePayload::ProofState(state)) => {
                assert_eq!(state.current_goal.as_deref(), Some("lemma1"));
                assert_eq!(state.sequent.succedents[0].formula, "x > 0");
                assert!(state.sequent.antecedents.is_empty());
            }
            other => panic!("unexpected payload {other:?}"),
        }

        match parse(CommandFamily::ProofCommand, "Q.E.D.\n").res {
            Some(EnginePayload::ProofState(state)) => {
                assert_eq!(state.status.as_deref(), Some("proved"))
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_find_declaration_is_normalized() {
        let raw = "((:declname \"foo\" :type \"const\" :theoryid \"foo_th\" :filename \"/ctx/foo.pvs\" :place (3 2 3 20) :decl-ppstring \"foo: nat = 3\"))";
        match parse(CommandFamily::FindDeclaration, raw).res {
            Some(EnginePayload::Names(names)) => {
                assert_eq!(names.len(), 1);
                let n = &names[0];
                assert_eq!(n.id, "foo");
                assert_eq!(n.decl.as_deref(), Some("foo: nat = 3"));
                assert_eq!(n.decl_file.as_deref(), Some("/ctx/foo.pvs"));
                assert_eq!(n.theory.as_deref(), Some("foo_th"));
                assert_eq!(n.decl_place.map(|p| p.line), Some(3));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_names_info_array() {
        let raw = r#"[{"id": "x", "place": [4, 2], "decl": "x: VAR nat", "decl-file": "foo.pvs", "decl-place": [2, 2, 2, 12]}]"#;
        assert!(matches!(
            parse(CommandFamily::NamesInfo, raw).res,
            Some(EnginePayload::Names(ref n)) if n[0].place.map(|p| p.character) == Some(2)
        ));
    }

    #[test]
    fn test_version() {
        let raw = "(\"7.1.0\" \"\" \"Allegro CL 10.1\" \"Linux\")";
        assert_eq!(
            parse(CommandFamily::GetVersion, raw).res,
            Some(EnginePayload::Version(VersionInfo {
                pvs_version: "7.1.0".into(),
                lisp_version: Some("Allegro CL 10.1".into()),
            }))
        );
    }

    #[test]
    fn test_eval_expression_and_lisp_passthrough() {
        assert_eq!(
            parse(CommandFamily::EvalExpression, "==> 120\n").res,
            Some(EnginePayload::Text("120".into()))
        );
        assert_eq!(
            parse(CommandFamily::Lisp, "  (1 2 3)\n").res,
            Some(EnginePayload::Text("(1 2 3)".into()))
        );
    }

    #[test]
    fn test_context_and_acknowledgements() {
        assert_eq!(
            parse(CommandFamily::ChangeContext, "Context changed to /ctx/\n\"/ctx/\"\n").res,
            Some(EnginePayload::Text("/ctx/".into()))
        );
        assert_eq!(
            parse(CommandFamily::DisableGcPrintout, "T\n").res,
            Some(EnginePayload::Unit)
        );
        assert_eq!(parse(CommandFamily::ParseFile, "Parsing foo\nfoo parsed in 0.1 seconds\nNIL\n").res, Some(EnginePayload::Unit));
    }

    #[test]
    fn test_parse_named_fails_closed() {
        let parser = ReplyParser::new();
        assert!(parser.parse_named("show-tccs", "NIL").is_ok());
        assert!(matches!(
            parser.parse_named("frobnicate", "NIL"),
            Err(EngineError::UnrecognizedCommand(_))
        ));
    }

    #[test]
    fn test_last_datum_skips_progress_lines() {
        let raw = "Parsing foo\nfoo parsed in 0.02 seconds\n(\"a\"\n \"b\")\n";
        assert_eq!(last_datum(raw), Some(json!(["a", "b"])));
    }

    #[test]
    fn test_large_obligation_list_parses_in_one_pass() {
        let mut raw = String::from("Typechecking big\nbig typechecked in 12.5s\n(");
        for i in 0..6000 {
            raw.push_str(&format!(
                "(:id \"x{i}_TCC1\" :definition \"FORALL (x: nat):\n  x + {i} > 0\" :proved nil :theory \"big\")\n"
            ));
        }
        raw.push_str(")\n");

        let started = std::time::Instant::now();
        let response = parse(CommandFamily::ShowTccs, &raw);
        let elapsed = started.elapsed();
        match response.res {
            Some(EnginePayload::Tccs(tccs)) => {
                assert_eq!(tccs.len(), 6000);
                assert_eq!(tccs[5999].id, "x5999_TCC1");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(elapsed < std::time::Duration::from_secs(2), "took {elapsed:?}");
    }

    proptest! {
        #[test]
        fn prop_tcc_definitions_are_preserved_verbatim(def in "[a-zA-Z0-9 :()+>=\n]{1,120}") {
            let escaped = def.replace('\\', "\\\\").replace('"', "\\\"");
            let raw = format!("((:id \"t\" :definition \"{escaped}\" :theory \"th\"))");
            let response = ReplyParser::new().parse(CommandFamily::ShowTccs, &raw);
            match response.res {
                Some(EnginePayload::Tccs(tccs)) => prop_assert_eq!(&tccs[0].definition, &def),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
    }
}
