//! Engine commands and their families
//!
//! Every command sent to an engine carries a [`CommandFamily`], which selects
//! the reply extraction rule. Families are a closed set: text whose head
//! symbol is not in the table is rejected before it reaches a process.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

static HEAD_SYMBOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\(\s*([\w*+\-?!]+)(?:\s+([\w*+\-?!]+))?").expect("valid regex"));

/// Class of a command, determined by its head operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandFamily {
    ChangeContext,
    CurrentContext,
    DisableGcPrintout,
    EmacsInterface,
    ParseFile,
    TypecheckFile,
    ShowTccs,
    ProveFormula,
    ProofCommand,
    FindDeclaration,
    NamesInfo,
    ListDeclarations,
    GetVersion,
    LoadAttachments,
    EvaluationMode,
    EvalExpression,
    ClearTheories,
    Lisp,
}

impl CommandFamily {
    /// Families that can be derived from a Lisp head symbol
    const BY_HEAD: &'static [(&'static str, CommandFamily)] = &[
        ("change-context", CommandFamily::ChangeContext),
        ("pvs-current-directory", CommandFamily::CurrentContext),
        ("parse-file", CommandFamily::ParseFile),
        ("typecheck-file", CommandFamily::TypecheckFile),
        ("show-tccs", CommandFamily::ShowTccs),
        ("prove-formula", CommandFamily::ProveFormula),
        ("find-declaration", CommandFamily::FindDeclaration),
        ("names-info", CommandFamily::NamesInfo),
        ("list-declarations", CommandFamily::ListDeclarations),
        ("get-pvs-version-information", CommandFamily::GetVersion),
        ("load-pvs-attachments", CommandFamily::LoadAttachments),
        ("evaluation-mode-pvsio", CommandFamily::EvaluationMode),
        ("clear-theories", CommandFamily::ClearTheories),
    ];

    /// Look up the family for a head symbol, and for `setq` its variable
    pub fn from_head(head: &str, first_arg: Option<&str>) -> Option<Self> {
        let head = head.to_ascii_lowercase();
        if head == "setq" {
            return match first_arg.map(str::to_ascii_lowercase).as_deref() {
                Some("*disable-gc-printout*") => Some(CommandFamily::DisableGcPrintout),
                Some("*pvs-emacs-interface*") => Some(CommandFamily::EmacsInterface),
                _ => None,
            };
        }
        Self::BY_HEAD
            .iter()
            .find(|(name, _)| *name == head)
            .map(|(_, family)| *family)
    }

    /// Kebab-case name, as used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            CommandFamily::ChangeContext => "change-context",
            CommandFamily::CurrentContext => "current-context",
            CommandFamily::DisableGcPrintout => "disable-gc-printout",
            CommandFamily::EmacsInterface => "emacs-interface",
            CommandFamily::ParseFile => "parse-file",
            CommandFamily::TypecheckFile => "typecheck-file",
            CommandFamily::ShowTccs => "show-tccs",
            CommandFamily::ProveFormula => "prove-formula",
            CommandFamily::ProofCommand => "proof-command",
            CommandFamily::FindDeclaration => "find-declaration",
            CommandFamily::NamesInfo => "names-info",
            CommandFamily::ListDeclarations => "list-declarations",
            CommandFamily::GetVersion => "get-version",
            CommandFamily::LoadAttachments => "load-attachments",
            CommandFamily::EvaluationMode => "evaluation-mode",
            CommandFamily::EvalExpression => "eval-expression",
            CommandFamily::ClearTheories => "clear-theories",
            CommandFamily::Lisp => "lisp",
        }
    }
}

impl fmt::Display for CommandFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A textual command plus its family tag. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    text: String,
    family: CommandFamily,
}

/// Quote a value as a Lisp string literal
pub fn lisp_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

impl EngineCommand {
    fn new(text: String, family: CommandFamily) -> Self {
        Self { text, family }
    }

    /// Build a command from raw Lisp text, deriving the family from its head.
    ///
    /// Fails closed: unknown heads are an [`EngineError::UnrecognizedCommand`].
    pub fn from_text(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let family = HEAD_SYMBOL
            .captures(&text)
            .and_then(|caps| {
                let head = caps.get(1)?.as_str();
                CommandFamily::from_head(head, caps.get(2).map(|m| m.as_str()))
            })
            .ok_or_else(|| EngineError::UnrecognizedCommand(text.trim().to_string()))?;
        Ok(Self::new(text.trim().to_string(), family))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn family(&self) -> CommandFamily {
        self.family
    }

    pub fn change_context(folder: &str) -> Self {
        Self::new(
            format!("(change-context {} t)", lisp_string(folder)),
            CommandFamily::ChangeContext,
        )
    }

    pub fn current_context() -> Self {
        Self::new("(pvs-current-directory)".into(), CommandFamily::CurrentContext)
    }

    pub fn disable_gc_printout() -> Self {
        Self::new(
            "(setq *disable-gc-printout* t)".into(),
            CommandFamily::DisableGcPrintout,
        )
    }

    pub fn emacs_interface() -> Self {
        Self::new(
            "(setq *pvs-emacs-interface* t)".into(),
            CommandFamily::EmacsInterface,
        )
    }

    /// `file_name` is the bare name, without folder or extension
    pub fn parse_file(file_name: &str) -> Self {
        Self::new(
            format!("(parse-file {} nil nil)", lisp_string(file_name)),
            CommandFamily::ParseFile,
        )
    }

    pub fn typecheck_file(file_name: &str) -> Self {
        Self::new(
            format!("(typecheck-file {} nil nil nil)", lisp_string(file_name)),
            CommandFamily::TypecheckFile,
        )
    }

    /// Typecheck and try to discharge the generated obligations
    pub fn typecheck_prove(file_name: &str) -> Self {
        Self::new(
            format!("(typecheck-file {} nil t nil)", lisp_string(file_name)),
            CommandFamily::TypecheckFile,
        )
    }

    pub fn show_tccs(theory_name: &str) -> Self {
        Self::new(
            format!("(show-tccs {} nil)", lisp_string(theory_name)),
            CommandFamily::ShowTccs,
        )
    }

    pub fn prove_formula(theory_name: &str, formula_name: &str) -> Self {
        Self::new(
            format!(
                "(prove-formula {} {} t)",
                lisp_string(theory_name),
                lisp_string(formula_name)
            ),
            CommandFamily::ProveFormula,
        )
    }

    /// A prover rule, sent verbatim to a session in prover mode
    pub fn proof_command(rule: &str) -> Self {
        let rule = rule.trim();
        let text = if rule.starts_with('(') {
            rule.to_string()
        } else {
            format!("({rule})")
        };
        Self::new(text, CommandFamily::ProofCommand)
    }

    pub fn find_declaration(symbol: &str) -> Self {
        Self::new(
            format!("(find-declaration {})", lisp_string(symbol)),
            CommandFamily::FindDeclaration,
        )
    }

    pub fn names_info(file_name: &str) -> Self {
        Self::new(
            format!("(names-info {})", lisp_string(file_name)),
            CommandFamily::NamesInfo,
        )
    }

    pub fn list_declarations(theory_name: &str) -> Self {
        Self::new(
            format!("(list-declarations {})", lisp_string(theory_name)),
            CommandFamily::ListDeclarations,
        )
    }

    pub fn version() -> Self {
        Self::new(
            "(get-pvs-version-information)".into(),
            CommandFamily::GetVersion,
        )
    }

    pub fn load_attachments() -> Self {
        Self::new("(load-pvs-attachments)".into(), CommandFamily::LoadAttachments)
    }

    /// Enter PVSio for a theory; the last argument suppresses the banner
    pub fn evaluation_mode(theory_name: &str) -> Self {
        Self::new(
            format!(
                "(evaluation-mode-pvsio {} nil nil nil)",
                lisp_string(theory_name)
            ),
            CommandFamily::EvaluationMode,
        )
    }

    /// A PVSio expression, terminated with `;`
    pub fn eval_expression(expression: &str) -> Self {
        let expression = expression.trim().trim_end_matches(';');
        Self::new(format!("{expression};"), CommandFamily::EvalExpression)
    }

    pub fn clear_theories() -> Self {
        Self::new("(clear-theories t)".into(), CommandFamily::ClearTheories)
    }

    /// Raw passthrough; the reply is returned as text
    pub fn lisp(text: &str) -> Self {
        Self::new(text.trim().to_string(), CommandFamily::Lisp)
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
