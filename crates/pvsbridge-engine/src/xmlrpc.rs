//! XML-RPC binding: `pvs.request` carrying a JSON-RPC envelope as a string
//!
//! Only the subset of XML that XML-RPC uses is understood: elements, text,
//! the predefined entities, numeric character references, comments and the
//! XML declaration.

use serde::Serialize;
use serde_json::{json, Map, Number, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::coordinator::EngineMode;
use crate::facade::{codes, FacadeError, PvsFacade};
use crate::rpc::JsonRpcResponse;

pub const REQUEST_METHOD: &str = "pvs.request";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum XmlRpcError {
    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: usize, message: String },
    #[error("unsupported value type <{0}>")]
    UnsupportedType(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum XmlRpcValue {
    String(String),
    Int(i64),
    Boolean(bool),
    Double(f64),
    Array(Vec<XmlRpcValue>),
    Struct(Vec<(String, XmlRpcValue)>),
    Nil,
}

impl XmlRpcValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            XmlRpcValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            XmlRpcValue::String(s) => Value::String(s.clone()),
            XmlRpcValue::Int(i) => json!(i),
            XmlRpcValue::Boolean(b) => Value::Bool(*b),
            XmlRpcValue::Double(d) => Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null),
            XmlRpcValue::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            XmlRpcValue::Struct(members) => Value::Object(
                members
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect::<Map<_, _>>(),
            ),
            XmlRpcValue::Nil => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub method_name: String,
    pub params: Vec<XmlRpcValue>,
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn error(&self, message: impl Into<String>) -> XmlRpcError {
        XmlRpcError::Malformed {
            position: self.pos,
            message: message.into(),
        }
    }

    /// Skip whitespace, comments and processing instructions
    fn skip_misc(&mut self) -> Result<(), XmlRpcError> {
        loop {
            let trimmed = self.rest().trim_start();
            self.pos = self.text.len() - trimmed.len();
            let close = if trimmed.starts_with("<?") {
                "?>"
            } else if trimmed.starts_with("<!--") {
                "-->"
            } else {
                return Ok(());
            };
            match trimmed.find(close) {
                Some(end) => self.pos += end + close.len(),
                None => return Err(self.error(format!("unterminated markup, expected {close}"))),
            }
        }
    }

    /// Name of the next start tag and whether it is self-closing, without consuming it
    fn peek_start(&mut self) -> Result<Option<(&'a str, bool)>, XmlRpcError> {
        self.skip_misc()?;
        let rest = self.rest();
        if !rest.starts_with('<') || rest.starts_with("</") {
            return Ok(None);
        }
        let end = rest.find('>').ok_or_else(|| self.error("unterminated tag"))?;
        let inner = &rest[1..end];
        let self_closing = inner.ends_with('/');
        let name = inner
            .trim_end_matches('/')
            .split_whitespace()
            .next()
            .unwrap_or_default();
        Ok(Some((name, self_closing)))
    }

    fn open(&mut self, name: &str) -> Result<bool, XmlRpcError> {
        match self.peek_start()? {
            Some((found, self_closing)) if found == name => {
                let end = self.rest().find('>').unwrap_or(0);
                self.pos += end + 1;
                Ok(self_closing)
            }
            Some((found, _)) => Err(self.error(format!("expected <{name}>, found <{found}>"))),
            None => Err(self.error(format!("expected <{name}>"))),
        }
    }

    fn close(&mut self, name: &str) -> Result<(), XmlRpcError> {
        self.skip_misc()?;
        let tag = format!("</{name}");
        let rest = self.rest();
        if !rest.starts_with(&tag) {
            return Err(self.error(format!("expected </{name}>")));
        }
        let end = rest.find('>').ok_or_else(|| self.error("unterminated end tag"))?;
        self.pos += end + 1;
        Ok(())
    }

    fn at_close(&mut self, name: &str) -> Result<bool, XmlRpcError> {
        self.skip_misc()?;
        Ok(self.rest().starts_with(&format!("</{name}")))
    }

    /// Character data up to the next tag, entities decoded
    fn text(&mut self) -> Result<String, XmlRpcError> {
        let rest = self.rest();
        let end = rest.find('<').unwrap_or(rest.len());
        let raw = &rest[..end];
        let decoded = unescape(raw).ok_or_else(|| self.error("bad entity reference"))?;
        self.pos += end;
        Ok(decoded)
    }

    /// `open`, text, `close`
    fn text_element(&mut self, name: &str) -> Result<String, XmlRpcError> {
        if self.open(name)? {
            return Ok(String::new());
        }
        let text = self.text()?;
        self.close(name)?;
        Ok(text)
    }

    fn value(&mut self) -> Result<XmlRpcValue, XmlRpcError> {
        if self.open("value")? {
            return Ok(XmlRpcValue::String(String::new()));
        }
        // A value without a type element is a string
        let start = self.pos;
        let leading = self.text()?;
        if self.peek_start()?.is_none() {
            self.close("value")?;
            return Ok(XmlRpcValue::String(leading));
        }
        if !leading.trim().is_empty() {
            self.pos = start;
            return Err(self.error("text mixed with a typed value"));
        }

        let (kind, _) = self.peek_start()?.unwrap_or_default();
        let value = match kind {
            "string" => XmlRpcValue::String(self.text_element("string")?),
            "int" | "i4" | "i8" => {
                let text = self.text_element(kind)?;
                XmlRpcValue::Int(text.trim().parse().map_err(|_| self.error(format!("bad integer {text}")))?)
            }
            "boolean" => match self.text_element("boolean")?.trim() {
                "1" | "true" => XmlRpcValue::Boolean(true),
                "0" | "false" => XmlRpcValue::Boolean(false),
                other => return Err(self.error(format!("bad boolean {other}"))),
            },
            "double" => {
                let text = self.text_element("double")?;
                XmlRpcValue::Double(text.trim().parse().map_err(|_| self.error(format!("bad double {text}")))?)
            }
            "nil" => {
                if !self.open("nil")? {
                    self.close("nil")?;
                }
                XmlRpcValue::Nil
            }
            "array" => self.array()?,
            "struct" => self.structure()?,
            other => return Err(XmlRpcError::UnsupportedType(other.to_string())),
        };
        self.close("value")?;
        Ok(value)
    }

    fn array(&mut self) -> Result<XmlRpcValue, XmlRpcError> {
        let mut items = Vec::new();
        if self.open("array")? {
            return Ok(XmlRpcValue::Array(items));
        }
        if !self.open("data")? {
            while !self.at_close("data")? {
                items.push(self.value()?);
            }
            self.close("data")?;
        }
        self.close("array")?;
        Ok(XmlRpcValue::Array(items))
    }

    fn structure(&mut self) -> Result<XmlRpcValue, XmlRpcError> {
        let mut members = Vec::new();
        if self.open("struct")? {
            return Ok(XmlRpcValue::Struct(members));
        }
        while !self.at_close("struct")? {
            self.open("member")?;
            let name = self.text_element("name")?;
            let value = self.value()?;
            self.close("member")?;
            members.push((name, value));
        }
        self.close("struct")?;
        Ok(XmlRpcValue::Struct(members))
    }
}

fn unescape(raw: &str) -> Option<String> {
    if !raw.contains('&') {
        return Some(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];
        let end = after.find(';')?;
        let entity = &after[..end];
        let ch = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()?
                } else {
                    entity.strip_prefix('#')?.parse().ok()?
                };
                char::from_u32(code)?
            }
        };
        out.push(ch);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

/// Parse a `methodCall` document
pub fn parse_method_call(body: &str) -> Result<MethodCall, XmlRpcError> {
    let mut cursor = Cursor::new(body);
    cursor.open("methodCall")?;
    let method_name = cursor.text_element("methodName")?.trim().to_string();
    let mut params = Vec::new();
    if matches!(cursor.peek_start()?, Some(("params", _))) && !cursor.open("params")? {
        while !cursor.at_close("params")? {
            cursor.open("param")?;
            params.push(cursor.value()?);
            cursor.close("param")?;
        }
        cursor.close("params")?;
    }
    cursor.close("methodCall")?;
    Ok(MethodCall {
        method_name,
        params,
    })
}

/// `methodResponse` with one string value
pub fn encode_response(value: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<methodResponse><params><param><value><string>{}</string></value></param></params></methodResponse>\n",
        escape(value)
    )
}

pub fn encode_fault(code: i32, message: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<methodResponse><fault><value><struct>\
         <member><name>faultCode</name><value><int>{code}</int></value></member>\
         <member><name>faultString</name><value><string>{}</string></value></member>\
         </struct></value></fault></methodResponse>\n",
        escape(message)
    )
}

/// Reply carried in the `methodResponse` string
#[derive(Debug, Clone, Serialize)]
pub struct XmlRpcReply {
    pub mode: EngineMode,
    pub context: Option<String>,
    pub jsonrpc_result: JsonRpcResponse,
}

/// Answer one XML-RPC request body
pub async fn handle_xmlrpc(facade: &PvsFacade, body: &str) -> String {
    let call = match parse_method_call(body) {
        Ok(call) => call,
        Err(err) => {
            warn!(error = %err, "Malformed XML-RPC request");
            return encode_fault(codes::PARSE_ERROR, &err.to_string());
        }
    };
    if call.method_name != REQUEST_METHOD {
        return encode_fault(
            codes::METHOD_NOT_FOUND,
            &format!("unknown XML-RPC method {}", call.method_name),
        );
    }
    // A second parameter names the client's callback URL; replies go back inline
    let Some(envelope) = call.params.first().and_then(XmlRpcValue::as_str) else {
        return encode_fault(
            codes::INVALID_PARAMS,
            "pvs.request expects a JSON-RPC envelope string",
        );
    };

    let jsonrpc_result = match serde_json::from_str::<Value>(envelope) {
        Ok(request) => {
            let id = request.get("id").cloned().unwrap_or(Value::Null);
            match request.get("method").and_then(Value::as_str) {
                Some(method) => {
                    debug!(method, "XML-RPC request");
                    let params = request.get("params").cloned().unwrap_or(Value::Null);
                    JsonRpcResponse::from_envelope(id, facade.handle(method, params).await)
                }
                None => JsonRpcResponse::error(
                    id,
                    FacadeError::new(codes::INVALID_REQUEST, "envelope has no method"),
                ),
            }
        }
        Err(e) => JsonRpcResponse::error(
            Value::Null,
            FacadeError::new(codes::PARSE_ERROR, format!("parse error: {e}")),
        ),
    };

    let reply = XmlRpcReply {
        mode: facade.mode().await,
        context: facade.context().await,
        jsonrpc_result,
    };
    match serde_json::to_string(&reply) {
        Ok(text) => encode_response(&text),
        Err(e) => encode_fault(codes::INVALID_REQUEST, &e.to_string()),
    }
}
