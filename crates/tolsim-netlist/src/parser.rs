//! Scanner for resistor declarations in a circuit builder source file.
//!
//! A declaration is a call of the form
//! `c.addElement<Resistor>("R_Input", nINM, nGND, 10000.0);`. Arguments are
//! split on top-level commas while tracking bracket depth and string
//! literals, so computed names (`name + "_RB"`) and declarations spread over
//! several lines are handled. Only calls with exactly four arguments whose
//! last argument is a plain numeric literal are eligible; everything else is
//! left as opaque text.

use std::fs;
use std::ops::Range;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

pub const RESISTOR_CALL: &str = "addElement<Resistor>(";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResistorDecl {
    pub name: String,
    pub node_a: String,
    pub node_b: String,
    pub value: f64,
    /// Byte range of the value literal inside the source text.
    #[serde(skip)]
    pub value_span: Range<usize>,
    /// 1-based line of the call.
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct Netlist {
    source: String,
    resistors: Vec<ResistorDecl>,
}

impl Netlist {
    pub fn parse(source: impl Into<String>) -> Self {
        let source = source.into();
        let resistors = scan_resistors(&source);
        tracing::debug!(count = resistors.len(), "scanned resistor declarations");
        Self { source, resistors }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(source))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn resistors(&self) -> &[ResistorDecl] {
        &self.resistors
    }

    /// Rebuild the source, substituting each eligible value literal with the
    /// text produced by `value_for`. All other bytes are copied verbatim.
    pub fn render_with<F>(&self, mut value_for: F) -> String
    where
        F: FnMut(&ResistorDecl) -> String,
    {
        let mut out = String::with_capacity(self.source.len() + 8 * self.resistors.len());
        let mut cursor = 0;
        for decl in &self.resistors {
            out.push_str(&self.source[cursor..decl.value_span.start]);
            out.push_str(&value_for(decl));
            cursor = decl.value_span.end;
        }
        out.push_str(&self.source[cursor..]);
        out
    }
}

fn scan_resistors(source: &str) -> Vec<ResistorDecl> {
    let mut found = Vec::new();
    let mut search_from = 0;
    while let Some(rel) = source[search_from..].find(RESISTOR_CALL) {
        let call_start = search_from + rel;
        let args_start = call_start + RESISTOR_CALL.len();
        match split_call_args(source, args_start) {
            Some((args, close)) => {
                let line = 1 + source[..call_start].matches('\n').count();
                match build_decl(source, &args, line) {
                    Some(decl) => found.push(decl),
                    None => tracing::debug!(line, "skipping non-literal resistor declaration"),
                }
                search_from = close + 1;
            }
            None => {
                tracing::debug!(offset = call_start, "unterminated resistor declaration");
                search_from = args_start;
            }
        }
    }
    found
}

/// Split the argument list that starts right after an opening parenthesis.
/// Returns the argument byte ranges and the index of the closing parenthesis.
fn split_call_args(source: &str, start: usize) -> Option<(Vec<Range<usize>>, usize)> {
    let bytes = source.as_bytes();
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut arg_start = start;
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b']' | b'}' => depth = depth.checked_sub(1)?,
            b')' if depth == 0 => {
                args.push(arg_start..i);
                return Some((args, i));
            }
            b')' => depth -= 1,
            b',' if depth == 0 => {
                args.push(arg_start..i);
                arg_start = i + 1;
            }
            b';' if depth == 0 => return None,
            _ => {}
        }
        i += 1;
    }
    None
}

fn build_decl(source: &str, args: &[Range<usize>], line: usize) -> Option<ResistorDecl> {
    if args.len() != 4 {
        return None;
    }
    let value_span = trim_span(source, args[3].clone());
    let literal = &source[value_span.clone()];
    if !is_numeric_literal(literal) {
        return None;
    }
    let value: f64 = literal.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    let name_raw = source[args[0].clone()].trim();
    let name = name_raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(name_raw);
    Some(ResistorDecl {
        name: name.to_string(),
        node_a: source[args[1].clone()].trim().to_string(),
        node_b: source[args[2].clone()].trim().to_string(),
        value,
        value_span,
        line,
    })
}

fn trim_span(source: &str, span: Range<usize>) -> Range<usize> {
    let raw = &source[span.clone()];
    let lead = raw.len() - raw.trim_start().len();
    let trimmed_len = raw.trim().len();
    let start = span.start + lead;
    start..start + trimmed_len
}

/// `digits[.digits][e[+-]digits]` or `.digits[...]`; no sign, no suffix.
pub fn is_numeric_literal(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut i = 0;
    let mut mantissa_digits = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
        mantissa_digits += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
            mantissa_digits += 1;
        }
    }
    if mantissa_digits == 0 {
        return false;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        i += 1;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        let exp_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return false;
        }
    }
    i == bytes.len()
}
