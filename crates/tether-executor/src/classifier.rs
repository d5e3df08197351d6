//! Lexical safety classification of untrusted scripts.
//!
//! This is a scan, not a parse. It rejects anything that mentions an escape
//! primitive, so safe code is sometimes refused while unsafe code is not
//! let through.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Outcome of classifying one script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub safe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SafetyVerdict {
    #[must_use]
    pub const fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
        }
    }

    #[must_use]
    pub fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
        }
    }
}

/// Verdict interface used by the executor.
pub trait Classifier: Send + Sync {
    /// Classify `code`. Must be deterministic.
    fn classify(&self, code: &str) -> SafetyVerdict;
}

/// Globals and escape hatches denied when used as free identifiers.
pub const DENIED_GLOBALS: &[&str] = &[
    // dynamic evaluation
    "eval",
    "Function",
    "Fn",
    "call",
    "curry",
    "setTimeout",
    "setInterval",
    "queueMicrotask",
    // cross-context globals
    "window",
    "globalThis",
    "global",
    "self",
    "top",
    "parent",
    "frames",
    "opener",
    "this",
    "document",
    "location",
    "navigator",
    "chrome",
    "browser",
    "process",
    "Deno",
    "Bun",
    // reflection
    "Reflect",
    "Proxy",
    "WebAssembly",
    "Atomics",
    "SharedArrayBuffer",
    // network, storage, workers
    "fetch",
    "XMLHttpRequest",
    "WebSocket",
    "EventSource",
    "Worker",
    "SharedWorker",
    "postMessage",
    "localStorage",
    "sessionStorage",
    "indexedDB",
    "caches",
    "cookieStore",
    // module loading
    "import",
    "require",
    "importScripts",
    "module",
    "exports",
];

/// Introspection tokens denied everywhere, including after `.`.
pub const DENIED_MEMBERS: &[&str] = &[
    "constructor",
    "__proto__",
    "prototype",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
    "getPrototypeOf",
    "setPrototypeOf",
    "defineProperty",
];

/// Framework and editor internals that expose privileged state.
static INTERNAL_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"__react\w*", "React internal state"),
        (r"_reactRootContainer", "React internal state"),
        (r"__vue\w*", "Vue internal state"),
        (r"__ngContext__", "Angular internal state"),
        (r"\bng\s*\.\s*probe\b", "Angular debug probe"),
        (r"__svelte\w*", "Svelte internal state"),
        (r"\bCodeMirror\b", "CodeMirror editor internals"),
        (r"\bcmView\b", "CodeMirror editor internals"),
        (r"\bmonaco\s*\.\s*editor\b", "Monaco editor internals"),
        (r"__lexicalEditor", "Lexical editor internals"),
        (r"\bpmViewDesc\b", "ProseMirror editor internals"),
        (r"__quill\b", "Quill editor internals"),
    ]
    .into_iter()
    .filter_map(|(pattern, label)| match Regex::new(pattern) {
        Ok(re) => Some((re, label)),
        Err(e) => {
            tracing::error!(%pattern, error = %e, "Invalid classifier pattern");
            None
        }
    })
    .collect()
});

/// Escapes that can spell an identifier without writing it.
static ESCAPE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\\(u[0-9A-Fa-f{]|x[0-9A-Fa-f])").ok());

/// Token-level denylist classifier.
#[derive(Debug, Clone)]
pub struct LexicalClassifier {
    globals: Vec<String>,
    members: Vec<String>,
}

impl Default for LexicalClassifier {
    fn default() -> Self {
        Self {
            globals: DENIED_GLOBALS.iter().map(ToString::to_string).collect(),
            members: DENIED_MEMBERS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl LexicalClassifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny an additional free identifier.
    #[must_use]
    pub fn deny_global(mut self, token: impl Into<String>) -> Self {
        self.globals.push(token.into());
        self
    }

    fn check_identifier(&self, ident: &Identifier<'_>) -> Option<SafetyVerdict> {
        if self.members.iter().any(|t| t == ident.text) {
            return Some(SafetyVerdict::unsafe_because(format!(
                "denied introspection token `{}` at offset {}",
                ident.text, ident.offset
            )));
        }
        if !ident.member_access && self.globals.iter().any(|t| t == ident.text) {
            return Some(SafetyVerdict::unsafe_because(format!(
                "denied identifier `{}` at offset {}",
                ident.text, ident.offset
            )));
        }
        None
    }
}

impl Classifier for LexicalClassifier {
    fn classify(&self, code: &str) -> SafetyVerdict {
        if let Some(m) = ESCAPE_PATTERN.as_ref().and_then(|re| re.find(code)) {
            return SafetyVerdict::unsafe_because(format!(
                "escape sequence `{}` at offset {}",
                m.as_str(),
                m.start()
            ));
        }

        if let Some(verdict) = identifiers(code).find_map(|ident| self.check_identifier(&ident)) {
            return verdict;
        }

        for (re, label) in INTERNAL_PATTERNS.iter() {
            if let Some(m) = re.find(code) {
                return SafetyVerdict::unsafe_because(format!(
                    "{label} access `{}` at offset {}",
                    m.as_str(),
                    m.start()
                ));
            }
        }

        SafetyVerdict::safe()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Identifier<'a> {
    text: &'a str,
    offset: usize,
    /// Preceded by `.` or `?.` (but not a `...` spread).
    member_access: bool,
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric()
}

fn identifiers(code: &str) -> impl Iterator<Item = Identifier<'_>> {
    let mut out = Vec::new();
    let mut chars = code.char_indices().peekable();
    // Last three significant (non-whitespace) characters, newest last.
    let mut prev: [Option<char>; 3] = [None; 3];

    while let Some((start, c)) = chars.next() {
        if is_ident_start(c) || c.is_ascii_digit() {
            let mut end = start + c.len_utf8();
            while let Some(&(i, next)) = chars.peek() {
                if !is_ident_continue(next) {
                    break;
                }
                end = i + next.len_utf8();
                chars.next();
            }
            if !c.is_ascii_digit() {
                // `a.b` and `a?.b` only; `..` ranges and `...` spreads are not member access.
                out.push(Identifier {
                    text: &code[start..end],
                    offset: start,
                    member_access: prev[2] == Some('.') && prev[1] != Some('.'),
                });
            }
            prev = [prev[1], prev[2], Some('a')];
        } else if !c.is_whitespace() {
            prev = [prev[1], prev[2], Some(c)];
        }
    }
    out.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(code: &str) -> SafetyVerdict {
        LexicalClassifier::new().classify(code)
    }

    #[test]
    fn rejects_window_assignment() {
        let v = verdict("window.location = 'x'");
        assert!(!v.safe);
        assert!(v.reason.unwrap().contains("`window`"));
    }

    #[test]
    fn accepts_plain_document_access() {
        let v = verdict(r#"let title = doc_get("/title"); doc_set("/seen", true); title"#);
        assert_eq!(v, SafetyVerdict::safe());
    }

    #[test]
    fn member_access_is_not_a_global() {
        assert!(verdict(r#"let x = doc_get("/"); x.top + x.self"#).safe);
        assert!(!verdict("top.x").safe);
        assert!(!verdict("a?.\nb; self").safe);
    }

    #[test]
    fn range_operand_is_not_member_access() {
        for code in [
            "let r = 0..window; r",
            "for i in 0..this { }",
            r#"let f = 0..Fn("doc_remove");"#,
            "let r = 1..=self;",
        ] {
            assert!(!verdict(code).safe, "{code}");
        }
        assert!(verdict("for i in 0..10 { doc_get(\"/\"); }").safe);
    }

    #[test]
    fn spread_is_not_member_access() {
        let v = verdict("f(...window)");
        assert!(!v.safe);
        assert!(v.reason.unwrap().contains("window"));
    }

    #[test]
    fn introspection_denied_after_dot() {
        let v = verdict("let f = x.constructor;");
        assert!(!v.safe);
        assert!(v.reason.unwrap().contains("constructor"));
        assert!(!verdict("a.__proto__").safe);
    }

    #[test]
    fn dynamic_eval_and_import() {
        assert!(!verdict(r#"eval("1")"#).safe);
        assert!(!verdict(r#"import "fs" as fs;"#).safe);
        assert!(!verdict(r#"let f = Fn("x"); f.call()"#).safe);
        assert!(!verdict("require('child_process')").safe);
    }

    #[test]
    fn identifier_boundaries() {
        assert!(verdict("let windowed = 1; let selfish = 2; windowed + selfish").safe);
        assert!(verdict("let x1eval = 3;").safe);
    }

    #[test]
    fn rejects_unicode_escape() {
        let v = verdict(r"\u0077indow");
        assert!(!v.safe);
        assert!(v.reason.unwrap().contains("escape"));
    }

    #[test]
    fn rejects_framework_internals() {
        let v = verdict("node.__reactFiber$abc");
        assert!(!v.safe);
        assert!(v.reason.unwrap().contains("React"));
        assert!(!verdict("el.__vue__.$data").safe);
        assert!(!verdict("monaco . editor.getModels()").safe);
    }

    #[test]
    fn is_deterministic() {
        let code = "let a = 1; window.x; document.y";
        let first = verdict(code);
        for _ in 0..10 {
            assert_eq!(verdict(code), first);
        }
        assert!(first.reason.unwrap().contains("`window` at offset 11"));
    }

    #[test]
    fn extra_denied_global() {
        let classifier = LexicalClassifier::new().deny_global("doc_remove");
        assert!(!classifier.classify("doc_remove(\"/a\")").safe);
    }
}
