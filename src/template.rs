// src/template.rs

//! Single-pass template renderer for blueprint strings
//!
//! Blueprints embed a small subset of Jinja braces: `{{ expr }}` where
//! `expr` is a bare identifier (`version`, `goarch`, `target`, `src`, ...)
//! or a call to `env("NAME", "default"?)`. Rendering is done in one pass,
//! left to right, and never re-expands substituted text, so rendering an
//! already rendered string is a no-op.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::env;

/// Variables available to a render pass
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// Expand every `{{ expr }}` occurrence in `input`
///
/// Fails with `TemplateError` on an undefined variable, a malformed
/// expression or an unterminated brace pair.
pub fn render(input: &str, vars: &TemplateVars) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            Error::TemplateError(format!("unterminated '{{{{' in \"{input}\""))
        })?;
        let expr = after[..end].trim();
        output.push_str(&eval(expr, vars, input)?);
        rest = &after[end + 2..];
    }
    output.push_str(rest);
    Ok(output)
}

/// List the identifiers referenced by a template, `env()` calls excluded.
///
/// Used by the configuration validator to detect `{{target}}` references
/// without rendering.
pub fn references(input: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else { break };
        let expr = after[..end].trim();
        if is_identifier(expr) && !names.iter().any(|n| n == expr) {
            names.push(expr.to_string());
        }
        rest = &after[end + 2..];
    }
    names
}

fn eval(expr: &str, vars: &TemplateVars, input: &str) -> Result<String> {
    if let Some(call) = expr.strip_prefix("env(") {
        let args = call.strip_suffix(')').ok_or_else(|| {
            Error::TemplateError(format!("malformed env() call in \"{input}\""))
        })?;
        let (name, default) = parse_env_args(args, input)?;
        return match env::var(&name) {
            Ok(value) => Ok(value),
            Err(_) => default.ok_or_else(|| {
                Error::TemplateError(format!("environment variable {name} is not set"))
            }),
        };
    }

    if !is_identifier(expr) {
        return Err(Error::TemplateError(format!(
            "invalid template expression \"{expr}\" in \"{input}\""
        )));
    }

    vars.get(expr).map(str::to_string).ok_or_else(|| {
        Error::TemplateError(format!("undefined template variable \"{expr}\" in \"{input}\""))
    })
}

fn parse_env_args(args: &str, input: &str) -> Result<(String, Option<String>)> {
    let mut parts = Vec::new();
    for part in args.split(',') {
        let part = part.trim();
        let unquoted = part
            .strip_prefix('"')
            .and_then(|p| p.strip_suffix('"'))
            .ok_or_else(|| {
                Error::TemplateError(format!("env() arguments must be quoted in \"{input}\""))
            })?;
        parts.push(unquoted.to_string());
    }
    match parts.len() {
        1 => Ok((parts.remove(0), None)),
        2 => {
            let default = parts.pop();
            Ok((parts.remove(0), default))
        }
        _ => Err(Error::TemplateError(format!(
            "env() takes one or two arguments in \"{input}\""
        ))),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars {
        let mut v = TemplateVars::new();
        v.set("version", "1.2.3").set("goarch", "amd64");
        v
    }

    #[test]
    fn test_render_basic() {
        let out = render("app-{{version}}-{{ goarch }}.tar.gz", &vars()).unwrap();
        assert_eq!(out, "app-1.2.3-amd64.tar.gz");
    }

    #[test]
    fn test_render_no_template_is_identity() {
        let out = render("plain string", &vars()).unwrap();
        assert_eq!(out, "plain string");
    }

    #[test]
    fn test_render_is_idempotent() {
        let once = render("v{{version}}", &vars()).unwrap();
        let twice = render(&once, &vars()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_undefined_variable_fails() {
        let err = render("{{nope}}", &vars()).unwrap_err();
        assert!(matches!(err, Error::TemplateError(_)));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_unterminated_braces_fail() {
        assert!(render("{{version", &vars()).is_err());
    }

    #[test]
    fn test_env_with_default() {
        let out = render(r#"{{env("OPS2DEB_TEST_UNSET_VAR", "fallback")}}"#, &vars()).unwrap();
        assert_eq!(out, "fallback");
    }

    #[test]
    fn test_env_set() {
        std::env::set_var("OPS2DEB_TEST_SET_VAR", "hello");
        let out = render(r#"{{env("OPS2DEB_TEST_SET_VAR")}}"#, &vars()).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_env_unset_without_default_fails() {
        assert!(render(r#"{{env("OPS2DEB_TEST_UNSET_VAR")}}"#, &vars()).is_err());
    }

    #[test]
    fn test_no_recursive_expansion() {
        let mut v = TemplateVars::new();
        v.set("a", "{{b}}").set("b", "x");
        // substituted text is not re-expanded
        assert_eq!(render("{{a}}", &v).unwrap(), "{{b}}");
    }

    #[test]
    fn test_references() {
        let refs = references("https://e.test/{{version}}/{{target}}.tgz");
        assert_eq!(refs, vec!["version".to_string(), "target".to_string()]);
        assert!(references(r#"{{env("X", "y")}}"#).is_empty());
    }
}
