// src/formatter.rs

//! Canonical configuration formatting
//!
//! Rewrites a configuration file in a canonical form: blueprints sorted by
//! name, version and revision, fields in a fixed order, defaults omitted,
//! long descriptions wrapped at 79 columns, double quotes for scalars that
//! need quoting and literal blocks for multiline strings. The leading
//! comment block of the file is preserved verbatim. Formatting is
//! idempotent: formatting an already formatted file changes nothing.

use crate::blueprint::{Architecture, Blueprint, Fetch, InstallEntry, Matrix};
use crate::config::Configuration;
use crate::error::Result;
use std::fmt::Write;

/// Width long descriptions are wrapped to
const DESCRIPTION_WIDTH: usize = 79;

/// Produce the canonical text of a configuration
pub fn format_configuration(configuration: &Configuration) -> Result<String> {
    let mut blueprints = configuration.blueprints.clone();
    blueprints.sort_by(|a, b| {
        (&a.name, &a.version, a.revision).cmp(&(&b.name, &b.version, b.revision))
    });

    let mut output = String::new();
    output.push_str(configuration.header.trim_end_matches('\n'));
    if !configuration.header.trim().is_empty() {
        output.push('\n');
    }

    let single = configuration.single_blueprint && blueprints.len() == 1;
    for (index, blueprint) in blueprints.iter().enumerate() {
        if index > 0 {
            output.push('\n');
        }
        emit_blueprint(&mut output, blueprint, !single);
    }
    Ok(output)
}

fn emit_blueprint(output: &mut String, blueprint: &Blueprint, as_list_item: bool) {
    let mut lines: Vec<String> = Vec::new();

    push_scalar(&mut lines, 0, "name", &blueprint.name);
    if let Some(matrix) = &blueprint.matrix {
        emit_matrix(&mut lines, matrix);
    }
    if let Some(version) = &blueprint.version {
        push_scalar(&mut lines, 0, "version", version);
    }
    if blueprint.revision != 1 {
        lines.push(format!("revision: {}", blueprint.revision));
    }
    if blueprint.epoch != 0 {
        lines.push(format!("epoch: {}", blueprint.epoch));
    }
    if let Some(architecture) = blueprint.architecture {
        lines.push(format!("architecture: {architecture}"));
    }
    if let Some(homepage) = &blueprint.homepage {
        push_scalar(&mut lines, 0, "homepage", homepage);
    }
    push_scalar(&mut lines, 0, "summary", &blueprint.summary);
    if !blueprint.description.is_empty() {
        let wrapped = wrap_description(&blueprint.description);
        push_multiline(&mut lines, 0, "description", &wrapped);
    }
    for (key, values) in [
        ("depends", &blueprint.depends),
        ("recommends", &blueprint.recommends),
        ("conflicts", &blueprint.conflicts),
        ("provides", &blueprint.provides),
        ("replaces", &blueprint.replaces),
    ] {
        if !values.is_empty() {
            lines.push(format!("{key}:"));
            for value in values {
                lines.push(format!("  - {}", scalar(value)));
            }
        }
    }
    if let Some(fetch) = &blueprint.fetch {
        emit_fetch(&mut lines, fetch);
    }
    if !blueprint.install.is_empty() {
        lines.push("install:".to_string());
        for entry in &blueprint.install {
            emit_install_entry(&mut lines, entry);
        }
    }
    if !blueprint.script.is_empty() {
        lines.push("script:".to_string());
        for line in &blueprint.script {
            lines.push(format!("  - {}", scalar(line)));
        }
    }

    for (index, line) in lines.iter().enumerate() {
        if as_list_item {
            if index == 0 {
                let _ = writeln!(output, "- {line}");
            } else if line.is_empty() {
                output.push('\n');
            } else {
                let _ = writeln!(output, "  {line}");
            }
        } else {
            let _ = writeln!(output, "{line}");
        }
    }
}

fn emit_matrix(lines: &mut Vec<String>, matrix: &Matrix) {
    lines.push("matrix:".to_string());
    if let Some(architectures) = &matrix.architectures {
        lines.push("  architectures:".to_string());
        for architecture in architectures {
            lines.push(format!("    - {architecture}"));
        }
    }
    if let Some(versions) = &matrix.versions {
        lines.push("  versions:".to_string());
        for version in versions {
            lines.push(format!("    - {}", scalar(version)));
        }
    }
}

fn emit_fetch(lines: &mut Vec<String>, fetch: &Fetch) {
    match fetch {
        Fetch::Url(url) => push_scalar(lines, 0, "fetch", url),
        Fetch::Object { url, targets } => {
            lines.push("fetch:".to_string());
            push_scalar(lines, 1, "url", url);
            if let Some(targets) = targets {
                lines.push("  targets:".to_string());
                let mut pairs: Vec<(&Architecture, &String)> = targets.iter().collect();
                pairs.sort();
                for (architecture, target) in pairs {
                    lines.push(format!("    {architecture}: {}", scalar(target)));
                }
            }
        }
    }
}

fn emit_install_entry(lines: &mut Vec<String>, entry: &InstallEntry) {
    match entry {
        InstallEntry::Str(value) => lines.push(format!("  - {}", scalar(value))),
        InstallEntry::HereDocument { path, content } => {
            lines.push(format!("  - path: {}", scalar(path)));
            if content.contains('\n') {
                let indicator = if content.ends_with('\n') { "|" } else { "|-" };
                lines.push(format!("    content: {indicator}"));
                for line in content.trim_end_matches('\n').split('\n') {
                    if line.is_empty() {
                        lines.push(String::new());
                    } else {
                        lines.push(format!("      {line}"));
                    }
                }
            } else {
                lines.push(format!("    content: {}", scalar(content)));
            }
        }
    }
}

fn push_scalar(lines: &mut Vec<String>, depth: usize, key: &str, value: &str) {
    let indent = "  ".repeat(depth);
    if value.contains('\n') {
        push_multiline(lines, depth, key, value);
    } else {
        lines.push(format!("{indent}{key}: {}", scalar(value)));
    }
}

fn push_multiline(lines: &mut Vec<String>, depth: usize, key: &str, value: &str) {
    let indent = "  ".repeat(depth);
    let indicator = if value.ends_with('\n') { "|" } else { "|-" };
    lines.push(format!("{indent}{key}: {indicator}"));
    for line in value.trim_end_matches('\n').split('\n') {
        if line.is_empty() {
            lines.push(String::new());
        } else {
            lines.push(format!("{indent}  {line}"));
        }
    }
}

/// Quote a scalar with double quotes when plain style would be ambiguous
fn scalar(value: &str) -> String {
    if needs_quoting(value) {
        let mut quoted = String::with_capacity(value.len() + 2);
        quoted.push('"');
        for c in value.chars() {
            match c {
                '"' => quoted.push_str("\\\""),
                '\\' => quoted.push_str("\\\\"),
                '\n' => quoted.push_str("\\n"),
                c => quoted.push(c),
            }
        }
        quoted.push('"');
        quoted
    } else {
        value.to_string()
    }
}

fn needs_quoting(value: &str) -> bool {
    if value.is_empty() || value.trim() != value {
        return true;
    }
    // looks like a number, a boolean or null
    if value.parse::<f64>().is_ok()
        || matches!(value, "true" | "false" | "null" | "~" | "yes" | "no" | "on" | "off")
    {
        return true;
    }
    let first = value.chars().next().unwrap_or(' ');
    if "!&*-?|>%@`\"'#{[,".contains(first) {
        return true;
    }
    value.contains(": ")
        || value.ends_with(':')
        || value.contains(" #")
        || value.contains('\n')
        || value.contains('\t')
}

/// Wrap a description to [`DESCRIPTION_WIDTH`] columns, paragraph-wise
pub fn wrap_description(description: &str) -> String {
    let mut wrapped: Vec<String> = Vec::new();
    for line in description.split('\n') {
        if line.len() <= DESCRIPTION_WIDTH {
            wrapped.push(line.to_string());
            continue;
        }
        let mut current = String::new();
        for word in line.split_whitespace() {
            if current.is_empty() {
                current = word.to_string();
            } else if current.len() + 1 + word.len() <= DESCRIPTION_WIDTH {
                current.push(' ');
                current.push_str(word);
            } else {
                wrapped.push(std::mem::take(&mut current));
                current = word.to_string();
            }
        }
        if !current.is_empty() {
            wrapped.push(current);
        }
    }
    wrapped.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn format_text(content: &str) -> String {
        let configuration = Configuration::parse(content, Path::new("ops2deb.yml")).unwrap();
        format_configuration(&configuration).unwrap()
    }

    #[test]
    fn test_blueprints_are_sorted_and_separated() {
        let formatted = format_text(
            "
- name: zeta
  version: 1.0.0
  summary: hi
- name: alpha
  version: 1.0.0
  summary: hi
",
        );
        let alpha = formatted.find("name: alpha").unwrap();
        let zeta = formatted.find("name: zeta").unwrap();
        assert!(alpha < zeta);
        assert!(formatted.contains("\n\n- name: zeta"));
    }

    #[test]
    fn test_defaults_are_omitted() {
        let formatted = format_text(
            "
- name: demo
  version: 1.0.0
  revision: 1
  epoch: 0
  summary: hi
",
        );
        assert!(!formatted.contains("revision:"));
        assert!(!formatted.contains("epoch:"));
    }

    #[test]
    fn test_header_is_preserved() {
        let formatted = format_text(
            "# lockfile=my.lock.yml\n\nname: demo\nversion: 1.0.0\nsummary: hi\n",
        );
        assert!(formatted.starts_with("# lockfile=my.lock.yml\n"));
    }

    #[test]
    fn test_single_blueprint_stays_a_mapping() {
        let formatted = format_text("name: demo\nversion: 1.0.0\nsummary: hi\n");
        assert!(formatted.starts_with("name: demo\n"));
    }

    #[test]
    fn test_formatting_is_idempotent() {
        let formatted = format_text(
            r#"
- name: demo
  version: "1.0.0"
  summary: hi
  description: |
    A tool.

    With two paragraphs.
  depends:
    - curl
  fetch:
    url: https://e.test/{{target}}.tgz
    targets:
      amd64: x86_64
  script:
    - "echo ok > {{src}}/file"

- name: other
  matrix:
    architectures:
      - amd64
      - arm64
  version: 2.0.0
  summary: hi
  install:
    - path: /etc/demo.conf
      content: |
        key=value
"#,
        );
        let again = format_text(&formatted);
        assert_eq!(formatted, again);
    }

    #[test]
    fn test_version_scalar_is_quoted_when_numeric() {
        let formatted = format_text("name: demo\nversion: \"1.0\"\nsummary: hi\n");
        assert!(formatted.contains("version: \"1.0\""));
    }

    #[test]
    fn test_round_trip_preserves_semantics() {
        let original = "
- name: demo
  version: 1.0.0
  summary: hi
  description: some words
  fetch: https://e.test/{{version}}.tgz
";
        let configuration = Configuration::parse(original, Path::new("x.yml")).unwrap();
        let formatted = format_configuration(&configuration).unwrap();
        let reparsed = Configuration::parse(&formatted, Path::new("x.yml")).unwrap();
        assert_eq!(configuration.blueprints, reparsed.blueprints);
    }

    #[test]
    fn test_wrap_description() {
        let long = "word ".repeat(30);
        let wrapped = wrap_description(long.trim());
        assert!(wrapped.lines().all(|l| l.len() <= 79));
        assert!(wrapped.lines().count() > 1);
    }
}
