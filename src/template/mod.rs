// src/template/mod.rs

//! Platform configuration template rendering
//!
//! Templates use `${NAME}` placeholders. Substitution values are typed
//! so each output format spells its literals correctly: a boolean
//! rendered into JSON becomes lowercase `true`/`false`, never a
//! host-language capitalized literal. JSON outputs are re-parsed before
//! being accepted; a template that substitutes into something
//! syntactically invalid is a render error, not a silently corrupt file.

use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A typed substitution value
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl TemplateValue {
    /// Interpret a raw string the way operators tend to write values.
    /// Capitalized Python-style literals become typed values so they
    /// render with the target format's spelling.
    pub fn from_literal(raw: &str) -> Self {
        match raw {
            "True" | "true" => Self::Bool(true),
            "False" | "false" => Self::Bool(false),
            "None" | "null" => Self::Null,
            _ => match raw.parse::<i64>() {
                Ok(n) => Self::Int(n),
                Err(_) => Self::Str(raw.to_string()),
            },
        }
    }

    /// Spell this value for the given output format
    fn render(&self, format: TemplateFormat) -> String {
        match (self, format) {
            (Self::Str(s), _) => s.clone(),
            (Self::Int(n), _) => n.to_string(),
            (Self::Bool(b), TemplateFormat::Json) => b.to_string(),
            (Self::Null, TemplateFormat::Json) => "null".to_string(),
            // systemd units and env files use lowercase words too, but
            // env conventionally spells null as the empty string
            (Self::Bool(b), _) => b.to_string(),
            (Self::Null, _) => String::new(),
        }
    }
}

impl From<&str> for TemplateValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<bool> for TemplateValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for TemplateValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

/// Recognized template output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateFormat {
    /// Structured configuration, validated after substitution
    Json,
    /// systemd service unit
    ServiceUnit,
    /// KEY=value environment file
    EnvFile,
    /// Anything else: substituted verbatim
    Plain,
}

impl TemplateFormat {
    /// Classify a template by its file name. A trailing `.tmpl` is
    /// stripped before classification so `app.json.tmpl` renders as
    /// JSON named `app.json`.
    pub fn from_name(name: &str) -> Self {
        let effective = name.strip_suffix(".tmpl").unwrap_or(name);
        if effective.ends_with(".json") {
            Self::Json
        } else if effective.ends_with(".service") {
            Self::ServiceUnit
        } else if effective.ends_with(".env") {
            Self::EnvFile
        } else {
            Self::Plain
        }
    }
}

impl fmt::Display for TemplateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Json => "json",
            Self::ServiceUnit => "service-unit",
            Self::EnvFile => "env-file",
            Self::Plain => "plain",
        };
        write!(f, "{name}")
    }
}

/// A successfully rendered template
#[derive(Debug, Clone)]
pub struct RenderedFile {
    /// The template this came from
    pub template: PathBuf,
    /// Where the rendered output was written
    pub output: PathBuf,
    pub format: TemplateFormat,
}

/// Substitute `${NAME}` placeholders in the template text.
///
/// Every placeholder must have a value; an unknown name is a render
/// error naming the variable and the template.
fn substitute(
    text: &str,
    variables: &BTreeMap<String, TemplateValue>,
    format: TemplateFormat,
    origin: &Path,
) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(Error::Render(format!(
                "{}: unterminated placeholder",
                origin.display()
            )));
        };
        let name = &after[..end];
        match variables.get(name) {
            Some(value) => out.push_str(&value.render(format)),
            None => {
                return Err(Error::Render(format!(
                    "{}: no value for variable '{name}'",
                    origin.display()
                )));
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Validate substituted output for its format before it is written
fn validate_output(content: &str, format: TemplateFormat, origin: &Path) -> Result<()> {
    match format {
        TemplateFormat::Json => {
            serde_json::from_str::<serde_json::Value>(content).map_err(|e| {
                Error::Render(format!(
                    "{}: substituted output is not valid JSON: {e}",
                    origin.display()
                ))
            })?;
        }
        TemplateFormat::EnvFile => {
            for (i, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if !line.contains('=') {
                    return Err(Error::Render(format!(
                        "{}: line {} is not KEY=value",
                        origin.display(),
                        i + 1
                    )));
                }
            }
        }
        TemplateFormat::ServiceUnit | TemplateFormat::Plain => {}
    }
    Ok(())
}

/// Render a single template to `output_path`
pub fn render(
    template_path: &Path,
    output_path: &Path,
    variables: &BTreeMap<String, TemplateValue>,
) -> Result<RenderedFile> {
    let name = template_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let format = TemplateFormat::from_name(&name);

    let text = fs::read_to_string(template_path)
        .map_err(|e| Error::Render(format!("cannot read {}: {e}", template_path.display())))?;
    let rendered = substitute(&text, variables, format, template_path)?;
    validate_output(&rendered, format, template_path)?;

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(output_path, rendered)?;
    debug!(
        "rendered {} -> {} ({format})",
        template_path.display(),
        output_path.display()
    );

    Ok(RenderedFile {
        template: template_path.to_path_buf(),
        output: output_path.to_path_buf(),
        format,
    })
}

/// Render every template file found under `template_dir` into
/// `output_dir`, preserving relative paths and stripping a trailing
/// `.tmpl` from output names.
///
/// A failure on one template does not stop the others, but the overall
/// call reports which templates failed rather than claiming success.
pub fn render_all(
    template_dir: &Path,
    output_dir: &Path,
    variables: &BTreeMap<String, TemplateValue>,
) -> Result<Vec<RenderedFile>> {
    let mut rendered = Vec::new();
    let mut failures = Vec::new();

    for entry in WalkDir::new(template_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let template = entry.path();
        let rel = template
            .strip_prefix(template_dir)
            .expect("walkdir yields children of its root");
        let out_name = rel.to_string_lossy().to_string();
        let out_name = out_name.strip_suffix(".tmpl").unwrap_or(&out_name).to_string();
        let output = output_dir.join(out_name);

        match render(template, &output, variables) {
            Ok(file) => rendered.push(file),
            Err(e) => {
                warn!("template {} failed: {e}", template.display());
                failures.push(format!("{}: {e}", rel.display()));
            }
        }
    }

    if !failures.is_empty() {
        return Err(Error::Render(format!(
            "{} of {} template(s) failed: {}",
            failures.len(),
            failures.len() + rendered.len(),
            failures.join("; ")
        )));
    }
    Ok(rendered)
}

/// Check that a rendered set contains every output type the target
/// platform needs: structured config, service unit, environment file.
pub fn check_required_outputs(rendered: &[RenderedFile], platform: &str) -> Result<()> {
    let mut missing = Vec::new();
    for (format, label) in [
        (TemplateFormat::Json, "structured config (.json)"),
        (TemplateFormat::ServiceUnit, "service unit (.service)"),
        (TemplateFormat::EnvFile, "environment file (.env)"),
    ] {
        if !rendered.iter().any(|r| r.format == format) {
            missing.push(label);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::Render(format!(
            "platform '{platform}' requires outputs that were not produced: {}",
            missing.join(", ")
        )))
    }
}
