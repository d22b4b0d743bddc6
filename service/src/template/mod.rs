//! Renders job descriptors into the scripts batch schedulers consume.
//!
//! Templates are plain text with a fixed set of substitution points:
//!
//! - `{{name}}` is replaced by the value of `name`, which must resolve.
//! - a line starting with `{{?name}}` is kept only when `name` resolves to a value that is
//!   neither empty nor `0`. The rest of the line follows the normal rules.
//!
//! Nothing else is interpreted, so a template can't evaluate code and values can't smuggle
//! directives into the script.

mod builtin;
mod variable;

use std::collections::HashMap;
use std::fmt::Write;

use domain::error::TemplateError;
use domain::model::vo::{BackendKind, JobDescriptor, SubmissionArtifact};

pub use self::variable::{TemplateBindings, Variable};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Var(Variable),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Scalars { condition: Option<Variable>, segments: Vec<Segment> },
    Block { condition: Option<Variable>, variable: Variable },
}

/// A parsed template plus the backend settings it is rendered with.
#[derive(Debug, Clone)]
pub struct ScriptTemplate {
    id: String,
    lines: Vec<Line>,
    bindings: TemplateBindings,
}

impl ScriptTemplate {
    pub fn parse(
        id: impl Into<String>,
        source: &str,
        bindings: TemplateBindings,
    ) -> Result<Self, TemplateError> {
        let id = id.into();
        let lines = source
            .lines()
            .enumerate()
            .map(|(n, line)| parse_line(&id, n + 1, line))
            .collect::<Result<_, _>>()?;
        Ok(Self { id, lines, bindings })
    }

    /// The stock template for a scheduler family.
    pub fn builtin(
        id: impl Into<String>,
        kind: BackendKind,
        bindings: TemplateBindings,
    ) -> Result<Self, TemplateError> {
        Self::parse(id, builtin::source(kind), bindings)
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn render(&self, job: &JobDescriptor) -> Result<SubmissionArtifact, TemplateError> {
        let mut content = String::new();
        for line in &self.lines {
            match line {
                Line::Scalars { condition, segments } => {
                    if !self.condition_holds(*condition, job)? {
                        continue;
                    }
                    for segment in segments {
                        match segment {
                            Segment::Text(text) => content.push_str(text),
                            Segment::Var(var) => content.push_str(&self.required_scalar(*var, job)?),
                        }
                    }
                    content.push('\n');
                }
                Line::Block { condition, variable } => {
                    if !self.condition_holds(*condition, job)? {
                        continue;
                    }
                    let block = variable
                        .block(job, &self.bindings)?
                        .ok_or_else(|| self.missing(*variable))?;
                    for entry in block {
                        let _ = writeln!(content, "{entry}");
                    }
                }
            }
        }

        let digest = blake3::hash(content.as_bytes()).to_hex().to_string();
        Ok(SubmissionArtifact {
            job_id: job.id.clone(),
            template_id: self.id.clone(),
            tag: job.correlation_tag(),
            content,
            digest,
        })
    }

    fn condition_holds(
        &self,
        condition: Option<Variable>,
        job: &JobDescriptor,
    ) -> Result<bool, TemplateError> {
        let Some(var) = condition else {
            return Ok(true);
        };
        if var.is_block() {
            return Ok(var.block(job, &self.bindings)?.is_some_and(|block| !block.is_empty()));
        }
        Ok(var.scalar(job, &self.bindings)?.is_some_and(|v| !v.is_empty() && v != "0"))
    }

    fn required_scalar(&self, var: Variable, job: &JobDescriptor) -> Result<String, TemplateError> {
        var.scalar(job, &self.bindings)?.ok_or_else(|| self.missing(var))
    }

    fn missing(&self, var: Variable) -> TemplateError {
        TemplateError::MissingVariable {
            template: self.id.clone(),
            variable: var.to_string(),
        }
    }
}

fn parse_line(template: &str, n: usize, line: &str) -> Result<Line, TemplateError> {
    let mut rest = line;
    let mut condition = None;
    if let Some(after) = rest.strip_prefix("{{?") {
        let (name, tail) = after
            .split_once("}}")
            .ok_or_else(|| TemplateError::Syntax { template: template.to_owned(), line: n })?;
        condition = Some(variable(template, name)?);
        rest = tail;
    }

    let mut segments = Vec::new();
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_owned()));
        }
        let (name, tail) = rest[start + 2..]
            .split_once("}}")
            .ok_or_else(|| TemplateError::Syntax { template: template.to_owned(), line: n })?;
        segments.push(Segment::Var(variable(template, name)?));
        rest = tail;
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_owned()));
    }

    if let Some(block) = segments.iter().find_map(|s| match s {
        Segment::Var(var) if var.is_block() => Some(*var),
        _ => None,
    }) {
        if segments.len() != 1 {
            return Err(TemplateError::MisplacedBlock {
                template: template.to_owned(),
                variable: block.to_string(),
            });
        }
        return Ok(Line::Block { condition, variable: block });
    }

    Ok(Line::Scalars { condition, segments })
}

fn variable(template: &str, name: &str) -> Result<Variable, TemplateError> {
    let name = name.trim();
    name.parse().map_err(|_| TemplateError::UnknownVariable {
        template: template.to_owned(),
        variable: name.to_owned(),
    })
}

/// Templates by id. Every backend registers the template it renders with under its own name.
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    templates: HashMap<String, ScriptTemplate>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: ScriptTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    #[inline]
    pub fn contains(&self, template_id: &str) -> bool {
        self.templates.contains_key(template_id)
    }

    /// Pure and deterministic: the same descriptor always renders to the same bytes.
    pub fn render(
        &self,
        template_id: &str,
        job: &JobDescriptor,
    ) -> Result<SubmissionArtifact, TemplateError> {
        self.templates
            .get(template_id)
            .ok_or_else(|| TemplateError::UnknownTemplate(template_id.to_owned()))?
            .render(job)
    }
}
