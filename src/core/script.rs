//! Remote script builder.
//!
//! Literal shell text can only be a `&'static str`; anything derived from
//! configuration or secrets must go through [`Line::arg`], [`Line::path`]
//! or [`Line::dq`], which apply the quoting rules in `utils::shell`.

use crate::utils::shell;

/// One shell command line assembled from literal and quoted fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    buf: String,
}

impl Line {
    pub fn new(literal: &'static str) -> Self {
        Self {
            buf: literal.to_string(),
        }
    }

    pub fn lit(mut self, literal: &'static str) -> Self {
        self.buf.push_str(literal);
        self
    }

    /// A value as a single shell word, quoted only when it needs to be.
    pub fn arg(mut self, value: &str) -> Self {
        self.buf.push_str(&shell::quote_arg(value));
        self
    }

    /// A filesystem path, always single-quoted.
    pub fn path(mut self, value: &str) -> Self {
        self.buf.push_str(&shell::quote_path(value));
        self
    }

    /// A value wrapped in double quotes with `\ " $ `` ` escaped.
    pub fn dq(mut self, value: &str) -> Self {
        self.buf.push('"');
        self.buf.push_str(&shell::escape_double_quoted(value));
        self.buf.push('"');
        self
    }

    pub fn build(&self) -> String {
        self.buf.clone()
    }
}

/// Ordered lines sent to a remote login shell as one script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    lines: Vec<String>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(mut self, line: Line) -> Self {
        self.lines.push(line.buf);
        self
    }

    /// A fixed block of shell text with no interpolated values.
    pub fn text(mut self, literal: &'static str) -> Self {
        self.lines
            .extend(literal.trim_end_matches('\n').lines().map(str::to_string));
        self
    }

    pub fn build(&self) -> String {
        let mut script = self.lines.join("\n");
        script.push('\n');
        script
    }
}

impl From<Line> for Script {
    fn from(line: Line) -> Self {
        Script::new().line(line)
    }
}
