use rustpython_parser::{parse, ast, Mode};

/// Declared location of a class. Lines are 1-indexed, columns 0-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceSpan {
    pub first_line: Option<u32>,
    pub first_column: Option<u32>,
    pub last_line: Option<u32>,
    pub last_column: Option<u32>,
}

/// A class-like declaration found by a [`ClassParser`].
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    /// Base type references in declaration order, dotted when qualified.
    pub bases: Vec<String>,
    pub location: Option<SourceSpan>,
}

impl Declaration {
    /// Whether the first declared base is `marker`, bare or module-qualified.
    pub fn extends(&self, marker: &str) -> bool {
        match self.bases.first() {
            Some(base) => base == marker || base.rsplit('.').next() == Some(marker),
            None => false,
        }
    }
}

/// Produces the flat list of class declarations in a source file.
pub trait ClassParser: Send + Sync {
    fn parse(&self, source: &str) -> crate::Result<Vec<Declaration>>;
}

/// Class extraction for Python sources.
pub struct PythonClassParser;

impl ClassParser for PythonClassParser {
    fn parse(&self, source: &str) -> crate::Result<Vec<Declaration>> {
        extract_classes_from_source(source)
    }
}

/// Build a lookup table of byte-offset → 1-indexed line number.
fn build_line_starts(source: &str) -> Vec<u32> {
    let mut starts = vec![0u32]; // line 1 starts at offset 0
    for (i, b) in source.bytes().enumerate() {
        if b == b'\n' {
            starts.push((i + 1) as u32);
        }
    }
    starts
}

fn offset_to_line(line_starts: &[u32], offset: u32) -> u32 {
    match line_starts.binary_search(&offset) {
        Ok(idx) => (idx + 1) as u32,
        Err(idx) => idx as u32, // idx is the next line, so current line = idx
    }
}

fn offset_to_column(line_starts: &[u32], line: u32, offset: u32) -> u32 {
    let start = line_starts
        .get(line.saturating_sub(1) as usize)
        .copied()
        .unwrap_or(0);
    offset.saturating_sub(start)
}

/// Every class in `source`, nested ones included, in document order.
pub fn extract_classes_from_source(source: &str) -> crate::Result<Vec<Declaration>> {
    let module = parse(source, Mode::Module, "<input>")
        .map_err(|e| crate::Error::ParseFailed(e.to_string()))?;

    let line_starts = build_line_starts(source);
    let mut classes = Vec::new();
    if let ast::Mod::Module(m) = &module {
        for stmt in &m.body {
            collect_from_stmt(stmt, &line_starts, &mut classes);
        }
    }
    Ok(classes)
}

fn collect_from_body(body: &[ast::Stmt], line_starts: &[u32], out: &mut Vec<Declaration>) {
    for stmt in body {
        collect_from_stmt(stmt, line_starts, out);
    }
}

fn collect_from_stmt(stmt: &ast::Stmt, line_starts: &[u32], out: &mut Vec<Declaration>) {
    match stmt {
        ast::Stmt::ClassDef(c) => {
            let start = c.range.start().to_u32();
            let end = c.range.end().to_u32();
            let first_line = offset_to_line(line_starts, start);
            let last_line = offset_to_line(line_starts, end);
            out.push(Declaration {
                name: c.name.to_string(),
                bases: c.bases.iter().map(base_name).collect(),
                location: Some(SourceSpan {
                    first_line: Some(first_line),
                    first_column: Some(offset_to_column(line_starts, first_line, start)),
                    last_line: Some(last_line),
                    last_column: Some(offset_to_column(line_starts, last_line, end)),
                }),
            });
            collect_from_body(&c.body, line_starts, out);
        }
        ast::Stmt::FunctionDef(f) => collect_from_body(&f.body, line_starts, out),
        ast::Stmt::AsyncFunctionDef(f) => collect_from_body(&f.body, line_starts, out),
        ast::Stmt::If(s) => {
            collect_from_body(&s.body, line_starts, out);
            collect_from_body(&s.orelse, line_starts, out);
        }
        ast::Stmt::For(s) => {
            collect_from_body(&s.body, line_starts, out);
            collect_from_body(&s.orelse, line_starts, out);
        }
        ast::Stmt::While(s) => {
            collect_from_body(&s.body, line_starts, out);
            collect_from_body(&s.orelse, line_starts, out);
        }
        ast::Stmt::With(s) => collect_from_body(&s.body, line_starts, out),
        ast::Stmt::Try(s) => {
            collect_from_body(&s.body, line_starts, out);
            for handler in &s.handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                collect_from_body(&h.body, line_starts, out);
            }
            collect_from_body(&s.orelse, line_starts, out);
            collect_from_body(&s.finalbody, line_starts, out);
        }
        _ => {}
    }
}

/// Dotted name of a base class expression; empty for anything that is not
/// a plain or attribute reference (e.g. `Generic[T]`).
fn base_name(expr: &ast::Expr) -> String {
    match expr {
        ast::Expr::Name(n) => n.id.to_string(),
        ast::Expr::Attribute(a) => {
            let owner = base_name(&a.value);
            if owner.is_empty() {
                a.attr.to_string()
            } else {
                format!("{}.{}", owner, a.attr)
            }
        }
        _ => String::new(),
    }
}
