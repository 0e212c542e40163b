//! Common code-emission utilities: indented code buffers, the
//! common-subexpression cache and kernel argument registration.

use std::collections::HashMap;

/// An indentation-aware line buffer.
///
/// Lines remember the depth they were written at, so splicing one buffer
/// into another re-bases the spliced lines onto the receiver's current
/// level. `open_brace`/`close_brace` give the brace-scoped blocks the
/// generated C++ is built from.
#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    lines: Vec<(usize, String)>,
    level: usize,
}

impl CodeBuffer {
    pub fn new() -> CodeBuffer {
        CodeBuffer::default()
    }

    pub fn writeline(&mut self, line: impl Into<String>) {
        let line = line.into();
        let level = if line.is_empty() { 0 } else { self.level };
        self.lines.push((level, line));
    }

    pub fn writelines<I>(&mut self, lines: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        for line in lines {
            self.writeline(line);
        }
    }

    /// Append another buffer's lines at the current indentation level.
    pub fn splice(&mut self, other: &CodeBuffer) {
        for (level, line) in &other.lines {
            self.lines.push((level + self.level, line.clone()));
        }
    }

    pub fn indent(&mut self) {
        self.level += 1;
    }

    pub fn outdent(&mut self) {
        debug_assert!(self.level > 0, "unbalanced outdent");
        self.level = self.level.saturating_sub(1);
    }

    pub fn open_brace(&mut self) {
        self.writeline("{");
        self.indent();
    }

    pub fn close_brace(&mut self) {
        self.outdent();
        self.writeline("}");
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (level, line) in &self.lines {
            if !line.is_empty() {
                for _ in 0..*level {
                    out.push_str("    ");
                }
            }
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Common-subexpression cache keyed on rendered expression text.
///
/// Requesting the same expression twice within one kernel body returns the
/// temporary assigned the first time; the defining line is written exactly
/// once.
#[derive(Debug, Clone, Default)]
pub struct CseCache {
    counter: usize,
    cache: HashMap<String, String>,
    /// Buffer name -> temporary holding the value last stored to it.
    pub store_cache: HashMap<String, String>,
}

impl CseCache {
    pub fn new() -> CseCache {
        CseCache::default()
    }

    pub fn newvar(&mut self) -> String {
        let name = format!("tmp{}", self.counter);
        self.counter += 1;
        name
    }

    /// Deduplicated temporary for `expr`, writing its definition into `buf`
    /// on a cache miss.
    pub fn generate(&mut self, buf: &mut CodeBuffer, expr: &str) -> String {
        if let Some(var) = self.cache.get(expr) {
            return var.clone();
        }
        let var = self.newvar();
        self.cache.insert(expr.to_string(), var.clone());
        buf.writeline(format!("auto {var} = {expr};"));
        var
    }

    /// Deduplicated temporary for a key that has no defining line of its
    /// own (reduction accumulators).
    pub fn generate_nowrite(&mut self, key: &str) -> String {
        if let Some(var) = self.cache.get(key) {
            return var.clone();
        }
        let var = self.newvar();
        self.cache.insert(key.to_string(), var.clone());
        var
    }
}

/// Buffer-name to formal-argument registration, shared by every kernel of
/// one kernel group so the vector and scalar halves agree on naming.
#[derive(Debug, Clone, Default)]
pub struct KernelArgs {
    input_buffers: Vec<(String, String)>,
    output_buffers: Vec<(String, String)>,
}

impl KernelArgs {
    pub fn new() -> KernelArgs {
        KernelArgs::default()
    }

    /// Register (or look up) `name` as a kernel input. A buffer already
    /// registered as an output keeps its output argument so read-after-write
    /// goes through the same pointer.
    pub fn input(&mut self, name: &str) -> String {
        if let Some((_, arg)) = self.output_buffers.iter().find(|(n, _)| n == name) {
            return arg.clone();
        }
        if let Some((_, arg)) = self.input_buffers.iter().find(|(n, _)| n == name) {
            return arg.clone();
        }
        let arg = format!("in_ptr{}", self.input_buffers.len());
        self.input_buffers.push((name.to_string(), arg.clone()));
        arg
    }

    /// Register (or look up) `name` as a kernel output.
    pub fn output(&mut self, name: &str) -> String {
        if let Some((_, arg)) = self.output_buffers.iter().find(|(n, _)| n == name) {
            return arg.clone();
        }
        let arg = format!("out_ptr{}", self.output_buffers.len());
        self.output_buffers.push((name.to_string(), arg.clone()));
        arg
    }

    /// Inputs then outputs with a const marker for inputs.
    pub fn iter_with_const(&self) -> impl Iterator<Item = (&str, &str, bool)> {
        self.input_buffers
            .iter()
            .map(|(n, a)| (n.as_str(), a.as_str(), true))
            .chain(self.output_buffers.iter().map(|(n, a)| (n.as_str(), a.as_str(), false)))
    }

    pub fn is_empty(&self) -> bool {
        self.input_buffers.is_empty() && self.output_buffers.is_empty()
    }
}
