//! Script text accumulation and indentation normalization.

/// Ordered accumulation of script fragments for the next batch.
///
/// Conceptually one growing string; [`ScriptBuffer::take`] hands it out and
/// leaves the buffer empty.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScriptBuffer {
    text: String,
}

impl ScriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single line.
    pub fn push(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
    }

    /// Append a multi-line block after stripping its common indentation.
    pub fn raw(&mut self, block: &str) {
        self.text.push_str(&dedent(block));
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Return the accumulated text and clear the buffer.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

fn is_indent(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn is_blank(line: &str) -> bool {
    line.chars().all(char::is_whitespace)
}

/// Strip the indentation of the first content line from every line.
///
/// Leading blank lines are skipped. Tabs and spaces count as one character
/// each. Lines indented less than the first content line lose only what they
/// have; deeper indentation is kept as relative indentation. Blank lines
/// become empty lines. A final whitespace-only fragment with no newline after
/// it is dropped. A block
/// whose first content line is not indented is returned as is. Every output
/// line ends with `\n`.
pub fn dedent(block: &str) -> String {
    let lines: Vec<&str> = block.lines().collect();
    let Some(first) = lines.iter().position(|line| !is_blank(line)) else {
        return String::new();
    };

    let width = lines[first].chars().take_while(|&c| is_indent(c)).count();
    if width == 0 {
        let mut out = block.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        return out;
    }

    // The indentation before a closing delimiter leaves an unterminated
    // whitespace fragment; terminated blank lines are content.
    let mut end = lines.len();
    if end > first + 1 && is_blank(lines[end - 1]) && !block.ends_with('\n') {
        end -= 1;
    }

    let mut out = String::with_capacity(block.len());
    for line in &lines[first..end] {
        if !is_blank(line) {
            out.push_str(strip_indent(line, width));
        }
        out.push('\n');
    }
    out
}

fn strip_indent(line: &str, width: usize) -> &str {
    let cut = line
        .char_indices()
        .take(width)
        .take_while(|&(_, c)| is_indent(c))
        .last()
        .map_or(0, |(idx, c)| idx + c.len_utf8());
    &line[cut..]
}
