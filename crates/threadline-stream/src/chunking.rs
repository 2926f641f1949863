use threadline_core::TextStreamPart;

use crate::config::Chunking;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TextKind {
    Text,
    Reasoning,
}

impl TextKind {
    fn part(self, text: String) -> TextStreamPart {
        match self {
            Self::Text => TextStreamPart::TextDelta { text_delta: text },
            Self::Reasoning => TextStreamPart::Reasoning { text_delta: text },
        }
    }
}

/// Re-splits text and reasoning deltas on chunk boundaries.
///
/// Text waits in a per-kind buffer until a boundary is seen. Any other part,
/// or text of the other kind, flushes what is waiting first so part order is
/// preserved.
#[derive(Debug)]
pub struct Chunker {
    chunking: Chunking,
    pending: Option<(TextKind, String)>,
}

impl Chunker {
    pub fn new(chunking: Chunking) -> Self {
        Self {
            chunking,
            pending: None,
        }
    }

    pub fn push(&mut self, part: TextStreamPart) -> Vec<TextStreamPart> {
        let (kind, text) = match part {
            TextStreamPart::TextDelta { text_delta } => (TextKind::Text, text_delta),
            TextStreamPart::Reasoning { text_delta } => (TextKind::Reasoning, text_delta),
            other => {
                let mut out = self.finish();
                out.push(other);
                return out;
            }
        };
        if matches!(self.chunking, Chunking::None) {
            return if text.is_empty() {
                Vec::new()
            } else {
                vec![kind.part(text)]
            };
        }

        let mut out = Vec::new();
        if self.pending.as_ref().is_some_and(|(k, _)| *k != kind) {
            out.extend(self.finish());
        }
        let (_, buffer) = self.pending.get_or_insert_with(|| (kind, String::new()));
        buffer.push_str(&text);
        while let Some(end) = boundary(&self.chunking, buffer) {
            let rest = buffer.split_off(end);
            out.push(kind.part(std::mem::replace(buffer, rest)));
        }
        if buffer.is_empty() {
            self.pending = None;
        }
        out
    }

    /// Emits whatever text is still waiting for a boundary.
    pub fn finish(&mut self) -> Vec<TextStreamPart> {
        match self.pending.take() {
            Some((kind, text)) if !text.is_empty() => vec![kind.part(text)],
            _ => Vec::new(),
        }
    }
}

/// Byte offset just past the first complete chunk of `text`, if any.
fn boundary(chunking: &Chunking, text: &str) -> Option<usize> {
    match chunking {
        Chunking::None => None,
        Chunking::Word => word_boundary(text),
        Chunking::Line => {
            let start = text.find('\n')?;
            let run = text[start..].len() - text[start..].trim_start_matches('\n').len();
            Some(start + run)
        }
        Chunking::Pattern(regex) => regex.find(text).map(|m| m.end()).filter(|end| *end > 0),
    }
}

/// End of the first word and the whitespace run that follows it. Leading
/// whitespace rides along with the first word.
fn word_boundary(text: &str) -> Option<usize> {
    let mut seen_word = false;
    let mut in_space = false;
    for (index, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_space = seen_word;
        } else if in_space {
            return Some(index);
        } else {
            seen_word = true;
        }
    }
    in_space.then_some(text.len())
}
