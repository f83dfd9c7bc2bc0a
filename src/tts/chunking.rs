//! Sentence-boundary text chunking for synthesis.

/// Split `text` into chunks of at most `max_len` characters.
///
/// Sentences (ending in `.`, `!` or `?`) are packed greedily into chunks. A
/// sentence longer than `max_len` is broken at the last whitespace inside the
/// budget, or cut hard when it has none. Blank input yields no chunks.
pub fn split_text(text: &str, max_len: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let max_len = max_len.max(1);
    if trimmed.chars().count() <= max_len {
        return vec![trimmed.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut chunk = String::new();
    for sentence in sentences(trimmed) {
        for piece in fit(&sentence, max_len) {
            let joined_len = if chunk.is_empty() {
                piece.chars().count()
            } else {
                chunk.chars().count() + 1 + piece.chars().count()
            };
            if joined_len <= max_len {
                if !chunk.is_empty() {
                    chunk.push(' ');
                }
                chunk.push_str(&piece);
            } else {
                if !chunk.is_empty() {
                    chunks.push(std::mem::take(&mut chunk));
                }
                chunk = piece;
            }
        }
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }
    chunks
}

fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let sentence = current.trim();
            if !sentence.is_empty() {
                out.push(sentence.to_owned());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_owned());
    }
    out
}

/// Break one sentence into pieces of at most `max_len` characters.
fn fit(sentence: &str, max_len: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = sentence.trim();
    while rest.chars().count() > max_len {
        // Byte offset of the first char past the budget.
        let limit = rest
            .char_indices()
            .nth(max_len)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..limit];
        let cut = match rest[limit..].chars().next() {
            Some(c) if c.is_whitespace() => limit,
            _ => window.rfind(char::is_whitespace).unwrap_or(limit),
        };
        let cut = if cut == 0 { limit } else { cut };
        pieces.push(rest[..cut].trim_end().to_owned());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest.to_owned());
    }
    pieces
}
