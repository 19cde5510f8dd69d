/// Recursive semantic segmentation. Paragraphs first, sentences when a
/// paragraph overruns the bound, midpoint halving when a single sentence
/// does. Small neighbouring fragments merge back together so retrieval
/// units stay coherent. Pure and deterministic per input and parameters.

#[derive(Debug, Clone, Copy)]
pub struct ChunkingParams {
    /// Upper bound in characters; only a single token longer than this is
    /// ever emitted unsplit.
    pub max_chunk_size: usize,
    /// Fragments shorter than this merge into the preceding accumulator.
    pub min_chunk_size: usize,
    /// Paragraph/sentence segmentation; off means plain size-bounded halving.
    pub semantic: bool,
    /// Midpoint halving for sentences that overrun the bound.
    pub recursive_fallback: bool,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            max_chunk_size: 600,
            min_chunk_size: 150,
            semantic: true,
            recursive_fallback: true,
        }
    }
}

pub trait Chunker: Send + Sync {
    fn chunk(&self, text: &str) -> Vec<String>;
}

pub struct RecursiveChunker {
    params: ChunkingParams,
}

impl RecursiveChunker {
    pub fn new(params: ChunkingParams) -> Self {
        Self { params }
    }
}

impl Default for RecursiveChunker {
    fn default() -> Self {
        Self::new(ChunkingParams::default())
    }
}

impl Chunker for RecursiveChunker {
    fn chunk(&self, text: &str) -> Vec<String> {
        let p = self.params;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let mut fragments = Vec::new();
        if p.semantic {
            for paragraph in split_paragraphs(trimmed) {
                if char_len(&paragraph) <= p.max_chunk_size {
                    fragments.push(paragraph);
                    continue;
                }
                for sentence in split_sentences(&paragraph) {
                    if char_len(&sentence) <= p.max_chunk_size {
                        fragments.push(sentence);
                    } else if p.recursive_fallback {
                        halve(&sentence, p.max_chunk_size, &mut fragments);
                    } else {
                        fragments.push(sentence);
                    }
                }
            }
        } else {
            halve(trimmed, p.max_chunk_size, &mut fragments);
        }

        merge_small(fragments, p.max_chunk_size, p.min_chunk_size)
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Blank-line separated paragraphs; interior single newlines survive.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                out.push(current.trim().to_string());
            }
            current.clear();
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

/// Break after `.`, `!` or `?` when the next character is whitespace.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut iter = text.char_indices().peekable();
    while let Some((idx, c)) = iter.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some((_, next)) = iter.peek() {
                if next.is_whitespace() {
                    let end = idx + c.len_utf8();
                    let sentence = text[start..end].trim();
                    if !sentence.is_empty() {
                        out.push(sentence.to_string());
                    }
                    start = end;
                }
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

/// Split at the whitespace nearest the midpoint, recursing on each half.
/// A stretch with no whitespace at all is one oversized token and is
/// emitted unsplit; that is the termination guarantee for unpunctuated
/// inputs of any length.
fn halve(s: &str, max: usize, out: &mut Vec<String>) {
    let total = char_len(s);
    if total <= max {
        if !s.is_empty() {
            out.push(s.to_string());
        }
        return;
    }

    let mid = total / 2;
    let mut best: Option<usize> = None; // byte offset of the chosen whitespace
    let mut best_distance = usize::MAX;
    for (position, (byte_idx, c)) in s.char_indices().enumerate() {
        if c.is_whitespace() {
            let distance = position.abs_diff(mid);
            if distance < best_distance {
                best_distance = distance;
                best = Some(byte_idx);
            }
        }
    }

    match best {
        None => out.push(s.to_string()),
        Some(byte_idx) => {
            let left = s[..byte_idx].trim_end();
            let right = s[byte_idx..].trim_start();
            if left.is_empty() || right.is_empty() {
                out.push(s.trim().to_string());
                return;
            }
            halve(left, max, out);
            halve(right, max, out);
        }
    }
}

/// Fold fragments below the minimum into their neighbour while the bound
/// allows. A trailing small fragment that cannot merge stands alone rather
/// than overrunning the maximum.
fn merge_small(fragments: Vec<String>, max: usize, min: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut acc = String::new();
    let mut acc_len = 0usize;

    for fragment in fragments {
        let len = char_len(&fragment);
        if acc.is_empty() {
            acc = fragment;
            acc_len = len;
            continue;
        }
        let either_small = len < min || acc_len < min;
        if either_small && acc_len + 1 + len <= max {
            acc.push(' ');
            acc.push_str(&fragment);
            acc_len += 1 + len;
        } else {
            chunks.push(std::mem::take(&mut acc));
            acc = fragment;
            acc_len = len;
        }
    }
    if !acc.is_empty() {
        chunks.push(acc);
    }
    chunks
}
