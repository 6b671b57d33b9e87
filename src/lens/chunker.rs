use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

const THREAD_END_MARKER: &str = "========== END THREAD ==========";

// Fallback cut points must not land in the front of the window, otherwise a
// huge input degenerates into thousands of tiny chunks. Each family has its
// own floor, tried in priority order.
const THREAD_END_FLOOR: f64 = 0.5;
const MESSAGE_MARKER_FLOOR: f64 = 0.6;
const PARAGRAPH_FLOOR: f64 = 0.7;
const LINE_FLOOR: f64 = 0.8;

/// Thread-boundary openers, tried in priority order. The first pattern that
/// cuts the text into more than one segment wins.
fn boundary_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"==========\s+THREAD:",
            r"Thread ID:\s*\w+",
            r"ThreadId:",
            r"Conversation: \d+",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Message-boundary markers used by the size fallback: role headers in both
/// transcript styles, mail-style headers, date/time stamps.
fn message_markers() -> &'static Vec<Regex> {
    static MARKERS: OnceLock<Vec<Regex>> = OnceLock::new();
    MARKERS.get_or_init(|| {
        [
            r"\n(?:USER|ASSISTANT): ",
            r"\n\s*User:\s*\n",
            r"\n\s*Assistant:\s*\n",
            r"\nFrom:\s+[^\n]*\n",
            r"\nTo:\s+[^\n]*\n",
            r"\n\d{2}/\d{2}/\d{4}\s+\d{2}:\d{2}:\d{2}\s*\n",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Split `text` into ordered chunks of at most `max_size` bytes each, except
/// when a single atomic segment unavoidably exceeds the budget and even the
/// size fallback cannot find a cut. Segments are cut at boundary-match
/// starts, so concatenating the chunks reproduces the input exactly.
pub fn chunk(text: &str, max_size: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max_size {
        return vec![text.to_string()];
    }

    let segments = split_at_boundaries(text);
    if segments.len() <= 1 {
        return chunk_by_size(text, max_size);
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for segment in segments {
        if current.len() + segment.len() > max_size {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if segment.len() > max_size {
                chunks.extend(chunk_by_size(segment, max_size));
            } else {
                current.push_str(segment);
            }
        } else {
            current.push_str(segment);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Cut the text at the start of every boundary match, so each segment keeps
/// its own header. Returns a single segment when no pattern produces more.
fn split_at_boundaries(text: &str) -> Vec<&str> {
    for pattern in boundary_patterns() {
        let starts: Vec<usize> = pattern.find_iter(text).map(|m| m.start()).collect();
        if starts.is_empty() {
            continue;
        }
        let mut segments = Vec::with_capacity(starts.len() + 1);
        let mut prev = 0usize;
        for start in starts {
            if start > prev {
                segments.push(&text[prev..start]);
            }
            prev = start;
        }
        segments.push(&text[prev..]);
        if segments.len() > 1 {
            return segments;
        }
    }
    vec![text]
}

/// Size-based fallback: repeatedly cut the remainder near the budget at the
/// best available break, in priority order. Never cuts inside a UTF-8
/// sequence and never reorders content.
pub fn chunk_by_size(text: &str, max_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if rest.len() <= max_size {
            chunks.push(rest.to_string());
            break;
        }

        let window_end = floor_char_boundary(rest, max_size);
        if window_end == 0 {
            // Budget smaller than the first character; take one whole char
            // so the loop always advances.
            let step = rest.chars().next().map_or(rest.len(), char::len_utf8);
            chunks.push(rest[..step].to_string());
            rest = &rest[step..];
            continue;
        }
        let window = &rest[..window_end];
        let cut = find_cut_point(window, window_end);
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}

fn find_cut_point(window: &str, window_end: usize) -> usize {
    let floor = |fraction: f64| (window_end as f64 * fraction) as usize;

    if let Some(pos) = window.rfind(THREAD_END_MARKER) {
        if pos > floor(THREAD_END_FLOOR) {
            return pos + THREAD_END_MARKER.len();
        }
    }

    for marker in message_markers() {
        if let Some(last) = marker.find_iter(window).last() {
            if last.start() > floor(MESSAGE_MARKER_FLOOR) {
                return last.start();
            }
        }
    }

    if let Some(pos) = window.rfind("\n\n") {
        if pos > floor(PARAGRAPH_FLOOR) {
            return pos;
        }
    }

    if let Some(pos) = window.rfind('\n') {
        if pos > floor(LINE_FLOOR) {
            return pos;
        }
    }

    window_end
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Write each chunk to `chunk_{i}.txt` under `output_dir`, returning the
/// paths in chunk order.
pub fn save_chunks_to_files(chunks: &[String], output_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("create chunk dir {}", output_dir.display()))?;

    let mut paths = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let path = output_dir.join(format!("chunk_{i}.txt"));
        fs::write(&path, chunk).with_context(|| format!("write chunk file {}", path.display()))?;
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread_block(id: usize, body_len: usize) -> String {
        format!(
            "========== THREAD: t{id} ==========\n{}\n{THREAD_END_MARKER}\n",
            "x".repeat(body_len)
        )
    }

    #[test]
    fn small_input_is_identity() {
        let text = "USER: hi\n\nASSISTANT: hello\n\n";
        assert_eq!(chunk(text, 1000), vec![text.to_string()]);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk("", 1000).is_empty());
    }

    #[test]
    fn thread_segments_pack_greedily_and_concatenate_losslessly() {
        let text: String = (0..6).map(|i| thread_block(i, 300)).collect();
        let chunks = chunk(&text, 800);

        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.len() <= 800, "chunk of {} bytes over budget", c.len());
            assert!(c.starts_with("========== THREAD:"));
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn oversized_single_thread_goes_through_size_fallback() {
        let text = format!("{}{}", thread_block(0, 50), thread_block(1, 5000));
        let chunks = chunk(&text, 1000);
        assert!(chunks.len() > 2);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn size_fallback_prefers_message_markers() {
        let mut text = String::new();
        for i in 0..40 {
            text.push_str(&format!("USER: message number {i} {}\n", "y".repeat(40)));
        }
        let chunks = chunk_by_size(&text, 500);
        for c in &chunks[1..] {
            assert!(c.starts_with('\n') || c.starts_with("USER:"));
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn budget_below_one_char_still_terminates() {
        let chunks = chunk_by_size("éé", 1);
        assert_eq!(chunks, vec!["é".to_string(), "é".to_string()]);

        let chunks = chunk_by_size("abc", 0);
        assert_eq!(chunks.concat(), "abc");
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn hard_cut_respects_char_boundaries() {
        let text = "é".repeat(600);
        let chunks = chunk_by_size(&text, 101);
        assert_eq!(chunks.concat(), text);
        for c in &chunks {
            assert!(c.len() <= 101);
        }
    }

    #[test]
    fn save_chunks_writes_numbered_files() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = vec!["one".to_string(), "two".to_string()];
        let paths = save_chunks_to_files(&chunks, dir.path()).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(std::fs::read_to_string(&paths[0]).unwrap(), "one");
        assert!(paths[1].ends_with("chunk_1.txt"));
    }
}
