//! Reads back the service log file written by the file layer in [`crate::logging`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::Serialize;

use crate::Result;

/// Only the tail of the file is parsed.
const TAIL_BYTES: u64 = 1024 * 1024;

/// Level names as written in log lines, with `WARNING` folded onto `WARN`.
fn canonical_level(raw: &str) -> Option<&'static str> {
    match raw.to_ascii_uppercase().as_str() {
        "TRACE" => Some("TRACE"),
        "DEBUG" => Some("DEBUG"),
        "INFO" => Some("INFO"),
        "WARN" | "WARNING" => Some("WARN"),
        "ERROR" => Some("ERROR"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: String,
    pub level: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedLine {
    timestamp: String,
    level: Option<String>,
    message: String,
}

/// A line opens an entry when it starts with a timestamp, otherwise it continues one.
fn parse_line(line: &str) -> Option<ParsedLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let timestamp = parts.next()?;
    if !looks_like_timestamp(timestamp) {
        return None;
    }
    let rest = parts.next().unwrap_or("").trim_start();

    let mut parts = rest.splitn(2, char::is_whitespace);
    let candidate = parts.next().unwrap_or("");
    let bare = candidate.trim_start_matches('[').trim_end_matches(':').trim_end_matches(']');

    let level = canonical_level(bare).filter(|_| bare.chars().all(|c| c.is_ascii_uppercase()));
    if let Some(level) = level {
        Some(ParsedLine {
            timestamp: timestamp.to_string(),
            level: Some(level.to_string()),
            message: parts.next().unwrap_or("").trim_start().to_string(),
        })
    } else {
        Some(ParsedLine {
            timestamp: timestamp.to_string(),
            level: None,
            message: rest.to_string(),
        })
    }
}

fn looks_like_timestamp(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() >= 10
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[7] == b'-'
}

/// Groups raw text into entries numbered from 0 in file order.
pub fn parse_log(text: &str) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = Vec::new();

    for line in text.split('\n') {
        match parse_line(line) {
            Some(parsed) => entries.push(LogEntry {
                id: entries.len().to_string(),
                timestamp: parsed.timestamp,
                level: parsed.level,
                message: parsed.message,
            }),
            None => {
                if let Some(current) = entries.last_mut() {
                    if !line.trim().is_empty() {
                        current.message.push('\n');
                        current.message.push_str(line.trim_end());
                    }
                }
            }
        }
    }

    entries
}

/// Parses the last MiB of the log file. A missing file reads as empty.
pub fn read_log_file(path: &Path) -> Result<Vec<LogEntry>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let size = file.seek(SeekFrom::End(0))?;
    let start = size.saturating_sub(TAIL_BYTES);
    file.seek(SeekFrom::Start(start))?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let text = String::from_utf8_lossy(&bytes);

    // The first line is probably cut in half.
    let text = if start > 0 {
        text.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
    } else {
        &text
    };

    Ok(parse_log(text))
}

pub fn filter_level(entries: Vec<LogEntry>, level: Option<&str>) -> Vec<LogEntry> {
    match level {
        Some(level) => {
            let wanted = canonical_level(level);
            entries
                .into_iter()
                .filter(|e| wanted.is_some() && e.level.as_deref() == wanted)
                .collect()
        }
        None => entries,
    }
}

/// Newest-first page of entries, optionally restricted to one level.
pub fn list(entries: Vec<LogEntry>, level: Option<&str>, start: usize, page_length: usize) -> Vec<LogEntry> {
    let mut entries = filter_level(entries, level);
    entries.reverse();
    entries.into_iter().skip(start).take(page_length).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "\
2025-06-01T10:00:00.000001Z  INFO Starting event processor group=event_processors
2025-06-01T10:00:01.000001Z ERROR Failed to store event batch: Database error: boom
  caused by: disk full
2025-06-01T10:00:02.000001Z  WARN Stream at 90000/100000 (~90%).
2025-06-01T10:00:03.000001Z  INFO Processed 10 events, failed 0 events
";

    #[test]
    fn test_parse_line_levels() {
        let parsed = parse_line("2025-06-01T10:00:00Z  INFO hello world").unwrap();
        assert_eq!(parsed.level.as_deref(), Some("INFO"));
        assert_eq!(parsed.message, "hello world");

        let bracketed = parse_line("2025-06-01 10:00:00,000 [ERROR]: bad").unwrap();
        assert_eq!(bracketed.timestamp, "2025-06-01");
        assert_eq!(bracketed.level, None);

        assert!(parse_line("  caused by: disk full").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn test_warning_is_an_alias_of_warn() {
        let text = "\
2025-06-01T10:00:00Z WARNING disk almost full
2025-06-01T10:00:01Z  WARN stream near capacity
2025-06-01T10:00:02Z  INFO fine
";
        let entries = parse_log(text);
        assert_eq!(entries[0].level.as_deref(), Some("WARN"));
        assert_eq!(entries[0].message, "disk almost full");

        assert_eq!(filter_level(entries.clone(), Some("WARNING")).len(), 2);
        assert_eq!(filter_level(entries.clone(), Some("warn")).len(), 2);
        assert!(filter_level(entries, Some("LOUD")).is_empty());
    }

    #[test]
    fn test_continuation_lines_join_previous_entry() {
        let entries = parse_log(SAMPLE);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[1].id, "1");
        assert_eq!(entries[1].level.as_deref(), Some("ERROR"));
        assert_eq!(
            entries[1].message,
            "Failed to store event batch: Database error: boom\n  caused by: disk full"
        );
    }

    #[test]
    fn test_list_is_newest_first_and_paged() {
        let entries = parse_log(SAMPLE);
        let page = list(entries.clone(), None, 0, 2);
        let ids: Vec<&str> = page.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);

        let page = list(entries.clone(), None, 2, 10);
        assert_eq!(page.len(), 2);

        let info = list(entries, Some("info"), 0, 10);
        let ids: Vec<&str> = info.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "0"]);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.log");
        assert!(read_log_file(&path).unwrap().is_empty());
    }

    #[test]
    fn test_read_only_tail_of_large_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.log");
        let filler = "2025-06-01T09:00:00.000000Z DEBUG filler line\n".repeat(30_000);
        std::fs::write(&path, format!("{}{}", filler, SAMPLE)).unwrap();

        let entries = read_log_file(&path).unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.message, "Processed 10 events, failed 0 events");
        assert!(entries.len() < 30_004);
        assert!(entries.iter().all(|e| e.timestamp.starts_with("2025-06-01T")));
    }
}
