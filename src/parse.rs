//! Streaming CSV and NDJSON parsers.
//!
//! Both formats are read lazily, one record at a time, so a file of any size
//! is processed with a bounded amount of memory. Each item of a
//! [`RecordStream`] is either a parsed record or a [`ParseError`]; malformed
//! units are reported and skipped, and only a failing reader ends the stream
//! early.
//!
//! [`spawn_parser`] runs a stream on a blocking thread and hands its items to
//! the async import pipeline through a bounded channel. Dropping the receiver
//! stops the parser.

use std::io::{self, BufRead};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ParseError;
use crate::models::{Format, RawRecord};

/// Default bound on a single line (or CSV record).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A record plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// 1-based physical line the record starts on.
    pub row: u64,
    pub record: RawRecord,
    /// Set when a CSV row's field count differs from the header's.
    pub column_mismatch: Option<ColumnMismatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMismatch {
    pub expected: usize,
    pub found: usize,
}

pub type ParseItem = Result<ParsedRecord, ParseError>;

/// Lazy record sequence over either supported format.
pub enum RecordStream<R: BufRead> {
    Csv(CsvRecords<R>),
    Ndjson(NdjsonRecords<R>),
}

impl<R: BufRead> RecordStream<R> {
    pub fn new(reader: R, format: Format, max_line_bytes: usize) -> Self {
        match format {
            Format::Csv => RecordStream::Csv(CsvRecords::new(reader, max_line_bytes)),
            Format::Ndjson => RecordStream::Ndjson(NdjsonRecords::new(reader, max_line_bytes)),
        }
    }
}

impl<R: BufRead> Iterator for RecordStream<R> {
    type Item = ParseItem;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RecordStream::Csv(inner) => inner.next(),
            RecordStream::Ndjson(inner) => inner.next(),
        }
    }
}

/// Runs the parser on the blocking pool and returns the consuming end of a
/// bounded channel. The channel closes at end of input, after a fatal read
/// error, or when the receiver is dropped.
pub fn spawn_parser<R>(
    reader: R,
    format: Format,
    max_line_bytes: usize,
    capacity: usize,
) -> mpsc::Receiver<ParseItem>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::task::spawn_blocking(move || {
        for item in RecordStream::new(reader, format, max_line_bytes) {
            if tx.blocking_send(item).is_err() {
                break;
            }
        }
    });
    rx
}

// ============ CSV ============

/// CSV rows keyed by the header row. Short rows are padded with empty
/// strings, long rows keep only the header's columns; both are flagged.
///
/// Records are split off the input by [`read_bounded_record`] before the
/// `csv` crate parses them, so an overlong record is discarded while it is
/// read and never buffered whole.
pub struct CsvRecords<R: BufRead> {
    reader: R,
    buf: Vec<u8>,
    row: csv::StringRecord,
    headers: Option<Vec<String>>,
    next_line: u64,
    max_line_bytes: usize,
    done: bool,
}

impl<R: BufRead> CsvRecords<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            row: csv::StringRecord::new(),
            headers: None,
            next_line: 1,
            max_line_bytes,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for CsvRecords<R> {
    type Item = ParseItem;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            let line = self.next_line;
            let read =
                match read_bounded_record(&mut self.reader, &mut self.buf, self.max_line_bytes) {
                    Ok(read) => read,
                    Err(err) => {
                        self.done = true;
                        return Some(Err(ParseError::Io(err)));
                    }
                };

            let lines = match read {
                RecordRead::Eof => {
                    self.done = true;
                    continue;
                }
                RecordRead::TooLong { lines } => {
                    self.next_line += lines;
                    // Without a header there is nothing to key rows by.
                    self.done = self.headers.is_none();
                    return Some(Err(ParseError::LineTooLong {
                        line,
                        limit: self.max_line_bytes,
                    }));
                }
                RecordRead::Record { lines } => lines,
            };
            self.next_line += lines;

            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
            match parse_csv_record(&self.buf, &mut self.row) {
                Ok(true) => {}
                // Blank line.
                Ok(false) => continue,
                Err(err) => {
                    self.done = self.headers.is_none();
                    return Some(Err(ParseError::Malformed {
                        line,
                        message: err.to_string(),
                    }));
                }
            }

            if let Some(headers) = &self.headers {
                return Some(Ok(build_csv_record(headers, &self.row, line)));
            }
            self.headers = Some(self.row.iter().map(|h| h.trim().to_string()).collect());
        }
        None
    }
}

/// Parses one already-delimited record. `Ok(false)` means it was empty.
fn parse_csv_record(bytes: &[u8], row: &mut csv::StringRecord) -> csv::Result<bool> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .buffer_capacity(bytes.len().clamp(64, 8 * 1024))
        .from_reader(bytes)
        .read_record(row)
}

fn build_csv_record(headers: &[String], row: &csv::StringRecord, line: u64) -> ParsedRecord {
    let mut record = RawRecord::new();
    for (i, header) in headers.iter().enumerate() {
        record.insert(header.as_str(), row.get(i).unwrap_or(""));
    }

    let column_mismatch = (row.len() != headers.len()).then_some(ColumnMismatch {
        expected: headers.len(),
        found: row.len(),
    });

    ParsedRecord {
        row: line,
        record,
        column_mismatch,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RecordRead {
    Eof,
    /// `lines` counts the newlines consumed, terminator included.
    Record { lines: u64 },
    TooLong { lines: u64 },
}

/// Reads one CSV record: bytes up to the first `\n` outside double quotes.
/// Like [`read_bounded_line`], at most `limit` bytes are ever held; an
/// overlong record is consumed and discarded.
fn read_bounded_record<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<RecordRead> {
    let mut overflow = false;
    let mut read_any = false;
    let mut in_quotes = false;
    let mut lines = 0u64;

    loop {
        let available = match reader.fill_buf() {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        if available.is_empty() {
            return Ok(match (read_any, overflow) {
                (false, _) => RecordRead::Eof,
                (true, true) => RecordRead::TooLong { lines },
                (true, false) => RecordRead::Record { lines },
            });
        }
        read_any = true;

        let mut terminator = None;
        for (i, &b) in available.iter().enumerate() {
            match b {
                // An escaped quote ("") toggles twice.
                b'"' => in_quotes = !in_quotes,
                b'\n' => {
                    lines += 1;
                    if !in_quotes {
                        terminator = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let chunk_len = terminator.unwrap_or(available.len());

        if !overflow {
            if buf.len() + chunk_len > limit {
                overflow = true;
                buf.clear();
            } else {
                buf.extend_from_slice(&available[..chunk_len]);
            }
        }

        reader.consume(chunk_len + usize::from(terminator.is_some()));

        if terminator.is_some() {
            return Ok(if overflow {
                RecordRead::TooLong { lines }
            } else {
                RecordRead::Record { lines }
            });
        }
    }
}

// ============ NDJSON ============

/// One JSON object per line. Blank lines are skipped silently.
pub struct NdjsonRecords<R: BufRead> {
    reader: R,
    buf: Vec<u8>,
    line: u64,
    max_line_bytes: usize,
    done: bool,
}

impl<R: BufRead> NdjsonRecords<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line: 0,
            max_line_bytes,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for NdjsonRecords<R> {
    type Item = ParseItem;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            let read = match read_bounded_line(&mut self.reader, &mut self.buf, self.max_line_bytes)
            {
                Ok(read) => read,
                Err(err) => {
                    self.done = true;
                    return Some(Err(ParseError::Io(err)));
                }
            };

            match read {
                LineRead::Eof => {
                    self.done = true;
                }
                LineRead::TooLong => {
                    self.line += 1;
                    return Some(Err(ParseError::LineTooLong {
                        line: self.line,
                        limit: self.max_line_bytes,
                    }));
                }
                LineRead::Line => {
                    self.line += 1;
                    let text = self.buf.trim_ascii();
                    if text.is_empty() {
                        continue;
                    }
                    return Some(parse_json_line(text, self.line));
                }
            }
        }
        None
    }
}

fn parse_json_line(text: &[u8], line: u64) -> ParseItem {
    match serde_json::from_slice::<Value>(text) {
        Ok(Value::Object(map)) => Ok(ParsedRecord {
            row: line,
            record: RawRecord::from(map),
            column_mismatch: None,
        }),
        Ok(_) => Err(ParseError::Malformed {
            line,
            message: "expected a JSON object".to_string(),
        }),
        Err(err) => Err(ParseError::Malformed {
            line,
            message: err.to_string(),
        }),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Eof,
    Line,
    TooLong,
}

/// Reads one `\n`-terminated line into `buf` without ever holding more than
/// `limit` bytes of it. An overlong line is consumed and discarded.
fn read_bounded_line<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<LineRead> {
    let mut overflow = false;
    let mut read_any = false;

    loop {
        let available = match reader.fill_buf() {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        if available.is_empty() {
            return Ok(match (read_any, overflow) {
                (false, _) => LineRead::Eof,
                (true, true) => LineRead::TooLong,
                (true, false) => LineRead::Line,
            });
        }
        read_any = true;

        let newline = available.iter().position(|&b| b == b'\n');
        let chunk_len = newline.unwrap_or(available.len());

        if !overflow {
            if buf.len() + chunk_len > limit {
                overflow = true;
                buf.clear();
            } else {
                buf.extend_from_slice(&available[..chunk_len]);
            }
        }

        let consumed = chunk_len + usize::from(newline.is_some());
        reader.consume(consumed);

        if newline.is_some() {
            return Ok(if overflow {
                LineRead::TooLong
            } else {
                LineRead::Line
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(input: &str, format: Format, limit: usize) -> Vec<ParseItem> {
        RecordStream::new(Cursor::new(input.as_bytes().to_vec()), format, limit).collect()
    }

    fn records(items: &[ParseItem]) -> Vec<&ParsedRecord> {
        items.iter().filter_map(|i| i.as_ref().ok()).collect()
    }

    #[test]
    fn csv_rows_keyed_by_header() {
        let items = collect(
            "id,email,role\n1,a@x.io,admin\n2,b@x.io,reader\n",
            Format::Csv,
            MAX_LINE_BYTES,
        );
        let recs = records(&items);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].row, 2);
        assert_eq!(recs[0].record.text("email"), "a@x.io");
        assert_eq!(recs[1].row, 3);
        assert_eq!(recs[1].record.text("role"), "reader");
    }

    #[test]
    fn csv_short_row_padded_long_row_truncated() {
        let items = collect("a,b,c\n1\n1,2,3,4\n", Format::Csv, MAX_LINE_BYTES);
        let recs = records(&items);
        assert_eq!(recs.len(), 2);

        assert_eq!(recs[0].record.text("b"), "");
        assert_eq!(recs[0].record.text("c"), "");
        assert_eq!(
            recs[0].column_mismatch,
            Some(ColumnMismatch {
                expected: 3,
                found: 1
            })
        );

        assert_eq!(recs[1].record.len(), 3);
        assert_eq!(recs[1].record.text("c"), "3");
        assert!(recs[1].column_mismatch.is_some());
    }

    #[test]
    fn csv_quoted_multiline_field_keeps_start_line() {
        let items = collect(
            "id,body\n1,\"line one\nline two\"\n2,plain\n",
            Format::Csv,
            MAX_LINE_BYTES,
        );
        let recs = records(&items);
        assert_eq!(recs[0].record.text("body"), "line one\nline two");
        assert_eq!(recs[0].row, 2);
        assert_eq!(recs[1].row, 4);
    }

    #[test]
    fn csv_empty_input_yields_nothing() {
        assert!(collect("", Format::Csv, MAX_LINE_BYTES).is_empty());
        assert!(collect("id,email\n", Format::Csv, MAX_LINE_BYTES).is_empty());
    }

    #[test]
    fn csv_overlong_record_skipped() {
        let long = "x".repeat(64);
        let input = format!("id,body\n1,{}\n2,short\n", long);
        let items = collect(&input, Format::Csv, 32);
        assert!(matches!(
            items[0],
            Err(ParseError::LineTooLong { line: 2, .. })
        ));
        let recs = records(&items);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].record.text("id"), "2");
    }

    #[test]
    fn csv_huge_quoted_field_never_buffered() {
        // A quoted field far larger than the limit, spanning many lines.
        let huge = "z\n".repeat(5_000);
        let input = format!("id,body\n1,\"{}\"\n2,after\n", huge);
        let reader = io::BufReader::with_capacity(16, Cursor::new(input.into_bytes()));
        let items: Vec<ParseItem> = CsvRecords::new(reader, 64).collect();

        assert_eq!(items.len(), 2);
        assert!(matches!(
            items[0],
            Err(ParseError::LineTooLong { line: 2, limit: 64 })
        ));
        let rec = items[1].as_ref().unwrap();
        assert_eq!(rec.record.text("id"), "2");
        assert_eq!(rec.row, 5_003);
    }

    #[test]
    fn bounded_record_discards_overflow() {
        let mut reader = io::BufReader::with_capacity(4, Cursor::new(b"abcdefghij\nk\n".to_vec()));
        let mut buf = Vec::new();
        assert_eq!(
            read_bounded_record(&mut reader, &mut buf, 5).unwrap(),
            RecordRead::TooLong { lines: 1 }
        );
        assert!(buf.len() <= 5);

        buf.clear();
        assert_eq!(
            read_bounded_record(&mut reader, &mut buf, 5).unwrap(),
            RecordRead::Record { lines: 1 }
        );
        assert_eq!(buf, b"k");
    }

    #[test]
    fn bounded_record_counts_delimiters_and_quotes() {
        // Nine bytes on the wire, four of them field content.
        let mut reader = Cursor::new(b"\"ab\",\"cd\"\n".to_vec());
        let mut buf = Vec::new();
        assert_eq!(
            read_bounded_record(&mut reader, &mut buf, 6).unwrap(),
            RecordRead::TooLong { lines: 1 }
        );
    }

    #[test]
    fn csv_crlf_and_blank_lines() {
        let items = collect("id,name\r\n\r\n1,ann\r\n", Format::Csv, MAX_LINE_BYTES);
        let recs = records(&items);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].row, 3);
        assert_eq!(recs[0].record.text("name"), "ann");
    }

    #[test]
    fn csv_invalid_utf8_row_skipped() {
        let mut input = b"id,name\n1,ok\n2,".to_vec();
        input.extend_from_slice(&[0xff, 0xfe]);
        input.extend_from_slice(b"\n3,fine\n");
        let items: Vec<ParseItem> =
            RecordStream::new(Cursor::new(input), Format::Csv, MAX_LINE_BYTES).collect();
        let recs = records(&items);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].record.text("id"), "3");
        assert!(items
            .iter()
            .any(|i| matches!(i, Err(ParseError::Malformed { .. }))));
    }

    #[test]
    fn ndjson_skips_blank_and_reports_bad_lines() {
        let input = "{\"id\":\"a\"}\n\n   \nnot json\n[1,2]\n{\"id\":\"b\",\"tags\":[\"x\"]}\n";
        let items = collect(input, Format::Ndjson, MAX_LINE_BYTES);
        assert_eq!(items.len(), 4);

        let recs = records(&items);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].row, 1);
        assert_eq!(recs[1].row, 6);
        assert!(recs[1].record.get("tags").unwrap().is_array());

        let errors: Vec<&ParseError> = items.iter().filter_map(|i| i.as_ref().err()).collect();
        assert!(matches!(errors[0], ParseError::Malformed { line: 4, .. }));
        assert!(matches!(errors[1], ParseError::Malformed { line: 5, .. }));
    }

    #[test]
    fn ndjson_last_line_without_newline() {
        let items = collect("{\"id\":\"a\"}\r\n{\"id\":\"b\"}", Format::Ndjson, 1024);
        let recs = records(&items);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].record.text("id"), "b");
    }

    #[test]
    fn ndjson_overlong_line_discarded_and_stream_continues() {
        let long = format!("{{\"body\":\"{}\"}}", "y".repeat(100));
        let input = format!("{}\n{{\"id\":\"after\"}}\n", long);
        // Tiny BufReader capacity forces the line across many fill_buf calls.
        let reader = io::BufReader::with_capacity(8, Cursor::new(input.into_bytes()));
        let items: Vec<ParseItem> = NdjsonRecords::new(reader, 40).collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(
            items[0],
            Err(ParseError::LineTooLong { line: 1, limit: 40 })
        ));
        assert_eq!(items[1].as_ref().unwrap().record.text("id"), "after");
        assert_eq!(items[1].as_ref().unwrap().row, 2);
    }

    #[test]
    fn bounded_line_exact_limit_is_accepted() {
        let mut reader = Cursor::new(b"abcd\nrest".to_vec());
        let mut buf = Vec::new();
        assert_eq!(
            read_bounded_line(&mut reader, &mut buf, 4).unwrap(),
            LineRead::Line
        );
        assert_eq!(buf, b"abcd");
    }

    #[tokio::test]
    async fn spawned_parser_drains_through_channel() {
        let input = "id,email\n1,a@x.io\n2,b@x.io\n3,c@x.io\n";
        let mut rx = spawn_parser(
            Cursor::new(input.as_bytes().to_vec()),
            Format::Csv,
            MAX_LINE_BYTES,
            1,
        );
        let mut rows = Vec::new();
        while let Some(item) = rx.recv().await {
            rows.push(item.unwrap().row);
        }
        assert_eq!(rows, vec![2, 3, 4]);
    }
}
