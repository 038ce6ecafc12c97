//! Streaming delimited-text parser
//!
//! Turns a byte stream into a header row and batches of rows. Decoding,
//! record scanning and field splitting each run in a single pass; the only
//! suspension points are the chunk read and the awaited batch flush, which is
//! where a slow consumer applies backpressure.
//!
//! # Format
//!
//! - Fields are split on an unquoted delimiter (comma by default, tab, or
//!   sniffed from the header line).
//! - `"` opens and closes a quoted field; inside quotes `""` is a literal quote.
//! - Quoted fields may contain delimiters and raw line breaks.
//! - Records end at `\n` or `\r\n` outside quotes.
//! - Rows whose field count differs from the header are passed through as-is.

use async_trait::async_trait;
use gridstream_common::{GridError, Progress, Result, Row};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::decode::Utf8StreamDecoder;
use crate::source::ByteSource;

/// Default number of rows per flushed batch.
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Field delimiter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    #[default]
    Comma,
    Tab,
    /// Sniffed from the header record.
    Auto,
}

impl Delimiter {
    fn fixed(self) -> Option<char> {
        match self {
            Delimiter::Comma => Some(','),
            Delimiter::Tab => Some('\t'),
            Delimiter::Auto => None,
        }
    }
}

impl std::str::FromStr for Delimiter {
    type Err = GridError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "comma" | "," => Ok(Delimiter::Comma),
            "tab" | "\\t" | "\t" => Ok(Delimiter::Tab),
            "auto" => Ok(Delimiter::Auto),
            _ => Err(GridError::config(format!("Invalid delimiter: {s}"))),
        }
    }
}

/// Options for one parse operation.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Rows per flushed batch.
    pub batch_size: usize,
    /// Total byte size for progress, overriding what the source declares.
    pub total_bytes: Option<u64>,
    pub delimiter: Delimiter,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            total_bytes: None,
            delimiter: Delimiter::default(),
        }
    }
}

/// Consumer of parser output.
///
/// `on_rows` is awaited before the parser reads any further input, so a sink
/// that suspends there throttles the whole pipeline.
#[async_trait]
pub trait RowSink: Send {
    /// Called exactly once, with the first record, even when it is empty.
    async fn on_columns(&mut self, columns: Row) -> Result<()>;

    /// Called with each full batch and with the final partial batch.
    async fn on_rows(&mut self, rows: Vec<Row>) -> Result<()>;

    /// Called after each chunk has been consumed.
    fn on_progress(&mut self, _progress: Progress) {}
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectingSink {
    pub columns: Option<Row>,
    pub rows: Vec<Row>,
    pub batches: usize,
    pub last_progress: Option<Progress>,
}

#[async_trait]
impl RowSink for CollectingSink {
    async fn on_columns(&mut self, columns: Row) -> Result<()> {
        self.columns = Some(columns);
        Ok(())
    }

    async fn on_rows(&mut self, rows: Vec<Row>) -> Result<()> {
        self.batches += 1;
        self.rows.extend(rows);
        Ok(())
    }

    fn on_progress(&mut self, progress: Progress) {
        self.last_progress = Some(progress);
    }
}

/// Outcome of a completed parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseSummary {
    pub columns: Row,
    pub rows: u64,
    pub batches: u64,
    pub bytes_loaded: u64,
    /// Rows whose field count differs from the header.
    pub ragged_rows: u64,
    /// Invalid UTF-8 sequences replaced during decoding.
    pub malformed_sequences: u64,
    /// The stream ended inside a quoted field.
    pub unterminated_quote: bool,
    pub delimiter: Option<char>,
}

/// Split one complete record into fields.
///
/// Quotes toggle quoting wherever they appear; inside quotes a doubled quote
/// is a literal `"`. An empty record yields a single empty field.
pub fn parse_line(record: &str, delimiter: char) -> Row {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = record.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                field.push('"');
                chars.next();
            } else {
                in_quotes = !in_quotes;
            }
        } else if c == delimiter && !in_quotes {
            fields.push(std::mem::take(&mut field));
        } else {
            field.push(c);
        }
    }

    fields.push(field);
    fields
}

/// Pick comma or tab by counting unquoted occurrences in `sample`.
///
/// Tab wins only when strictly more frequent.
pub fn sniff_delimiter(sample: &str) -> char {
    let mut in_quotes = false;
    let (mut commas, mut tabs) = (0usize, 0usize);

    for c in sample.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => commas += 1,
            '\t' if !in_quotes => tabs += 1,
            _ => {},
        }
    }

    if tabs > commas {
        '\t'
    } else {
        ','
    }
}

/// Splits decoded text into records at unquoted line terminators.
///
/// Text after the last boundary is carried until more input or end of stream.
#[derive(Debug, Default)]
pub struct RecordScanner {
    carry: String,
    /// Byte offset in `carry` up to which quote state is already known.
    scanned: usize,
    in_quotes: bool,
}

impl RecordScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while an opened quoted field has not been closed.
    pub fn in_quotes(&self) -> bool {
        self.in_quotes
    }

    /// Append `text` and move every completed record into `records`.
    pub fn push(&mut self, text: &str, records: &mut Vec<String>) {
        self.carry.push_str(text);

        // Quote and newline are ASCII, so byte scanning never lands inside a
        // multi-byte character. A doubled quote toggles twice, which leaves
        // the boundary decision unchanged.
        let bytes = self.carry.as_bytes();
        let mut record_start = 0;
        for (i, &b) in bytes.iter().enumerate().skip(self.scanned) {
            match b {
                b'"' => self.in_quotes = !self.in_quotes,
                b'\n' if !self.in_quotes => {
                    let end = if i > record_start && bytes[i - 1] == b'\r' {
                        i - 1
                    } else {
                        i
                    };
                    records.push(self.carry[record_start..end].to_string());
                    record_start = i + 1;
                },
                _ => {},
            }
        }

        self.carry.drain(..record_start);
        self.scanned = self.carry.len();
    }

    /// Take the unterminated final record, if any, and whether it ended
    /// inside quotes.
    pub fn finish(&mut self) -> Option<(String, bool)> {
        let unterminated = self.in_quotes;
        self.in_quotes = false;
        self.scanned = 0;

        let mut rest = std::mem::take(&mut self.carry);
        if !unterminated && rest.ends_with('\r') {
            rest.pop();
        }

        if rest.is_empty() {
            None
        } else {
            Some((rest, unterminated))
        }
    }
}

/// What happened to a completed record.
enum Accepted {
    Header(Row),
    Buffered,
    BatchReady(Vec<Row>),
    Skipped,
}

/// Per-load parser state; owned by one `parse_stream` call.
struct ParseState {
    scanner: RecordScanner,
    delimiter_choice: Delimiter,
    delimiter: Option<char>,
    header_width: Option<usize>,
    batch_size: usize,
    pending_batch: Vec<Row>,
    summary: ParseSummary,
}

impl ParseState {
    fn new(options: &ParseOptions) -> Self {
        Self {
            scanner: RecordScanner::new(),
            delimiter_choice: options.delimiter,
            delimiter: options.delimiter.fixed(),
            header_width: None,
            batch_size: options.batch_size.max(1),
            pending_batch: Vec::with_capacity(options.batch_size.clamp(1, DEFAULT_BATCH_SIZE)),
            summary: ParseSummary::default(),
        }
    }

    fn accept(&mut self, record: String) -> Accepted {
        let Some(width) = self.header_width else {
            let delimiter = match self.delimiter {
                Some(d) => d,
                None => {
                    let sniffed = sniff_delimiter(&record);
                    debug!(delimiter = ?sniffed, choice = ?self.delimiter_choice, "Sniffed delimiter");
                    self.delimiter = Some(sniffed);
                    sniffed
                },
            };
            let header = parse_line(&record, delimiter);
            self.header_width = Some(header.len());
            self.summary.columns = header.clone();
            self.summary.delimiter = Some(delimiter);
            return Accepted::Header(header);
        };

        if record.is_empty() {
            return Accepted::Skipped;
        }

        let row = parse_line(&record, self.delimiter.unwrap_or(','));
        if row.len() != width {
            self.summary.ragged_rows += 1;
        }
        self.pending_batch.push(row);
        self.summary.rows += 1;

        if self.pending_batch.len() >= self.batch_size {
            Accepted::BatchReady(self.take_batch())
        } else {
            Accepted::Buffered
        }
    }

    fn take_batch(&mut self) -> Vec<Row> {
        std::mem::replace(
            &mut self.pending_batch,
            Vec::with_capacity(self.batch_size.min(DEFAULT_BATCH_SIZE)),
        )
    }
}

async fn dispatch<K: RowSink + ?Sized>(
    state: &mut ParseState,
    record: String,
    sink: &mut K,
    cancel: &CancellationToken,
) -> Result<()> {
    match state.accept(record) {
        Accepted::Header(header) => sink.on_columns(header).await,
        Accepted::BatchReady(batch) => flush(state, batch, sink, cancel).await,
        Accepted::Buffered | Accepted::Skipped => Ok(()),
    }
}

async fn flush<K: RowSink + ?Sized>(
    state: &mut ParseState,
    batch: Vec<Row>,
    sink: &mut K,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(GridError::Cancelled);
    }

    state.summary.batches += 1;
    debug!(rows = batch.len(), batch = state.summary.batches, "Flushing batch");
    sink.on_rows(batch).await
}

/// Parse `source` to completion, feeding `sink`.
///
/// Cancellation is observed before every read and every flush, and an
/// in-progress read is abandoned as soon as the token fires. Rows flushed
/// before cancellation stay delivered.
#[instrument(skip_all, fields(batch_size = options.batch_size, delimiter = ?options.delimiter))]
pub async fn parse_stream<S, K>(
    source: &mut S,
    sink: &mut K,
    options: &ParseOptions,
    cancel: &CancellationToken,
) -> Result<ParseSummary>
where
    S: ByteSource + ?Sized,
    K: RowSink + ?Sized,
{
    let total = options.total_bytes.or_else(|| source.total_size());
    let mut decoder = Utf8StreamDecoder::new();
    let mut state = ParseState::new(options);
    let mut records = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Err(GridError::Cancelled);
        }

        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GridError::Cancelled),
            chunk = source.next_chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            break;
        };

        state.summary.bytes_loaded += chunk.len() as u64;
        let text = decoder.decode(&chunk);
        drop(chunk);

        state.scanner.push(&text, &mut records);
        for record in records.drain(..) {
            dispatch(&mut state, record, sink, cancel).await?;
        }

        sink.on_progress(Progress::new(state.summary.bytes_loaded, total));
    }

    let tail = decoder.finish();
    state.scanner.push(&tail, &mut records);
    for record in records.drain(..) {
        dispatch(&mut state, record, sink, cancel).await?;
    }

    if let Some((rest, unterminated)) = state.scanner.finish() {
        if unterminated {
            warn!(
                carried_bytes = rest.len(),
                "Stream ended inside a quoted field, parsing remainder literally"
            );
            state.summary.unterminated_quote = true;
        }
        dispatch(&mut state, rest, sink, cancel).await?;
    }

    if !state.pending_batch.is_empty() {
        let batch = state.take_batch();
        flush(&mut state, batch, sink, cancel).await?;
    }

    state.summary.malformed_sequences = decoder.malformed_sequences();
    if state.summary.ragged_rows > 0 {
        debug!(ragged_rows = state.summary.ragged_rows, "Rows with irregular field counts");
    }

    Ok(state.summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn scan_all(pieces: &[&str]) -> (Vec<String>, Option<(String, bool)>) {
        let mut scanner = RecordScanner::new();
        let mut records = Vec::new();
        for piece in pieces {
            scanner.push(piece, &mut records);
        }
        let rest = scanner.finish();
        (records, rest)
    }

    #[test]
    fn test_parse_line_plain() {
        assert_eq!(parse_line("a,b,c", ','), vec!["a", "b", "c"]);
        assert_eq!(parse_line("a,,c,", ','), vec!["a", "", "c", ""]);
        assert_eq!(parse_line("", ','), vec![""]);
    }

    #[test]
    fn test_parse_line_quoted() {
        assert_eq!(
            parse_line("\"hello, world\",42", ','),
            vec!["hello, world", "42"]
        );
        assert_eq!(parse_line("\"a,b\nc\"\"d\"", ','), vec!["a,b\nc\"d"]);
        assert_eq!(parse_line("\"\"", ','), vec![""]);
        assert_eq!(parse_line("\"\"\"\"", ','), vec!["\""]);
    }

    #[test]
    fn test_parse_line_quotes_toggle_mid_field() {
        // Unlike RFC 4180 readers, a quote opens quoting even mid-field.
        assert_eq!(parse_line("a\"b,c\"d", ','), vec!["ab,cd"]);
        assert_eq!(parse_line("x,a\"b\"c", ','), vec!["x", "abc"]);
    }

    #[test]
    fn test_scanner_mid_field_quote_spans_lines() {
        let (records, rest) = scan_all(&["a\"b\nc", "\"d\ne\n"]);
        assert_eq!(records, vec!["a\"b\nc\"d", "e"]);
        assert!(rest.is_none());
    }

    #[test]
    fn test_parse_line_tab() {
        assert_eq!(parse_line("a\tb,c", '\t'), vec!["a", "b,c"]);
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(sniff_delimiter("a,b,c"), ',');
        assert_eq!(sniff_delimiter("a\tb\tc"), '\t');
        assert_eq!(sniff_delimiter("\"x,y,z\"\tb\tc"), '\t');
        assert_eq!(sniff_delimiter("a\tb,c"), ',');
        assert_eq!(sniff_delimiter("single"), ',');
    }

    #[test]
    fn test_scanner_boundaries() {
        let (records, rest) = scan_all(&["a,b\r\n1,", "2\n3"]);
        assert_eq!(records, vec!["a,b", "1,2"]);
        assert_eq!(rest, Some(("3".to_string(), false)));
    }

    #[test]
    fn test_scanner_crlf_split_between_chunks() {
        let (records, rest) = scan_all(&["a,b\r", "\n1,2\r"]);
        assert_eq!(records, vec!["a,b"]);
        assert_eq!(rest, Some(("1,2".to_string(), false)));
    }

    #[test]
    fn test_scanner_newline_inside_quotes() {
        let (records, rest) = scan_all(&["x\n\"multi", "\nline\",2\n"]);
        assert_eq!(records, vec!["x", "\"multi\nline\",2"]);
        assert_eq!(rest, None);
    }

    #[test]
    fn test_scanner_escaped_quote_split_between_chunks() {
        let (records, _) = scan_all(&["\"a\"", "\"b\"\n"]);
        assert_eq!(records, vec!["\"a\"\"b\""]);
    }

    #[test]
    fn test_scanner_unterminated_quote() {
        let (records, rest) = scan_all(&["h\n\"open,field\n"]);
        assert_eq!(records, vec!["h"]);
        assert_eq!(rest, Some(("\"open,field\n".to_string(), true)));
    }

    #[test]
    fn test_delimiter_from_str() {
        assert_eq!("tab".parse::<Delimiter>().unwrap(), Delimiter::Tab);
        assert_eq!("AUTO".parse::<Delimiter>().unwrap(), Delimiter::Auto);
        assert!("pipe".parse::<Delimiter>().is_err());
    }
}
