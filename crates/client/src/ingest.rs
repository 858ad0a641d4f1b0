//! Bulk ingest of delimited and JSON-lines files.
//!
//! Every input line is parsed into raw cells, checked against the table arity and converted
//! by the table schema. A line that fails any step is skipped with a [`RowDiagnostic`]; the
//! converted rows are submitted in batches. A failed batch is logged and reported, batches
//! that were already submitted stay committed, and ingest carries on with the next batch.

use std::future::Future;
use std::io::BufRead;

use dtx_common::{DtxError, Result, Tuple, TupleSchema, global_metrics};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Splits one input line into raw cells.
pub trait RecordParser {
    fn name(&self) -> &'static str;

    /// `Ok(None)` for lines that carry no record, such as blanks.
    fn parse_line(&self, line: &str) -> Result<Option<Vec<serde_json::Value>>>;

    /// Lines to skip at the start of the input.
    fn header_lines(&self) -> usize {
        0
    }
}

/// Character-separated values; every cell is handed to the schema as text.
#[derive(Debug, Clone)]
pub struct DelimitedParser {
    delimiter: char,
    has_header: bool,
}

impl DelimitedParser {
    pub fn new(delimiter: char, has_header: bool) -> Self {
        Self {
            delimiter,
            has_header,
        }
    }

    pub fn csv() -> Self {
        Self::new(',', false)
    }
}

impl RecordParser for DelimitedParser {
    fn name(&self) -> &'static str {
        "delimited"
    }

    fn parse_line(&self, line: &str) -> Result<Option<Vec<serde_json::Value>>> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(
            line.split(self.delimiter)
                .map(|cell| serde_json::Value::String(cell.trim().to_string()))
                .collect(),
        ))
    }

    fn header_lines(&self) -> usize {
        usize::from(self.has_header)
    }
}

/// One JSON value per line: an array of cells in column order, or an object keyed by
/// column name (missing columns are null).
#[derive(Debug, Clone)]
pub struct JsonLinesParser {
    columns: Vec<String>,
}

impl JsonLinesParser {
    pub fn for_schema(schema: &TupleSchema) -> Self {
        Self {
            columns: schema.columns.iter().map(|c| c.name.clone()).collect(),
        }
    }
}

impl RecordParser for JsonLinesParser {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn parse_line(&self, line: &str) -> Result<Option<Vec<serde_json::Value>>> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| DtxError::Execution(format!("invalid json: {e}")))?;
        match value {
            serde_json::Value::Array(cells) => Ok(Some(cells)),
            serde_json::Value::Object(mut fields) => Ok(Some(
                self.columns
                    .iter()
                    .map(|c| fields.remove(c).unwrap_or(serde_json::Value::Null))
                    .collect(),
            )),
            other => Err(DtxError::Execution(format!(
                "expected a json array or object, got {other}"
            ))),
        }
    }
}

/// Destination of converted batches.
pub trait InsertSink {
    /// Inserts all of `rows` or none of them; returns the number of distinct keys written.
    fn insert_batch(&self, rows: &[Tuple]) -> impl Future<Output = Result<usize>>;
}

/// A skipped input line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowDiagnostic {
    /// 1-based input line.
    pub line: usize,
    pub reason: String,
}

/// A batch the sink rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub first_line: usize,
    pub rows: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Rows inserted by successful batches.
    pub accepted: usize,
    pub skipped: Vec<RowDiagnostic>,
    pub failed_batches: Vec<BatchFailure>,
}

impl IngestReport {
    /// Rows that were converted but lost with a failed batch.
    pub fn rejected_rows(&self) -> usize {
        self.failed_batches.iter().map(|b| b.rows).sum()
    }
}

/// Outcome of converting one line.
enum LineOutcome {
    Row(Tuple),
    Skip(String),
    Empty,
}

pub struct Ingestor<'a, S> {
    table: &'a str,
    schema: &'a TupleSchema,
    sink: &'a S,
    batch_rows: usize,
}

impl<'a, S: InsertSink> Ingestor<'a, S> {
    pub fn new(table: &'a str, schema: &'a TupleSchema, sink: &'a S, batch_rows: usize) -> Self {
        Self {
            table,
            schema,
            sink,
            batch_rows: batch_rows.max(1),
        }
    }

    fn convert(&self, parser: &dyn RecordParser, line: &str) -> LineOutcome {
        let raw = match parser.parse_line(line) {
            Ok(Some(raw)) => raw,
            Ok(None) => return LineOutcome::Empty,
            Err(e) => return LineOutcome::Skip(e.to_string()),
        };
        if raw.len() != self.schema.arity() {
            return LineOutcome::Skip(format!(
                "expected {} cells, found {}",
                self.schema.arity(),
                raw.len()
            ));
        }
        match self.schema.parse(&raw) {
            Ok(row) => LineOutcome::Row(row),
            Err(e) => LineOutcome::Skip(e.to_string()),
        }
    }

    /// Reads `input` to the end. Never fails; every problem is in the report.
    ///
    /// A line that is not valid UTF-8 is skipped like any other bad line; only an I/O error
    /// ends the input early.
    pub async fn ingest(&self, parser: &dyn RecordParser, mut input: impl BufRead) -> IngestReport {
        let mut report = IngestReport::default();
        let mut batch = Vec::with_capacity(self.batch_rows);
        let mut batch_start = 0;
        let mut buf = Vec::new();
        for idx in 0.. {
            let line_no = idx + 1;
            buf.clear();
            match input.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(table = self.table, line = line_no, error = %e, "input read failed");
                    report.skipped.push(RowDiagnostic {
                        line: line_no,
                        reason: format!("read failed: {e}"),
                    });
                    break;
                }
            }
            if idx < parser.header_lines() {
                continue;
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
            }
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(e) => {
                    debug!(table = self.table, line = line_no, error = %e, "row skipped");
                    report.skipped.push(RowDiagnostic {
                        line: line_no,
                        reason: format!("invalid utf-8: {e}"),
                    });
                    continue;
                }
            };
            match self.convert(parser, line) {
                LineOutcome::Row(row) => {
                    if batch.is_empty() {
                        batch_start = line_no;
                    }
                    batch.push(row);
                }
                LineOutcome::Skip(reason) => {
                    debug!(table = self.table, line = line_no, %reason, "row skipped");
                    report.skipped.push(RowDiagnostic {
                        line: line_no,
                        reason,
                    });
                }
                LineOutcome::Empty => {}
            }
            if batch.len() >= self.batch_rows {
                self.submit(&mut batch, batch_start, &mut report).await;
            }
        }
        if !batch.is_empty() {
            self.submit(&mut batch, batch_start, &mut report).await;
        }
        global_metrics().record_ingest(
            self.table,
            report.accepted as u64,
            report.skipped.len() as u64,
        );
        info!(
            table = self.table,
            parser = parser.name(),
            accepted = report.accepted,
            skipped = report.skipped.len(),
            failed_batches = report.failed_batches.len(),
            "ingest finished"
        );
        report
    }

    async fn submit(&self, batch: &mut Vec<Tuple>, first_line: usize, report: &mut IngestReport) {
        let rows = std::mem::take(batch);
        match self.sink.insert_batch(&rows).await {
            Ok(n) => report.accepted += n,
            Err(e) => {
                warn!(
                    table = self.table,
                    first_line,
                    rows = rows.len(),
                    error = %e,
                    "batch insert failed"
                );
                report.failed_batches.push(BatchFailure {
                    first_line,
                    rows: rows.len(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use dtx_common::{ColumnDef, DataType, DtxError, Result, Tuple, TupleSchema, Value};

    use super::{DelimitedParser, IngestReport, Ingestor, InsertSink, JsonLinesParser, RecordParser};

    #[derive(Default)]
    struct Collect {
        batches: RefCell<Vec<Vec<Tuple>>>,
        fail_batch: Option<usize>,
    }

    impl InsertSink for Collect {
        async fn insert_batch(&self, rows: &[Tuple]) -> Result<usize> {
            let n = self.batches.borrow().len();
            self.batches.borrow_mut().push(rows.to_vec());
            if self.fail_batch == Some(n) {
                return Err(DtxError::Execution("store unavailable".to_string()));
            }
            Ok(rows.len())
        }
    }

    fn schema() -> TupleSchema {
        TupleSchema::new(vec![
            ColumnDef::key("id", DataType::Int64),
            ColumnDef::new("name", DataType::Utf8),
            ColumnDef::new("score", DataType::Float64),
        ])
    }

    fn run(sink: &Collect, parser: &dyn RecordParser, input: &str, batch: usize) -> IngestReport {
        let schema = schema();
        let ingestor = Ingestor::new("t", &schema, sink, batch);
        block_on(ingestor.ingest(parser, input.as_bytes()))
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(f)
    }

    #[test]
    fn every_line_is_either_converted_or_diagnosed() {
        let sink = Collect::default();
        let input = "1,ann,1.5\n2,bob\n\nx,cid,2\n4,dan,\n5,eve,3,extra\n";
        let report = run(&sink, &DelimitedParser::csv(), input, 10);
        assert_eq!(report.accepted, 2);
        assert_eq!(
            report.skipped.iter().map(|d| d.line).collect::<Vec<_>>(),
            vec![2, 4, 6]
        );
        let rows = sink.batches.borrow().concat();
        assert_eq!(rows[1], vec![Value::Int64(4), Value::Utf8("dan".into()), Value::Null]);
    }

    #[test]
    fn failed_batches_do_not_undo_earlier_ones() {
        let sink = Collect {
            fail_batch: Some(1),
            ..Collect::default()
        };
        let input = (1..=5)
            .map(|i| format!("{i},n{i},{i}.0"))
            .collect::<Vec<_>>()
            .join("\n");
        let report = run(&sink, &DelimitedParser::csv(), &input, 2);
        assert_eq!(sink.batches.borrow().len(), 3);
        assert_eq!(report.accepted, 3);
        assert_eq!(report.failed_batches.len(), 1);
        assert_eq!(report.failed_batches[0].first_line, 3);
        assert_eq!(report.rejected_rows(), 2);
    }

    #[test]
    fn json_lines_accept_arrays_and_objects() {
        let sink = Collect::default();
        let parser = JsonLinesParser::for_schema(&schema());
        let input = "[1, \"a\", 0.5]\n{\"id\": 2, \"name\": \"b\"}\nnot json\n\"scalar\"\n";
        let report = run(&sink, &parser, input, 10);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.skipped.len(), 2);
        let rows = sink.batches.borrow().concat();
        assert_eq!(rows[1][2], Value::Null);
    }

    #[test]
    fn invalid_utf8_lines_are_skipped_without_ending_the_input() {
        let sink = Collect::default();
        let schema = TupleSchema::new(vec![
            ColumnDef::key("id", DataType::Int64),
            ColumnDef::new("name", DataType::Utf8),
        ]);
        let ingestor = Ingestor::new("t", &schema, &sink, 10);
        let input: &[u8] = b"1,a\n2,\xff\xfe\n3,c\r\n4,d";
        let report = block_on(ingestor.ingest(&DelimitedParser::csv(), input));
        assert_eq!(report.accepted, 3);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].line, 2);
        assert!(report.skipped[0].reason.starts_with("invalid utf-8"));
        let rows = sink.batches.borrow().concat();
        assert_eq!(rows[2], vec![Value::Int64(4), Value::Utf8("d".into())]);
    }

    #[test]
    fn header_lines_are_skipped() {
        let sink = Collect::default();
        let parser = DelimitedParser::new('|', true);
        let report = run(&sink, &parser, "id|name|score\n1|a|2\n", 10);
        assert_eq!(report.accepted, 1);
        assert!(report.skipped.is_empty());
    }
}
