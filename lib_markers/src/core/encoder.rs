//! # Streaming Row Encoder
//!
//! Turns a lazy sequence of rows into CSV text or the compact binary export
//! format, one bounded batch at a time. Nothing is pre-computed: a chunk is
//! only built when the consumer asks for the next one, so memory use stays at
//! `O(batch_rows)` no matter how many rows the source yields.
//!
//! ## Producers
//!
//! - [`EncodeIter`] pulls from a plain `Iterator` and is itself an
//!   `Iterator` of chunks.
//! - [`EncodeStream`] pulls from a `futures` `Stream` (for example a database
//!   cursor) and is itself a `Stream` of chunks, ready to be used as an HTTP
//!   response body.
//!
//! Both share the same batch writer, so chunking never changes content,
//! only emission granularity.
//!
//! ## Framing
//!
//! - **CSV**: the header line, then one line per row. Lines are separated by
//!   `\n` and the output carries no trailing newline.
//! - **Binary**: one version byte ([`BINARY_VERSION`]) followed by rows laid
//!   out back to back, each exactly [`ColumnSpec::row_width`] bytes.
//!
//! The preamble (header or version byte) is prepended to the first chunk and
//! does not count toward the batch size. Every chunk holds whole rows.
//!
//! ## Failure and cancellation
//!
//! On any error the pending batch is discarded, the source is dropped, one
//! `Err` item is yielded and the producer is fused. Dropping an
//! [`EncodeStream`] drops its source too, which is how a disconnected client
//! releases a database cursor; an optional `CancellationToken` ends the
//! stream early from the outside.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::core::codec::{ColumnSpec, Row};
use crate::core::error::ExportError;

/// Version tag written as the first byte of every binary export.
pub const BINARY_VERSION: u8 = 1;

/// Rows per emitted chunk unless configured otherwise.
pub const DEFAULT_BATCH_ROWS: usize = 500;

/// Upper bound on the buffer reserved up front; larger batches grow on demand.
const MAX_PREALLOC: usize = 64 * 1024;

/// A per-row rewrite applied before encoding, e.g. identifier anonymisation.
pub type RowTransform = Box<dyn FnMut(Row) -> Row + Send>;

/// # Output Format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Comma separated text.
    Csv,
    /// Versioned fixed-width little-endian rows.
    Binary,
}

impl OutputFormat {
    /// Parses the `response` query value used by the export routes
    /// (`csv` or `bin`).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "csv" => Some(OutputFormat::Csv),
            "bin" => Some(OutputFormat::Binary),
            _ => None,
        }
    }

    /// HTTP content type of the encoded body.
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Csv => "text/csv",
            OutputFormat::Binary => "application/octet-stream",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutputFormat::parse(s).ok_or_else(|| format!("unsupported response format `{s}`"))
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Binary => "bin",
        })
    }
}

/// # Encode Options
///
/// Tuning knobs for one encode call. The defaults match the export routes:
/// batches of [`DEFAULT_BATCH_ROWS`], no transform, no external cancellation.
pub struct EncodeOptions {
    /// Rows accumulated before a chunk is emitted. Zero is treated as one.
    pub batch_rows: usize,
    /// Applied to every row before it is encoded.
    pub transform: Option<RowTransform>,
    /// Ends the stream with [`ExportError::Cancelled`] once cancelled.
    pub cancel: Option<CancellationToken>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            batch_rows: DEFAULT_BATCH_ROWS,
            transform: None,
            cancel: None,
        }
    }
}

impl EncodeOptions {
    /// Sets the batch size.
    pub fn batch_rows(mut self, batch_rows: usize) -> Self {
        self.batch_rows = batch_rows;
        self
    }

    /// Sets the per-row transform.
    pub fn transform(mut self, transform: impl FnMut(Row) -> Row + Send + 'static) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    /// Ties the stream to a cancellation token.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl fmt::Debug for EncodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodeOptions")
            .field("batch_rows", &self.batch_rows)
            .field("transform", &self.transform.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// # Batch Writer
///
/// The format-aware accumulator behind both producers. Rows are pushed one at
/// a time; a chunk comes back whenever the batch fills up.
struct BatchWriter {
    columns: ColumnSpec,
    format: OutputFormat,
    batch_rows: usize,
    transform: Option<RowTransform>,
    buf: BytesMut,
    pending: usize,
    emitted_any: bool,
    rows_total: u64,
    bytes_total: u64,
}

impl BatchWriter {
    fn new(
        columns: ColumnSpec,
        format: OutputFormat,
        batch_rows: usize,
        transform: Option<RowTransform>,
    ) -> Self {
        let batch_rows = batch_rows.max(1);
        let mut buf = match format {
            // Binary rows have a known width; text rows are estimated.
            OutputFormat::Binary => BytesMut::with_capacity(
                batch_rows
                    .saturating_mul(columns.row_width())
                    .saturating_add(1)
                    .min(MAX_PREALLOC),
            ),
            OutputFormat::Csv => BytesMut::with_capacity(batch_rows.saturating_mul(32).min(MAX_PREALLOC)),
        };
        match format {
            OutputFormat::Csv => buf.put_slice(columns.header().as_bytes()),
            OutputFormat::Binary => buf.put_u8(BINARY_VERSION),
        }
        Self {
            columns,
            format,
            batch_rows,
            transform,
            buf,
            pending: 0,
            emitted_any: false,
            rows_total: 0,
            bytes_total: 0,
        }
    }

    /// Encodes one row. Returns a chunk when the batch is full.
    fn push(&mut self, row: Row) -> Result<Option<Bytes>, ExportError> {
        let row = match self.transform.as_mut() {
            Some(transform) => transform(row),
            None => row,
        };
        match self.format {
            OutputFormat::Csv => {
                let start = self.buf.len();
                self.buf.put_u8(b'\n');
                if let Err(err) = self.columns.render_row(&row, &mut self.buf) {
                    self.buf.truncate(start);
                    return Err(err);
                }
            }
            OutputFormat::Binary => self.columns.encode_row(&row, &mut self.buf)?,
        }
        self.pending += 1;
        self.rows_total += 1;
        if self.pending >= self.batch_rows {
            return Ok(Some(self.take()));
        }
        Ok(None)
    }

    /// Flushes the final partial batch. A source with no rows still yields
    /// the preamble.
    fn finish(&mut self) -> Option<Bytes> {
        if self.pending > 0 || !self.emitted_any {
            return Some(self.take());
        }
        None
    }

    fn discard(&mut self) {
        self.buf.clear();
        self.pending = 0;
    }

    fn take(&mut self) -> Bytes {
        self.pending = 0;
        self.emitted_any = true;
        let chunk = self.buf.split().freeze();
        self.bytes_total += chunk.len() as u64;
        chunk
    }
}

/// # Iterator Producer
///
/// Encodes rows from a synchronous source. Each `next()` pulls at most one
/// batch from the source.
pub struct EncodeIter<I> {
    rows: Option<I>,
    writer: BatchWriter,
    cancel: Option<CancellationToken>,
}

impl<I> EncodeIter<I> {
    fn fail(&mut self, err: ExportError) -> Option<Result<Bytes, ExportError>> {
        self.rows = None;
        self.writer.discard();
        Some(Err(err))
    }
}

impl<I> Iterator for EncodeIter<I>
where
    I: Iterator<Item = Row>,
{
    type Item = Result<Bytes, ExportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) && self.rows.is_some() {
            return self.fail(ExportError::Cancelled);
        }
        let rows = self.rows.as_mut()?;
        loop {
            match rows.next() {
                Some(row) => match self.writer.push(row) {
                    Ok(Some(chunk)) => return Some(Ok(chunk)),
                    Ok(None) => {}
                    Err(err) => return self.fail(err),
                },
                None => {
                    self.rows = None;
                    return self.writer.finish().map(Ok);
                }
            }
        }
    }
}

/// # Stream Producer
///
/// Encodes rows from an asynchronous, fallible source. The source is boxed
/// and pinned so the producer itself is `Unpin` and can be moved into an
/// HTTP body.
pub struct EncodeStream<S> {
    source: Option<Pin<Box<S>>>,
    writer: BatchWriter,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl<S> EncodeStream<S> {
    fn fail(&mut self, err: ExportError) -> Poll<Option<Result<Bytes, ExportError>>> {
        self.source = None;
        self.cancelled = None;
        self.writer.discard();
        debug!(rows = self.writer.rows_total, error = %err, "export stream failed");
        Poll::Ready(Some(Err(err)))
    }
}

impl<S> Stream for EncodeStream<S>
where
    S: Stream<Item = Result<Row, ExportError>>,
{
    type Item = Result<Bytes, ExportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.source.is_none() {
            return Poll::Ready(None);
        }
        if let Some(cancelled) = this.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                return this.fail(ExportError::Cancelled);
            }
        }
        loop {
            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(None);
            };
            match source.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(row))) => match this.writer.push(row) {
                    Ok(Some(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                    Ok(None) => {}
                    Err(err) => return this.fail(err),
                },
                Poll::Ready(Some(Err(err))) => return this.fail(err),
                Poll::Ready(None) => {
                    this.source = None;
                    this.cancelled = None;
                    let last = this.writer.finish();
                    debug!(
                        rows = this.writer.rows_total,
                        bytes = this.writer.bytes_total,
                        "export stream finished"
                    );
                    return Poll::Ready(last.map(Ok));
                }
            }
        }
    }
}

/// Encodes a synchronous row source.
pub fn encode_iter<I>(
    rows: I,
    columns: ColumnSpec,
    format: OutputFormat,
    options: EncodeOptions,
) -> EncodeIter<I::IntoIter>
where
    I: IntoIterator<Item = Row>,
{
    EncodeIter {
        rows: Some(rows.into_iter()),
        writer: BatchWriter::new(columns, format, options.batch_rows, options.transform),
        cancel: options.cancel,
    }
}

/// Encodes an asynchronous row source.
pub fn encode_stream<S>(
    rows: S,
    columns: ColumnSpec,
    format: OutputFormat,
    options: EncodeOptions,
) -> EncodeStream<S>
where
    S: Stream<Item = Result<Row, ExportError>>,
{
    EncodeStream {
        source: Some(Box::pin(rows)),
        writer: BatchWriter::new(columns, format, options.batch_rows, options.transform),
        cancelled: options.cancel.map(|token| Box::pin(token.cancelled_owned())),
    }
}

/// Encodes a synchronous source into one contiguous buffer.
///
/// # Errors
/// The first error the encoder hits.
pub fn encode_to_vec<I>(
    rows: I,
    columns: ColumnSpec,
    format: OutputFormat,
) -> Result<Vec<u8>, ExportError>
where
    I: IntoIterator<Item = Row>,
{
    let mut out = Vec::new();
    for chunk in encode_iter(rows, columns, format, EncodeOptions::default()) {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
