use clap::Parser;
use futures_util::StreamExt;
use futures_util::stream;
use lib_markers::core::codec::{ColumnSpec, Row, Value};
use lib_markers::core::encoder::{EncodeOptions, OutputFormat, encode_stream};
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Measures export encoding throughput", long_about = None)]
struct Args {
    /// Number of synthetic rows to encode
    #[clap(short, long, default_value_t = 1_000_000)]
    rows: usize,

    /// Rows per emitted chunk
    #[clap(short, long, default_value_t = 500)]
    batch_rows: usize,

    /// Output format: csv or bin
    #[clap(short, long, default_value = "bin")]
    format: OutputFormat,
}

fn synthetic_row(i: usize) -> Row {
    vec![
        Value::from(format!("{:040x}", i)),
        Value::from((i % 7) as u16),
        Value::from(i % 3 == 0),
        Value::from(i as f32 * 0.5),
        Value::from((i % 600) as f32),
        Value::from((i % 100) as u16),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let columns = ColumnSpec::parse("userident,levelversion,practice,x,y,percentage")?;
    let source = stream::iter((0..args.rows).map(|i| Ok(synthetic_row(i))));

    let started = Instant::now();
    let mut chunks = 0usize;
    let mut bytes = 0usize;
    let mut encoded = encode_stream(
        source,
        columns,
        args.format,
        EncodeOptions::default().batch_rows(args.batch_rows),
    );
    while let Some(chunk) = encoded.next().await {
        let chunk = chunk?;
        chunks += 1;
        bytes += chunk.len();
    }
    let elapsed = started.elapsed();

    println!(
        "{} rows as {} in {:.2?}: {} chunks, {} bytes, {:.0} rows/s",
        args.rows,
        args.format,
        elapsed,
        chunks,
        bytes,
        args.rows as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
    );
    Ok(())
}
