//! End-to-end export scenarios: a store hands out rows, the encoder turns them
//! into the wire formats a client would download.

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use lib_markers::core::anonymize::Anonymizer;
use lib_markers::core::codec::{ColumnSpec, Row, Value};
use lib_markers::core::encoder::{EncodeOptions, OutputFormat, encode_iter, encode_stream};
use lib_markers::core::error::ExportError;
use lib_markers::store::dummy::DUMMY_IDENT;
use lib_markers::store::{
    ANALYSIS_COLUMNS, DummyStore, ListQuery, MarkerStore, Submission, parse_submission,
};
use tokio_util::sync::CancellationToken;

async fn collect<S>(stream: S) -> Result<Vec<Bytes>, ExportError>
where
    S: futures_util::Stream<Item = Result<Bytes, ExportError>>,
{
    let mut chunks = Vec::new();
    let mut stream = Box::pin(stream);
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk?);
    }
    Ok(chunks)
}

fn concat(chunks: &[Bytes]) -> Vec<u8> {
    chunks.iter().flat_map(|c| c.iter().copied()).collect()
}

fn analysis_row(ident: &str, i: usize) -> Row {
    vec![
        Value::from(ident),
        Value::from(2u16),
        Value::from(i % 2 == 0),
        Value::from(i as f32),
        Value::from(-(i as f32) - 1.0),
        Value::from((i % 100) as u16),
    ]
}

#[tokio::test]
async fn test_dummy_listing_downloads_as_csv_and_binary() {
    let query = ListQuery {
        level_id: 128,
        platformer: false,
        include_practice: true,
    };

    let listing = DummyStore.list(query).await.unwrap();
    let csv = collect(encode_stream(listing.rows, listing.columns, OutputFormat::Csv, EncodeOptions::default()))
        .await
        .unwrap();
    assert_eq!(
        String::from_utf8(concat(&csv)).unwrap(),
        format!("userident,levelversion,practice,x,y,percentage\n{DUMMY_IDENT},0,0,100,200,37")
    );

    let listing = DummyStore.list(query).await.unwrap();
    let width = listing.columns.row_width();
    let bin = collect(encode_stream(listing.rows, listing.columns, OutputFormat::Binary, EncodeOptions::default()))
        .await
        .unwrap();
    let bin = concat(&bin);
    assert_eq!(bin.len(), 1 + width);
    assert_eq!(bin[0], 1);
    assert_eq!(&bin[1..21], &[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67]);
    assert_eq!(&bin[bin.len() - 2..], &37u16.to_le_bytes());
}

#[tokio::test]
async fn test_large_stream_is_chunked_in_batches() {
    let columns = ColumnSpec::parse("x,y,percentage").unwrap();
    let rows = (0..1_200).map(|i| Ok(vec![Value::from(i as f32), Value::from(0.5f32), Value::from(1u16)]));

    let chunks = collect(encode_stream(
        stream::iter(rows),
        columns.clone(),
        OutputFormat::Binary,
        EncodeOptions::default().batch_rows(500),
    ))
    .await
    .unwrap();

    let sizes: Vec<_> = chunks.iter().map(Bytes::len).collect();
    let width = columns.row_width();
    assert_eq!(sizes, vec![1 + 500 * width, 500 * width, 200 * width]);
}

#[tokio::test]
async fn test_analysis_export_groups_players_without_revealing_them() {
    let columns = ColumnSpec::parse(ANALYSIS_COLUMNS).unwrap();
    let alice = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    let bob = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    let rows = vec![analysis_row(alice, 0), analysis_row(bob, 1), analysis_row(alice, 2)];

    let anonymizer = Anonymizer::new();
    let options = EncodeOptions::default().transform(anonymizer.into_transform());
    let chunks: Vec<_> = encode_iter(rows, columns, OutputFormat::Csv, options)
        .collect::<Result<_, _>>()
        .unwrap();
    let text = String::from_utf8(concat(&chunks)).unwrap();
    let idents: Vec<_> = text.lines().skip(1).map(|line| line.split(',').next().unwrap().to_string()).collect();

    assert_eq!(idents.len(), 3);
    assert_eq!(idents[0], idents[2]);
    assert_ne!(idents[0], idents[1]);
    assert!(idents.iter().all(|id| id.len() == 40 && id != alice && id != bob));
}

#[tokio::test]
async fn test_two_analysis_exports_use_different_salts() {
    let columns = ColumnSpec::parse(ANALYSIS_COLUMNS).unwrap();
    let ident = "cccccccccccccccccccccccccccccccccccccccc";
    let export = || {
        let options = EncodeOptions::default().transform(Anonymizer::new().into_transform());
        let chunks: Vec<_> = encode_iter(vec![analysis_row(ident, 0)], columns.clone(), OutputFormat::Binary, options)
            .collect::<Result<_, _>>()
            .unwrap();
        concat(&chunks)
    };
    assert_ne!(export()[1..21], export()[1..21]);
}

#[tokio::test]
async fn test_shutdown_token_ends_an_endless_export() {
    let columns = ColumnSpec::parse("x,y").unwrap();
    let endless = stream::repeat_with(|| Ok(vec![Value::from(1.0f32), Value::from(2.0f32)]));
    let token = CancellationToken::new();
    let mut encoded = Box::pin(encode_stream(
        endless,
        columns,
        OutputFormat::Binary,
        EncodeOptions::default().batch_rows(10).cancel_on(token.child_token()),
    ));

    assert!(encoded.next().await.unwrap().is_ok());
    token.cancel();
    assert!(matches!(encoded.next().await, Some(Err(ExportError::Cancelled))));
    assert!(encoded.next().await.is_none());
}

#[test]
fn test_submission_becomes_a_listable_row() {
    let body = br#"{"format":2,"levelid":77,"playername":"someone","userid":42,"percentage":120,"x":10.25,"y":-3,"coin2":true}"#;
    let Ok(Submission::Store(marker)) = parse_submission(body, None, &[]) else {
        panic!("submission should be accepted");
    };
    assert_eq!(marker.percentage, 99);

    let row = vec![
        Value::from(marker.userident.as_str()),
        Value::from(marker.level_version),
        Value::from(marker.practice),
        Value::from(marker.x),
        Value::from(marker.y),
        Value::from(marker.percentage),
    ];
    let columns = ColumnSpec::parse(ANALYSIS_COLUMNS).unwrap();
    let out: Vec<_> = encode_iter(vec![row], columns, OutputFormat::Csv, EncodeOptions::default())
        .collect::<Result<_, _>>()
        .unwrap();
    let text = String::from_utf8(concat(&out)).unwrap();
    assert!(text.ends_with(",0,0,10.25,-3,99"), "{text}");
}
