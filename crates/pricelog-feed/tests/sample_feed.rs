use std::ops::ControlFlow;

use chrono::NaiveDate;
use pricelog_feed::{parse_feed, ParseOptions, RecordErrorReason};
use rust_decimal_macros::dec;

#[test]
fn sample_feed_fixture_parses_with_one_dropped_record() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feeds/sample.csv");
    let file = std::fs::File::open(&path).expect("open sample feed");
    let options = ParseOptions::new(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()).with_batch_size(4);

    let mut rows = Vec::new();
    let summary = parse_feed(file, &options, |batch| {
        rows.extend(batch);
        ControlFlow::Continue(())
    })
    .expect("parse sample feed");

    assert_eq!(summary.rows_seen, 6);
    assert_eq!(summary.rows_parsed, 5);
    assert_eq!(summary.rows_skipped, 1);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.error_sample[0].reason, RecordErrorReason::MissingSku);

    let charger = rows.iter().find(|r| r.sku == "SP-1003").expect("charger row");
    assert_eq!(charger.price, 0);
    assert_eq!(charger.discount, dec!(15));

    let keyboard = rows.iter().find(|r| r.sku == "SP-1004").expect("keyboard row");
    assert_eq!(keyboard.discount, dec!(12.5));
    assert_eq!(keyboard.description, "Hot-swap\nbrown switches");

    let earbuds = rows.iter().filter(|r| r.sku == "SP-1001").collect::<Vec<_>>();
    assert_eq!(earbuds.len(), 2);
    assert!(earbuds[0].line_no < earbuds[1].line_no);
}
