use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use rusqlite::Connection;

use super::decode::{
    TextEncoding, decode_text, detect_encoding, extract_metadata, normalize_metadata_dates,
};
use super::layout::{
    COMPLIANCE_FIELDS, ColumnMapper, DEFINITION_FIELDS, Field, LayoutClassifier, overlap_ratio,
};
use super::ledger::{self, StatusUpdate};
use super::loader::DocumentLoader;
use super::normalize::definitions::{legacy_category, translate_treatment};
use super::scheduler::tracked_load;
use super::normalize::{
    BodyRows, ComplianceNormalizer, DefinitionsNormalizer, Normalizer, PracticeNormalizer,
    normalize_answer,
};
use super::*;
use crate::config::LoaderConfig;
use crate::error::{IngestError, RowErrors};
use crate::model::{
    BulkCounts, DefinitionCategory, DocType, LoadStatus, NormalizedItems, SourceFile,
};
use crate::store::{ConnectionFactory, SqliteConnectionFactory, count_rows, ensure_schema};

const DEFINITIONS_CSV: &str = "\
Library of Definitions,State,Version,Effective Date
,AR,v2024.0,01/01/2024
Tax Admin Contact,Jane Doe,,
Administrative Definitions,Description,Treatment,Reference
10010,Delivery charges,Taxable,Rule 10
Product Definitions,Description,Treatment,Reference
20000,Clothing,Exempt,Rule 20
20010,Clothing accessories,Taxable,
Sales Tax Holiday,Description,Treatment,Threshold
20060,Clothing during holiday,Exempt,100.00
";

const COMPLIANCE_CSV: &str = "\
Certificate of Compliance,State,Version
,TX,v2024.1
,,
Question Number,Question,Answer,Citation,Notes
Section 1 - Registration,,,,
1,Does the state offer free registration?,Y,Sec. 5,
2,Are remote sellers exempt?,N/A,,pending
3,,Yes,,
";

fn table(rows: &[&[&str]]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect()
}

fn write_source(root: &Path, partition: &str, region: &str, name: &str, content: &[u8]) -> PathBuf {
    let dir = root.join(partition).join(format!("region={region}"));
    fs::create_dir_all(&dir).expect("partition dir");
    let path = dir.join(name);
    fs::write(&path, content).expect("write source");
    path
}

fn store(dir: &Path) -> (LoaderConfig, SqliteConnectionFactory) {
    let mut config = LoaderConfig::new(dir.join("raw"), dir.join("store.sqlite"));
    config.workers = 2;
    let factory = SqliteConnectionFactory::new(&config.db_path, Duration::from_secs(5));
    factory.bootstrap().expect("bootstrap");
    (config, factory)
}

fn utf16le_with_bom(text: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

fn definitions(output: &NormalizedItems) -> &[crate::model::DefinitionItem] {
    match output {
        NormalizedItems::Definitions(items) => items,
        other => panic!("expected definitions, got {other:?}"),
    }
}

#[test]
fn detect_encoding_recognizes_boms_and_null_density() {
    assert_eq!(detect_encoding(&[0xFF, 0xFE, b'a', 0]), TextEncoding::Utf16Le);
    assert_eq!(detect_encoding(&[0xEF, 0xBB, 0xBF, b'a']), TextEncoding::Utf8Bom);
    assert_eq!(detect_encoding(b"a\0b\0c\0d\0"), TextEncoding::Utf16Le);
    assert_eq!(detect_encoding(b"plain,ascii\n"), TextEncoding::Utf8);
    assert_eq!(detect_encoding(b""), TextEncoding::Utf8);
}

#[test]
fn decode_text_reads_utf16_and_strips_utf8_bom() {
    let path = Path::new("sample.csv");
    let (text, encoding) = decode_text(&utf16le_with_bom("Code,Description\n"), path).expect("utf-16");
    assert_eq!(encoding, TextEncoding::Utf16Le);
    assert_eq!(text, "Code,Description\n");

    let (text, encoding) = decode_text(b"\xEF\xBB\xBFa,b", path).expect("utf-8 bom");
    assert_eq!(encoding, TextEncoding::Utf8Bom);
    assert_eq!(text, "a,b");
}

#[test]
fn decode_text_rejects_invalid_bytes() {
    let err = decode_text(&[0xFF, 0xFE, b'a'], Path::new("odd.csv")).expect_err("odd length");
    assert!(matches!(err, IngestError::Decoding { encoding: "utf-16-le", .. }));

    let err = decode_text(&[b'a', 0xC3, 0x28], Path::new("bad.csv")).expect_err("bad utf-8");
    assert!(matches!(err, IngestError::Decoding { encoding: "utf-8", .. }));
}

#[test]
fn extract_metadata_pairs_labels_with_values_skipping_title_column() {
    let rows = table(&[
        &["Library of Definitions", "State", "Version", "Effective Date", ""],
        &["", "AR", "v2024.0", "01/15/2024", "ignored"],
    ]);
    let mut metadata = extract_metadata(&rows);
    assert_eq!(metadata.len(), 3);
    assert_eq!(metadata["State"], "AR");
    assert!(!metadata.contains_key("Library of Definitions"));

    normalize_metadata_dates(&mut metadata);
    assert_eq!(metadata["Effective Date"], "2024-01-15");

    assert!(extract_metadata(&table(&[&["only", "one row"]])).is_empty());
}

#[test]
fn find_data_start_skips_metadata_keyword_rows() {
    let classifier = LayoutClassifier::new(COMPLIANCE_FIELDS).expect("classifier");
    let rows = table(&[
        &["Certificate of Compliance", "State", "Version"],
        &["", "TX", "v2024.1"],
        &["", "", ""],
        &["State Contact", "Tax Admin Office", "x"],
        &["1", "Question?", "Yes"],
    ]);
    let start = classifier.find_data_start(&rows, 4);
    assert_eq!(start.index, 4);
    assert!(!start.fallback_used);
}

#[test]
fn find_data_start_accepts_header_rows_that_mention_keywords() {
    let classifier = LayoutClassifier::new(COMPLIANCE_FIELDS).expect("classifier");
    let rows = table(&[
        &["Certificate", "State"],
        &["", "TX"],
        &[""],
        &["Section", "Question Number", "Question", "Answer"],
        &["General", "1", "Is it?", "Y"],
    ]);
    assert_eq!(classifier.find_data_start(&rows, 4).index, 3);
}

#[test]
fn find_data_start_falls_back_when_nothing_qualifies() {
    let classifier = LayoutClassifier::new(DEFINITION_FIELDS).expect("classifier");
    let rows = table(&[
        &["Library", "State", "Version"],
        &["", "AR", "v1"],
        &["", "", ""],
        &["State", "Version", "Library"],
        &["Tax Admin", "x"],
        &["Certificate", "y", "z"],
    ]);
    let start = classifier.find_data_start(&rows, 4);
    assert_eq!(start.index, 4);
    assert!(start.fallback_used);

    let short = table(&[&["Library"], &["x"]]);
    assert_eq!(classifier.find_data_start(&short, 4).index, 2);
}

#[test]
fn exact_aliases_claim_fields_before_looser_matches() {
    let mapper = ColumnMapper::default();
    let row = table(&[&["Item Description", "Description", "Tax Treatment"]]).remove(0);
    let mapping = mapper.map_row(&row, DEFINITION_FIELDS, false);

    assert_eq!(mapping.column(Field::Description), Some(1));
    assert_eq!(mapping.column(Field::Treatment), Some(2));
    assert_eq!(mapping.column(Field::Code), Some(0));
    assert!(mapping.is_column_header());
}

#[test]
fn data_rows_are_not_mistaken_for_headers() {
    let classifier = LayoutClassifier::new(super::layout::PRACTICE_FIELDS).expect("classifier");
    let row = table(&[&["", "Uses destination sourcing", "Yes", "Rule 1"]]).remove(0);
    assert!(!classifier.map_columns(&row, false).is_column_header());
}

#[test]
fn overlap_ratio_uses_shorter_string_length() {
    assert!((overlap_ratio("abc", "abd") - 2.0 / 3.0).abs() < f64::EPSILON);
    assert_eq!(overlap_ratio("", "abc"), 0.0);
    assert_eq!(overlap_ratio("notes", "note"), 1.0);
}

#[test]
fn code_rows_exclude_section_and_banner_labels() {
    let classifier = LayoutClassifier::new(DEFINITION_FIELDS).expect("classifier");
    let code_row = |cells: &[&str]| classifier.is_code_row(&table(&[cells]).remove(0));

    assert!(code_row(&["10010", "Delivery"]));
    assert!(code_row(&["A1", "Short code"]));
    assert!(!code_row(&["Section 1", ""]));
    assert!(!code_row(&["Library of Definitions", "x"]));
    assert!(!code_row(&["Taxable", "x"]));
    assert!(!code_row(&["Clothing", "x"]));
    assert!(!code_row(&["10010"]));
}

#[test]
fn legacy_codes_map_to_categories_by_range() {
    assert_eq!(legacy_category("10010"), DefinitionCategory::Admin);
    assert_eq!(legacy_category("19999"), DefinitionCategory::Admin);
    assert_eq!(legacy_category("20060"), DefinitionCategory::Holiday);
    assert_eq!(legacy_category("20105"), DefinitionCategory::Holiday);
    assert_eq!(legacy_category("20000"), DefinitionCategory::Product);
    assert_eq!(legacy_category("A12"), DefinitionCategory::Product);
}

#[test]
fn treatment_text_sets_both_halves_of_a_pair() {
    let taxable = translate_treatment("Taxable").expect("taxable");
    assert_eq!((taxable.taxable, taxable.exempt), (Some(true), Some(false)));

    let exempt = translate_treatment(" exempt ").expect("exempt");
    assert_eq!((exempt.taxable, exempt.exempt), (Some(false), Some(true)));

    let nontaxable = translate_treatment("Non-taxable").expect("nontaxable");
    assert_eq!(nontaxable.exempt, Some(true));

    let included = translate_treatment("Included").expect("included");
    assert_eq!((included.included, included.excluded), (Some(true), Some(false)));
    assert_eq!(included.taxable, None);

    let excluded = translate_treatment("excluded").expect("excluded");
    assert_eq!((excluded.included, excluded.excluded), (Some(false), Some(true)));

    assert!(translate_treatment("sometimes").is_none());
}

#[test]
fn answers_normalize_to_canonical_text_and_flag() {
    assert_eq!(normalize_answer("Y"), ("Yes".to_string(), Some(true)));
    assert_eq!(normalize_answer(" yes "), ("Yes".to_string(), Some(true)));
    assert_eq!(normalize_answer("X"), ("Yes".to_string(), Some(true)));
    assert_eq!(normalize_answer("TRUE"), ("Yes".to_string(), Some(true)));
    assert_eq!(normalize_answer("N"), ("No".to_string(), Some(false)));
    assert_eq!(normalize_answer("no"), ("No".to_string(), Some(false)));
    assert_eq!(normalize_answer("FALSE"), ("No".to_string(), Some(false)));
    assert_eq!(normalize_answer("No"), ("No".to_string(), Some(false)));
    assert_eq!(normalize_answer(""), ("No".to_string(), Some(false)));
    assert_eq!(normalize_answer("N/A"), ("N/A".to_string(), None));
    assert_eq!(normalize_answer("Partially"), ("Partially".to_string(), None));
}

#[test]
fn row_error_threshold_accepts_the_boundary_rate() {
    let mut errors = RowErrors::default();
    assert!(errors.check_threshold(0.10).is_ok());

    for _ in 0..9 {
        errors.record_ok();
    }
    errors.record_err(10, "bad");
    assert!(errors.check_threshold(0.10).is_ok());

    errors.record_err(11, "worse");
    let err = errors.check_threshold(0.10).expect_err("2 of 11 exceeds 10%");
    assert!(matches!(err, IngestError::ThresholdExceeded { failed: 2, total: 11, .. }));
}

#[test]
fn current_definitions_take_category_from_section_headers() {
    let rows = crate::ingest::decode::read_rows(
        DEFINITIONS_CSV,
        Path::new("lod.csv"),
        TextEncoding::Utf8,
    )
    .expect("rows");
    let normalizer = DefinitionsNormalizer::new().expect("normalizer");
    let start = normalizer.classifier().find_data_start(&rows, 4);
    assert_eq!(start.index, 3);

    let output = normalizer
        .normalize(BodyRows::new(&rows, start.index), "v2024.0")
        .expect("normalize");
    assert_eq!(output.items.len(), 4);
    assert_eq!(output.items.definitions_in(DefinitionCategory::Admin), 1);
    assert_eq!(output.items.definitions_in(DefinitionCategory::Product), 2);
    assert_eq!(output.items.definitions_in(DefinitionCategory::Holiday), 1);

    let items = definitions(&output.items);
    let holiday = items.iter().find(|item| item.code == "20060").expect("holiday item");
    assert_eq!(holiday.threshold, Some(100.0));
    assert_eq!((holiday.taxable, holiday.exempt), (Some(false), Some(true)));

    let accessories = items.iter().find(|item| item.code == "20010").expect("product item");
    assert_eq!(accessories.reference, None);
    assert!(output.row_errors.errors().is_empty());
}

#[test]
fn legacy_definitions_ignore_sections_and_use_code_ranges() {
    let rows = table(&[
        &["Code", "Description", "Taxability"],
        &["10010", "Admin thing", "Taxable"],
        &["20060", "Holiday thing", "Exempt"],
        &["Product Definitions", "Description", "Treatment"],
        &["10020", "Still admin", "Taxable"],
        &["20000", "Product thing", "Exempt"],
    ]);
    let normalizer = DefinitionsNormalizer::new().expect("normalizer");
    let output = normalizer
        .normalize(BodyRows::new(&rows, 0), "v2016.3")
        .expect("normalize");

    let items = definitions(&output.items);
    let category = |code: &str| {
        items
            .iter()
            .find(|item| item.code == code)
            .map(|item| item.category)
    };
    assert_eq!(category("10010"), Some(DefinitionCategory::Admin));
    assert_eq!(category("20060"), Some(DefinitionCategory::Holiday));
    assert_eq!(category("10020"), Some(DefinitionCategory::Admin));
    assert_eq!(category("20000"), Some(DefinitionCategory::Product));
}

#[test]
fn conflicting_flags_are_row_errors_counted_against_threshold() {
    let mut rows = vec![vec![
        "Code".to_string(),
        "Description".to_string(),
        "Taxable".to_string(),
        "Exempt".to_string(),
    ]];
    for idx in 0..9 {
        rows.push(vec![format!("2{idx:04}"), format!("Item {idx}"), "Y".into(), "N".into()]);
    }
    rows.push(vec!["29999".into(), "Both".into(), "Y".into(), "Y".into()]);

    let normalizer = DefinitionsNormalizer::new().expect("normalizer");
    let output = normalizer
        .normalize(BodyRows::new(&rows, 0), "v2024.0")
        .expect("normalize");
    assert_eq!(output.items.len(), 9);
    assert_eq!(output.row_errors.errors().len(), 1);
    assert_eq!(output.row_errors.errors()[0].row, 11);
    assert!(output.row_errors.check_threshold(0.10).is_ok());

    rows.push(vec!["29998".into(), "Bad treatment".into(), "maybe".into(), "".into()]);
    let output = normalizer
        .normalize(BodyRows::new(&rows, 0), "v2024.0")
        .expect("normalize");
    assert_eq!(output.row_errors.errors().len(), 2);
    assert!(output.row_errors.check_threshold(0.10).is_err());
}

#[test]
fn compliance_rows_use_header_mapping_and_section_labels() {
    let rows = crate::ingest::decode::read_rows(
        COMPLIANCE_CSV,
        Path::new("coc.csv"),
        TextEncoding::Utf8,
    )
    .expect("rows");
    let normalizer = ComplianceNormalizer::new().expect("normalizer");
    let start = normalizer.classifier().find_data_start(&rows, 4);
    let output = normalizer
        .normalize(BodyRows::new(&rows, start.index), "v2024.1")
        .expect("normalize");

    let NormalizedItems::Compliance(items) = &output.items else {
        panic!("expected compliance items");
    };
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].section, "Section 1 - Registration");
    assert_eq!(items[0].question_number, "1");
    assert_eq!(items[0].answer, "Yes");
    assert_eq!(items[0].compliance_met, Some(true));
    assert_eq!(items[0].citation, "Sec. 5");
    assert_eq!(items[1].answer, "N/A");
    assert_eq!(items[1].compliance_met, None);
    assert_eq!(items[1].notes, "pending");
    assert!(output.warnings.is_empty());
}

#[test]
fn compliance_without_header_reads_positional_layout() {
    let rows = table(&[
        &["Section 1", "Registration", "Is registration free?", "Yes", "Sec 5", "2024", "note"],
        &["Section 1", "Registration", "Is there a fee?", "No", "", "", ""],
    ]);
    let normalizer = ComplianceNormalizer::new().expect("normalizer");
    let output = normalizer
        .normalize(BodyRows::new(&rows, 0), "v2019.0")
        .expect("normalize");

    let NormalizedItems::Compliance(items) = &output.items else {
        panic!("expected compliance items");
    };
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].topic, "Registration");
    assert_eq!(items[0].effective_dates, "2024");
    assert_eq!(items[1].question_number, "2");
    assert_eq!(items[1].compliance_met, Some(false));
    assert_eq!(output.warnings.len(), 1);
}

#[test]
fn practices_carry_group_labels_and_sequential_numbers() {
    let rows = table(&[
        &["", "Practice", "Answer", "Citation"],
        &["Disclosed Practice 1: Sourcing"],
        &["", "Uses destination sourcing", "Yes", "Rule 1"],
        &["", "", "Yes", ""],
        &["", "Sources services by benefit", "No", ""],
        &["Disclosed Practice 2: Bundling"],
        &["", "Bundled transactions are taxable", "Y", ""],
    ]);
    let normalizer = PracticeNormalizer::new().expect("normalizer");
    let output = normalizer
        .normalize(BodyRows::new(&rows, 0), "v2024.0")
        .expect("normalize");

    let NormalizedItems::Practices(items) = &output.items else {
        panic!("expected practice items");
    };
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].group_name, "Disclosed Practice 1: Sourcing");
    assert_eq!(items[0].question_number, "1");
    assert_eq!(items[1].question_number, "2");
    assert_eq!(items[1].compliance_met, Some(false));
    assert_eq!(items[2].group_name, "Disclosed Practice 2: Bundling");
    assert_eq!(items[2].question_number, "3");
}

#[test]
fn practice_group_rows_without_numbers_start_a_new_group() {
    let rows = table(&[
        &["Group A - Registration", ""],
        &["", "Does the state register sellers?", "Yes", "Rule 10"],
        &["Group B - Returns", ""],
        &["", "Does the state require annual returns?", "No", ""],
    ]);
    let normalizer = PracticeNormalizer::new().expect("normalizer");
    let output = normalizer
        .normalize(BodyRows::new(&rows, 0), "v2024.0")
        .expect("normalize");

    let NormalizedItems::Practices(items) = &output.items else {
        panic!("expected practice items");
    };
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].group_name, "Group A - Registration");
    assert_eq!(items[0].compliance_met, Some(true));
    assert_eq!(items[1].group_name, "Group B - Returns");
    assert_eq!(items[1].question_number, "2");
}

#[test]
fn source_file_names_parse_into_partition_identity() {
    let parser = SourceFileParser::new().expect("parser");
    let file = parser
        .parse(
            Path::new("raw/cc/region=TX/COC_tx_v2024.1_20240115T093000.csv"),
            None,
        )
        .expect("named file");
    assert_eq!(file.doc_type, DocType::ComplianceCertificate);
    assert_eq!(file.region, "TX");
    assert_eq!(file.version, "v2024.1");
    assert_eq!(
        file.captured_at.map(|ts| ts.date().to_string()),
        Some("2024-01-15".to_string())
    );

    let untimed = parser
        .parse(Path::new("raw/tm/state=AR/LOD_AR_v2016.0.csv"), None)
        .expect("legacy folder");
    assert_eq!(untimed.doc_type, DocType::Definitions);
    assert_eq!(untimed.captured_at, None);

    let overridden = parser
        .parse(Path::new("elsewhere/TAP_KY_v2023.2_20230101T000000.csv"), Some(DocType::Definitions))
        .expect("override");
    assert_eq!(overridden.doc_type, DocType::Definitions);

    let err = parser
        .parse(Path::new("raw/tm/region=AR/notes.csv"), None)
        .expect_err("bad name");
    assert!(matches!(err, IngestError::InvalidFileName(_)));
}

#[test]
fn digest_depends_on_content_only() {
    let dir = tempfile::tempdir().expect("temp dir");
    let first = dir.path().join("a.csv");
    let second = dir.path().join("nested_b.csv");
    fs::write(&first, DEFINITIONS_CSV).expect("write a");
    fs::write(&second, DEFINITIONS_CSV).expect("write b");

    let digest = ledger::file_digest(&first).expect("digest a");
    assert_eq!(digest, ledger::file_digest(&second).expect("digest b"));
    assert_eq!(digest.len(), 64);

    fs::write(&second, format!("{DEFINITIONS_CSV}20070,Extra,Exempt,\n")).expect("rewrite");
    assert_ne!(digest, ledger::file_digest(&second).expect("digest changed"));
}

#[test]
fn status_upserts_track_attempts_and_timestamps() {
    let mut connection = Connection::open_in_memory().expect("in-memory DB should open");
    ensure_schema(&connection).expect("schema");
    let file = SourceFile {
        path: PathBuf::from("LOD_AR_v2024.0.csv"),
        doc_type: DocType::Definitions,
        region: "AR".to_string(),
        version: "v2024.0".to_string(),
        captured_at: None,
    };

    assert!(ledger::is_new(&connection, "abc").expect("is_new"));
    ledger::upsert_status(&mut connection, &StatusUpdate::for_file(&file, "abc", LoadStatus::Started))
        .expect("started");
    assert!(!ledger::is_new(&connection, "abc").expect("is_new"));

    ledger::upsert_status(
        &mut connection,
        &StatusUpdate::for_file(&file, "abc", LoadStatus::Failed).with_error("boom"),
    )
    .expect("failed");
    ledger::upsert_status(&mut connection, &StatusUpdate::for_file(&file, "abc", LoadStatus::Started))
        .expect("started again");
    ledger::upsert_status(
        &mut connection,
        &StatusUpdate::for_file(&file, "abc", LoadStatus::Failed).with_error("boom again"),
    )
    .expect("failed again");

    let record = ledger::lookup(&connection, "abc").expect("lookup").expect("record");
    assert_eq!(record.status, LoadStatus::Failed);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.error.as_deref(), Some("boom again"));
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());

    assert_eq!(ledger::failed_loads(&connection, None).expect("all").len(), 1);
    assert_eq!(ledger::failed_loads(&connection, Some(3)).expect("eligible").len(), 1);
    assert!(ledger::failed_loads(&connection, Some(2)).expect("at ceiling").is_empty());

    ledger::upsert_status(
        &mut connection,
        &StatusUpdate::for_file(&file, "abc", LoadStatus::Completed).with_rows(7),
    )
    .expect("completed");
    let record = ledger::lookup(&connection, "abc").expect("lookup").expect("record");
    assert_eq!(record.status, LoadStatus::Completed);
    assert_eq!(record.rows, Some(7));
    assert_eq!(record.error, None);
    assert_eq!(record.attempts, 2);

    let performance = ledger::performance_summary(&connection).expect("performance");
    assert_eq!(performance.len(), 1);
    assert_eq!(performance[0].doc_type, "LOD");
    assert_eq!(performance[0].sample_size, 1);
    assert!(performance[0].min_seconds >= 0.0);

    let summary = ledger::status_summary(&connection, 7).expect("summary");
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].status, "completed");
}

#[test]
fn rejected_status_write_keeps_the_previous_record() {
    let mut connection = Connection::open_in_memory().expect("in-memory DB should open");
    ensure_schema(&connection).expect("schema");
    let file = SourceFile {
        path: PathBuf::from("LOD_AR_v2024.0.csv"),
        doc_type: DocType::Definitions,
        region: "AR".to_string(),
        version: "v2024.0".to_string(),
        captured_at: None,
    };
    ledger::upsert_status(&mut connection, &StatusUpdate::for_file(&file, "abc", LoadStatus::Started))
        .expect("started");
    connection
        .execute_batch(
            "CREATE TRIGGER freeze_status BEFORE UPDATE ON loading_status
             BEGIN SELECT RAISE(ABORT, 'ledger frozen'); END;",
        )
        .expect("trigger");

    let err = ledger::upsert_status(
        &mut connection,
        &StatusUpdate::for_file(&file, "abc", LoadStatus::Failed).with_error("boom"),
    )
    .expect_err("update should be rejected");
    assert!(matches!(err, IngestError::Store(_)), "{err:?}");
    assert!(err.to_string().contains("ledger frozen"));

    let record = ledger::lookup(&connection, "abc").expect("lookup").expect("record");
    assert_eq!(record.status, LoadStatus::Started);
    assert_eq!(record.attempts, 0);
    assert_eq!(record.error, None);
    assert!(connection.is_autocommit());
}

#[test]
fn tracked_load_surfaces_a_failed_status_write() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    write_source(&config.data_root, "tm", "AR", "LOD_AR_v2024.0.csv", DEFINITIONS_CSV.as_bytes());
    let mut connection = factory.connect().expect("connect");
    connection
        .execute_batch(
            "DROP TABLE definition_items;
             CREATE TRIGGER freeze_status BEFORE UPDATE ON loading_status
             BEGIN SELECT RAISE(ABORT, 'ledger frozen'); END;",
        )
        .expect("break store");

    let file = discover_files(&config.data_root)
        .expect("discover")
        .files
        .remove(0);
    let digest = ledger::file_digest(&file.path).expect("digest");
    let loader = DocumentLoader::new(&config);
    let err = tracked_load(&mut connection, &loader, &file, &digest, None)
        .expect_err("status write should fail");
    assert!(matches!(err, IngestError::Store(_)), "{err:?}");

    let record = ledger::lookup(&connection, &digest).expect("lookup").expect("record");
    assert_eq!(record.status, LoadStatus::Started);
    assert_eq!(record.attempts, 0);
    assert_eq!(count_rows(&connection, "document_versions").expect("versions"), 0);
}

#[test]
fn bulk_load_stores_one_version_with_all_items() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    write_source(
        &config.data_root,
        "tm",
        "AR",
        "LOD_AR_v2024.0_20240115T093000.csv",
        DEFINITIONS_CSV.as_bytes(),
    );

    let discovery = discover_files(&config.data_root).expect("discover");
    assert_eq!(discovery.files.len(), 1);
    let outcomes = LoadScheduler::new(&config, &factory)
        .run(&discovery.files)
        .expect("run");
    let counts = BulkCounts::tally(&outcomes);
    assert_eq!(counts.succeeded, 1, "{outcomes:?}");
    assert_eq!(outcomes[0].rows, Some(4));

    let connection = factory.connect().expect("connect");
    assert_eq!(count_rows(&connection, "document_versions").expect("versions"), 1);
    assert_eq!(count_rows(&connection, "definition_items").expect("items"), 4);

    let (effective_date, doc_type): (String, String) = connection
        .query_row(
            "SELECT effective_date, doc_type FROM document_versions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("version row");
    assert_eq!(effective_date, "2024-01-15");
    assert_eq!(doc_type, "LOD");

    let threshold: Option<f64> = connection
        .query_row(
            "SELECT threshold FROM definition_items WHERE category = 'holiday'",
            [],
            |row| row.get(0),
        )
        .expect("holiday row");
    assert_eq!(threshold, Some(100.0));

    let digest = outcomes[0].digest.clone().expect("digest");
    let record = ledger::lookup(&connection, &digest).expect("lookup").expect("record");
    assert_eq!(record.status, LoadStatus::Completed);
    assert_eq!(record.rows, Some(4));
}

#[test]
fn second_run_skips_unchanged_files() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    write_source(
        &config.data_root,
        "tm",
        "AR",
        "LOD_AR_v2024.0_20240115T093000.csv",
        DEFINITIONS_CSV.as_bytes(),
    );

    let scheduler = LoadScheduler::new(&config, &factory);
    let files = discover_files(&config.data_root).expect("discover").files;
    scheduler.run(&files).expect("first run");
    let outcomes = scheduler.run(&files).expect("second run");

    assert!(outcomes[0].skipped);
    assert!(outcomes[0].success);
    let connection = factory.connect().expect("connect");
    assert_eq!(count_rows(&connection, "document_versions").expect("versions"), 1);
    assert_eq!(count_rows(&connection, "definition_items").expect("items"), 4);
}

#[test]
fn utf16_files_load_like_utf8_files() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    write_source(
        &config.data_root,
        "cc",
        "TX",
        "COC_TX_v2024.1_20240301T120000.csv",
        &utf16le_with_bom(COMPLIANCE_CSV),
    );

    let files = discover_files(&config.data_root).expect("discover").files;
    let outcomes = LoadScheduler::new(&config, &factory).run(&files).expect("run");
    assert!(outcomes[0].success, "{outcomes:?}");

    let connection = factory.connect().expect("connect");
    assert_eq!(count_rows(&connection, "compliance_items").expect("items"), 2);
    let unknown: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM compliance_items WHERE compliance_met IS NULL",
            [],
            |row| row.get(0),
        )
        .expect("null flags");
    assert_eq!(unknown, 1);
}

#[test]
fn failed_insert_leaves_no_partial_version() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    write_source(
        &config.data_root,
        "tm",
        "AR",
        "LOD_AR_v2024.0_20240115T093000.csv",
        DEFINITIONS_CSV.as_bytes(),
    );
    factory
        .connect()
        .expect("connect")
        .execute_batch("DROP TABLE definition_items;")
        .expect("drop items table");

    let files = discover_files(&config.data_root).expect("discover").files;
    let outcomes = LoadScheduler::new(&config, &factory).run(&files).expect("run");
    assert!(outcomes[0].is_failure());

    let connection = factory.connect().expect("connect");
    assert_eq!(count_rows(&connection, "document_versions").expect("versions"), 0);
    let digest = outcomes[0].digest.clone().expect("digest");
    let record = ledger::lookup(&connection, &digest).expect("lookup").expect("record");
    assert_eq!(record.status, LoadStatus::Failed);
    assert_eq!(record.attempts, 1);
}

#[test]
fn excessive_row_errors_fail_the_whole_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    let content = "\
Library of Definitions,State,Version
,AR,v2024.0
,,
Code,Description,Taxable,Exempt
20000,Good,Y,N
20010,Both,Y,Y
20020,Also both,X,X
";
    write_source(&config.data_root, "tm", "AR", "LOD_AR_v2024.0.csv", content.as_bytes());

    let files = discover_files(&config.data_root).expect("discover").files;
    let outcomes = LoadScheduler::new(&config, &factory).run(&files).expect("run");
    assert!(outcomes[0].is_failure());
    assert!(
        outcomes[0]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("exceeds threshold")),
        "{outcomes:?}"
    );

    let connection = factory.connect().expect("connect");
    assert_eq!(count_rows(&connection, "document_versions").expect("versions"), 0);
    assert_eq!(count_rows(&connection, "definition_items").expect("items"), 0);
}

#[test]
fn cancelled_runs_report_files_as_not_started() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    write_source(&config.data_root, "tm", "AR", "LOD_AR_v2024.0.csv", DEFINITIONS_CSV.as_bytes());

    let files = discover_files(&config.data_root).expect("discover").files;
    let outcomes = LoadScheduler::new(&config, &factory)
        .with_cancel_flag(Arc::new(AtomicBool::new(true)))
        .run(&files)
        .expect("run");
    let counts = BulkCounts::tally(&outcomes);
    assert_eq!(counts.not_started, 1);
    assert_eq!(counts.failed, 0);

    let connection = factory.connect().expect("connect");
    assert_eq!(count_rows(&connection, "loading_status").expect("ledger"), 0);
}

#[test]
fn retry_reloads_failed_file_after_fix() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    write_source(
        &config.data_root,
        "tm",
        "AR",
        "LOD_AR_v2024.0_20240115T093000.csv",
        DEFINITIONS_CSV.as_bytes(),
    );
    factory
        .connect()
        .expect("connect")
        .execute_batch("DROP TABLE definition_items;")
        .expect("drop items table");

    let files = discover_files(&config.data_root).expect("discover").files;
    let outcomes = LoadScheduler::new(&config, &factory).run(&files).expect("run");
    let digest = outcomes[0].digest.clone().expect("digest");

    let connection = factory.connect().expect("connect");
    ensure_schema(&connection).expect("restore schema");

    let report = RecoveryCoordinator::new(&config, &factory)
        .retry_failed(config.max_retry_attempts)
        .expect("retry");
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1, "{report:?}");
    assert_eq!(report.details[0].attempt, 2);

    let record = ledger::lookup(&connection, &digest).expect("lookup").expect("record");
    assert_eq!(record.status, LoadStatus::Completed);
    assert_eq!(count_rows(&connection, "definition_items").expect("items"), 4);
}

#[test]
fn retry_finds_lowercase_region_folders() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    write_source(&config.data_root, "tm", "ar", "LOD_ar_v2024.0.csv", DEFINITIONS_CSV.as_bytes());
    factory
        .connect()
        .expect("connect")
        .execute_batch("DROP TABLE definition_items;")
        .expect("drop items table");

    let files = discover_files(&config.data_root).expect("discover").files;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].region, "AR");
    LoadScheduler::new(&config, &factory).run(&files).expect("run");

    let connection = factory.connect().expect("connect");
    ensure_schema(&connection).expect("restore schema");

    let report = RecoveryCoordinator::new(&config, &factory)
        .retry_failed(config.max_retry_attempts)
        .expect("retry");
    assert_eq!(report.succeeded, 1, "{report:?}");
    assert_eq!(count_rows(&connection, "definition_items").expect("items"), 4);
}

#[test]
fn retry_never_exceeds_the_attempt_ceiling() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    write_source(&config.data_root, "tm", "AR", "LOD_AR_v2024.0.csv", DEFINITIONS_CSV.as_bytes());
    factory
        .connect()
        .expect("connect")
        .execute_batch("DROP TABLE definition_items;")
        .expect("drop items table");

    let files = discover_files(&config.data_root).expect("discover").files;
    LoadScheduler::new(&config, &factory).run(&files).expect("run");

    let coordinator = RecoveryCoordinator::new(&config, &factory);
    for _ in 0..5 {
        coordinator.retry_failed(3).expect("retry");
    }

    let connection = factory.connect().expect("connect");
    let records = ledger::failed_loads(&connection, None).expect("failed");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 3);
    assert!(
        records[0]
            .error
            .as_deref()
            .is_some_and(|error| error.starts_with("retry 3:"))
    );

    let report = coordinator.retry_failed(3).expect("retry");
    assert_eq!(report.attempted, 0);
}

#[test]
fn retry_reports_missing_files_without_touching_the_ledger() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (config, factory) = store(dir.path());
    let path = write_source(&config.data_root, "tm", "AR", "LOD_AR_v2024.0.csv", DEFINITIONS_CSV.as_bytes());
    factory
        .connect()
        .expect("connect")
        .execute_batch("DROP TABLE definition_items;")
        .expect("drop items table");

    let files = discover_files(&config.data_root).expect("discover").files;
    LoadScheduler::new(&config, &factory).run(&files).expect("run");
    fs::remove_file(&path).expect("remove source");

    let report = RecoveryCoordinator::new(&config, &factory)
        .retry_failed(3)
        .expect("retry");
    assert_eq!(report.failed, 1);
    assert!(
        report.details[0]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("file not found for retry"))
    );

    let connection = factory.connect().expect("connect");
    let records = ledger::failed_loads(&connection, None).expect("failed");
    assert_eq!(records[0].attempts, 1);
}
