use super::*;

const NOTE_COLUMNS: &[&str] = &["label", "body", "flag", "amount"];

fn memory_store() -> Connection {
    let connection = Connection::open_in_memory().expect("in-memory DB should open");
    ensure_schema(&connection).expect("schema should apply");
    connection
        .execute_batch(
            "CREATE TABLE notes (
               label TEXT NOT NULL,
               body TEXT,
               flag INTEGER,
               amount REAL
             );",
        )
        .expect("scratch table should be created");
    connection
}

#[test]
fn ensure_schema_is_idempotent() {
    let connection = Connection::open_in_memory().expect("in-memory DB should open");
    ensure_schema(&connection).expect("first pass");
    ensure_schema(&connection).expect("second pass");

    let version: String = connection
        .query_row(
            "SELECT value FROM metadata WHERE key = 'db_schema_version'",
            [],
            |row| row.get(0),
        )
        .expect("schema version row");
    assert_eq!(version, DB_SCHEMA_VERSION);
    assert_eq!(count_rows(&connection, "loading_status").expect("count"), 0);
}

#[test]
fn staging_buffer_escapes_separators_and_marks_nulls() {
    let mut connection = memory_store();
    let mut buffer = StagingBuffer::new("notes", NOTE_COLUMNS);
    buffer
        .push_row(&[
            CopyValue::Text("tab\there"),
            CopyValue::Text("line\nbreak \\ slash"),
            CopyValue::Bool(true),
            CopyValue::Null,
        ])
        .expect("row should stage");

    let tx = connection.transaction().expect("transaction");
    assert_eq!(copy_in(&tx, &buffer).expect("copy"), 1);
    tx.commit().expect("commit");

    let row = connection
        .query_row("SELECT label, body, flag, amount FROM notes", [], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<f64>>(3)?,
            ))
        })
        .expect("staged row");
    assert_eq!(
        row,
        ("tab\there".to_string(), "line\nbreak \\ slash".to_string(), 1, None)
    );
}

#[test]
fn staging_buffer_rejects_wrong_column_count() {
    let mut buffer = StagingBuffer::new("notes", NOTE_COLUMNS);
    let err = buffer
        .push_row(&[CopyValue::Text("only one")])
        .expect_err("short row should be rejected");
    assert!(matches!(err, IngestError::Insert(_)));

    let mut connection = memory_store();
    let tx = connection.transaction().expect("transaction");
    assert_eq!(copy_in(&tx, &buffer).expect("empty copy"), 0);
}

#[test]
fn copy_in_restores_values_and_nulls() {
    let mut connection = memory_store();
    let mut buffer = StagingBuffer::new("notes", NOTE_COLUMNS);
    buffer
        .push_row(&[
            CopyValue::Text("a\tb"),
            CopyValue::Null,
            CopyValue::Bool(false),
            CopyValue::Real(12.5),
        ])
        .expect("first row");
    buffer
        .push_row(&[
            CopyValue::Text("literal \\N inside"),
            CopyValue::Text("multi\r\nline"),
            CopyValue::from(None::<bool>),
            CopyValue::from(Some(3.0)),
        ])
        .expect("second row");

    let tx = connection.transaction().expect("transaction");
    let copied = copy_in(&tx, &buffer).expect("copy should succeed");
    tx.commit().expect("commit");
    assert_eq!(copied, 2);

    let mut statement = connection
        .prepare("SELECT label, body, flag, amount FROM notes ORDER BY rowid")
        .expect("prepare");
    let rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
            ))
        })
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows");

    assert_eq!(rows[0], ("a\tb".to_string(), None, Some(0), Some(12.5)));
    assert_eq!(
        rows[1],
        (
            "literal \\N inside".to_string(),
            Some("multi\r\nline".to_string()),
            None,
            Some(3.0)
        )
    );
}

#[test]
fn dropped_transaction_leaves_no_rows() {
    let mut connection = memory_store();
    let mut buffer = StagingBuffer::new("notes", NOTE_COLUMNS);
    buffer
        .push_row(&[
            CopyValue::Text("x"),
            CopyValue::Null,
            CopyValue::Null,
            CopyValue::Null,
        ])
        .expect("row");

    {
        let tx = connection.transaction().expect("transaction");
        copy_in(&tx, &buffer).expect("copy");
    }

    assert_eq!(count_rows(&connection, "notes").expect("count"), 0);
}

#[test]
fn definition_table_rejects_taxable_and_exempt_together() {
    let connection = memory_store();
    connection
        .execute(
            "INSERT INTO document_versions(region, doc_type, version, effective_date, metadata, loaded_at)
             VALUES ('AR', 'LOD', 'v2024.0', '2024-01-01', '{}', '2024-01-01T00:00:00Z')",
            [],
        )
        .expect("version row");

    let result = connection.execute(
        "INSERT INTO definition_items(document_version_id, category, code, description, taxable, exempt)
         VALUES (1, 'product', '20000', 'Clothing', 1, 1)",
        [],
    );
    assert!(result.is_err());

    connection
        .execute(
            "INSERT INTO definition_items(document_version_id, category, code, description, taxable, exempt)
             VALUES (1, 'product', '20000', 'Clothing', 1, 0)",
            [],
        )
        .expect("consistent flags should insert");
}

#[test]
fn file_backed_factory_bootstraps_schema() {
    let dir = tempfile::tempdir().expect("temp dir");
    let factory = SqliteConnectionFactory::new(dir.path().join("store.sqlite"), Duration::from_secs(1));
    factory.bootstrap().expect("bootstrap");

    let connection = factory.connect().expect("second connection");
    assert_eq!(count_rows(&connection, "document_versions").expect("count"), 0);
    assert!(factory.db_path().exists());
}
