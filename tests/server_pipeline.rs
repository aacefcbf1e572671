use anyhow::Result;
use oml::protocol::marshal::Marshaller;
use oml::protocol::schema::Schema;
use oml::protocol::value::OmlValue;
use oml::server::database::Database;
use oml::server::handler::{ClientHandler, HandlerState};
use std::sync::{Arc, Mutex};

/// Row as it reached the backend: (table, sender, seqno, ts_client,
/// ts_server, values).
type Row = (String, i64, u32, f64, f64, Vec<OmlValue>);

#[derive(Default)]
struct MockDb {
    rows: Mutex<Vec<Row>>,
    tables: Mutex<Vec<String>>,
    senders: Mutex<Vec<String>>,
    start_time: Mutex<i64>,
}

impl MockDb {
    fn new() -> Arc<MockDb> {
        Arc::new(MockDb::default())
    }

    fn rows_for(&self, table: &str) -> Vec<Row> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.0 == table)
            .cloned()
            .collect()
    }
}

impl Database for MockDb {
    fn domain(&self) -> &str {
        "mock"
    }

    fn start_time(&self) -> i64 {
        *self.start_time.lock().unwrap()
    }

    fn set_start_time(&self, t: i64) {
        let mut st = self.start_time.lock().unwrap();
        if *st == 0 {
            *st = t;
        }
    }

    fn add_sender(&self, name: &str) -> Result<i64> {
        let mut senders = self.senders.lock().unwrap();
        if let Some(i) = senders.iter().position(|s| s == name) {
            return Ok(i as i64 + 1);
        }
        senders.push(name.to_string());
        Ok(senders.len() as i64)
    }

    fn create_table(&self, schema: &Schema) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.contains(&schema.name) {
            tables.push(schema.name.clone());
        }
        Ok(())
    }

    fn insert(
        &self,
        table: &str,
        sender_id: i64,
        seqno: u32,
        ts_client: f64,
        ts_server: f64,
        values: &[OmlValue],
    ) -> Result<()> {
        self.rows.lock().unwrap().push((
            table.to_string(),
            sender_id,
            seqno,
            ts_client,
            ts_server,
            values.to_vec(),
        ));
        Ok(())
    }
}

fn text_header(protocol: u32, schemas: &[&str]) -> String {
    let mut h = format!(
        "protocol: {}\ndomain: testdom\nstart-time: 1000\nsender-id: n1\napp-name: app\n",
        protocol
    );
    for s in schemas {
        h.push_str(&format!("schema: {}\n", s));
    }
    h.push_str("content: text\n\n");
    h
}

#[test]
fn text_session_with_mid_stream_schema() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);

    ch.feed(text_header(4, &["1 t1 size:uint32"]).as_bytes())
        .unwrap();
    ch.feed(b"0.5\t1\t1\t42\n").unwrap();
    ch.feed(b"0.6\t0\t1\t.\tschema\t2 t2 bli:int32\n").unwrap();
    ch.feed(b"0.7\t2\t1\t-7\n").unwrap();

    let t1 = db.rows_for("t1");
    assert_eq!(t1.len(), 1);
    assert_eq!(t1[0].5, vec![OmlValue::UInt32(42)]);
    // start-time 1000 seeds the domain at 900, so the server timeline is
    // rebased by +100
    assert!((t1[0].3 - 0.5).abs() < 1e-9);
    assert!((t1[0].4 - 100.5).abs() < 1e-9);

    let t2 = db.rows_for("t2");
    assert_eq!(t2.len(), 1);
    assert_eq!(t2[0].5, vec![OmlValue::Int32(-7)]);

    // the schema declaration itself is not recorded as metadata
    assert!(db.rows_for("_experiment_metadata").is_empty());
    assert!(db.tables.lock().unwrap().contains(&"t2".to_string()));
}

#[test]
fn metadata_tuples_are_recorded() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    ch.feed(text_header(5, &[]).as_bytes()).unwrap();
    ch.feed(b"0.1\t0\t1\tapp\tversion\t1.2.3\n").unwrap();

    let meta = db.rows_for("_experiment_metadata");
    assert_eq!(meta.len(), 1);
    assert_eq!(
        meta[0].5,
        vec![
            OmlValue::String("app".to_string()),
            OmlValue::String("version".to_string()),
            OmlValue::String("1.2.3".to_string()),
        ]
    );
}

#[test]
fn old_protocols_may_not_redefine_schemata() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    ch.feed(text_header(3, &[]).as_bytes()).unwrap();
    ch.feed(b"0.6\t0\t1\t.\tschema\t2 t2 bli:int32\n").unwrap();
    ch.feed(b"0.7\t2\t1\t-7\n").unwrap();
    assert!(db.rows_for("t2").is_empty());
}

#[test]
fn bad_text_line_only_costs_that_line() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    ch.feed(text_header(5, &["1 t1 size:uint32"]).as_bytes())
        .unwrap();
    ch.feed(b"0.5\t1\t1\tnot-a-number\n").unwrap();
    ch.feed(b"junk\twithout\tstructure\n").unwrap();
    ch.feed(b"0.7\t1\t2\t19\n").unwrap();

    let t1 = db.rows_for("t1");
    assert_eq!(t1.len(), 1);
    assert_eq!(t1[0].5, vec![OmlValue::UInt32(19)]);
    assert_eq!(ch.state(), HandlerState::TextData);
}

fn binary_header(schemas: &[&str]) -> String {
    let mut h = String::from(
        "protocol: 5\ndomain: testdom\nstart-time: 1000\nsender-id: n1\napp-name: app\n",
    );
    for s in schemas {
        h.push_str(&format!("schema: {}\n", s));
    }
    h.push_str("content: binary\n\n");
    h
}

fn frame(stream: u8, seqno: i32, ts: f64, values: &[OmlValue]) -> Vec<u8> {
    let mut m = Marshaller::short();
    m.measurements(stream, seqno, ts);
    m.values(values).unwrap();
    m.finalize()
}

#[test]
fn binary_session_round_trip() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    ch.feed(
        binary_header(&["1 radio label:string rssi:double seen:bool guid:guid"]).as_bytes(),
    )
    .unwrap();

    let values = vec![
        OmlValue::String("hi".to_string()),
        OmlValue::Double(3.14159265),
        OmlValue::Bool(true),
        OmlValue::Guid(0x260a42fc515c3908),
    ];
    let bytes = frame(1, 2, 3.0, &values);
    // drip-feed to exercise partial-frame handling
    for chunk in bytes.chunks(3) {
        ch.feed(chunk).unwrap();
    }

    let rows = db.rows_for("radio");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].2, 2);
    assert!((rows[0].3 - 3.0).abs() < 1e-9);
    assert_eq!(rows[0].5[0], values[0]);
    assert_eq!(rows[0].5[2], values[2]);
    assert_eq!(rows[0].5[3], values[3]);
    match rows[0].5[1] {
        OmlValue::Double(v) => assert!((v - 3.14159265).abs() < 1e-8),
        ref other => panic!("expected a double, got {:?}", other),
    }
}

#[test]
fn binary_stream_resynchronises_after_garbage() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    ch.feed(binary_header(&["1 t1 v:int32"]).as_bytes()).unwrap();

    let mut stream = vec![0x42, 0x42];
    stream.extend_from_slice(&frame(1, 1, 0.5, &[OmlValue::Int32(5)]));
    ch.feed(&stream).unwrap();
    // a later clean frame keeps flowing
    ch.feed(&frame(1, 2, 0.6, &[OmlValue::Int32(6)])).unwrap();

    let rows = db.rows_for("t1");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].5, vec![OmlValue::Int32(5)]);
    assert_eq!(rows[1].5, vec![OmlValue::Int32(6)]);
}

#[test]
fn unknown_frame_kind_costs_one_frame_only() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    ch.feed(binary_header(&["1 t1 v:int32"]).as_bytes()).unwrap();

    // sync bytes followed by a kind byte nobody speaks
    let mut stream = vec![0xaa, 0xaa, 0x7f, 0x01, 0x02, 0x03];
    stream.extend_from_slice(&frame(1, 1, 0.5, &[OmlValue::Int32(9)]));
    ch.feed(&stream).unwrap();

    let rows = db.rows_for("t1");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].5, vec![OmlValue::Int32(9)]);
    assert_eq!(ch.state(), HandlerState::BinaryData);
}

#[test]
fn binary_schema_zero_declares_new_stream() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    ch.feed(binary_header(&["1 t1 v:int32"]).as_bytes()).unwrap();

    let decl = vec![
        OmlValue::String(".".to_string()),
        OmlValue::String("schema".to_string()),
        OmlValue::String("2 t2 w:uint64".to_string()),
    ];
    ch.feed(&frame(0, 1, 0.1, &decl)).unwrap();
    ch.feed(&frame(2, 1, 0.2, &[OmlValue::UInt64(5741039616)]))
        .unwrap();

    let rows = db.rows_for("t2");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].5, vec![OmlValue::UInt64(5741039616)]);
}

#[test]
fn redeclaring_a_stream_replaces_its_schema() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    ch.feed(text_header(5, &["1 t1 size:uint32"]).as_bytes())
        .unwrap();
    ch.feed(b"0.5\t1\t1\t42\n").unwrap();
    ch.feed(b"0.6\t0\t1\t.\tschema\t1 t1b label:string\n").unwrap();
    ch.feed(b"0.7\t1\t2\thello\n").unwrap();

    assert_eq!(db.rows_for("t1").len(), 1);
    let t1b = db.rows_for("t1b");
    assert_eq!(t1b.len(), 1);
    assert_eq!(t1b[0].5, vec![OmlValue::String("hello".to_string())]);
}

#[test]
fn missing_domain_closes_the_connection() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    let result = ch.feed(b"protocol: 5\ncontent: text\n\n");
    assert!(result.is_err());
    assert_eq!(ch.state(), HandlerState::ProtocolError);
}

#[test]
fn unsupported_protocol_version_is_rejected() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    assert!(ch.feed(text_header(6, &[]).as_bytes()).is_err());
}

#[test]
fn legacy_header_spellings_are_accepted() {
    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    ch.feed(
        b"protocol: 3\nexperiment-id: oldstyle\nstart_time: 500\nsender-id: n1\n\
          app-name: app\nschema: 1 t1 counter:long\ncontent: text\n\n",
    )
    .unwrap();
    ch.feed(b"0.5\t1\t1\t12\n").unwrap();

    let rows = db.rows_for("t1");
    assert_eq!(rows.len(), 1);
    // legacy long arrives as int32
    assert_eq!(rows[0].5, vec![OmlValue::Int32(12)]);
}

#[test]
fn gzip_encapsulated_session() {
    use oml::client::sink::OutStream;
    use oml::client::zlib::ZlibStream;
    use std::sync::Mutex as StdMutex;

    struct VecSink(Arc<StdMutex<Vec<u8>>>, Vec<u8>, bool);
    impl OutStream for VecSink {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            if !self.2 && !self.1.is_empty() {
                let header = self.1.clone();
                self.0.lock().unwrap().extend_from_slice(&header);
                self.2 = true;
            }
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
        fn write_immediate(&mut self, data: &[u8]) -> Result<()> {
            self.write(data)
        }
        fn set_header_data(&mut self, header: Vec<u8>) {
            self.1 = header;
            self.2 = false;
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    let captured = Arc::new(StdMutex::new(Vec::new()));
    let mut z = ZlibStream::new(Box::new(VecSink(Arc::clone(&captured), Vec::new(), false)));
    z.set_header_data(text_header(5, &["1 t1 size:uint32"]).into_bytes());
    z.write(b"0.5\t1\t1\t42\n").unwrap();
    z.write(b"0.6\t1\t2\t43\n").unwrap();
    z.close().unwrap();

    let db = MockDb::new();
    let mut ch = ClientHandler::with_database("test", Arc::clone(&db) as Arc<dyn Database>);
    let bytes = captured.lock().unwrap().clone();
    assert!(bytes.starts_with(b"encapsulation: gzip\n"));
    for chunk in bytes.chunks(7) {
        ch.feed(chunk).unwrap();
    }

    let rows = db.rows_for("t1");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].5, vec![OmlValue::UInt32(42)]);
    assert_eq!(rows[1].5, vec![OmlValue::UInt32(43)]);
}
