use crate::client::filter::Filter;
use crate::client::writer::OmlWriter;
use crate::client::instrument;
use crate::protocol::schema::{Schema, SchemaField};
use crate::protocol::value::OmlValue;
use chrono::Local;
use std::sync::Arc;

/// A measurement stream: one MP bound to one writer, with a sampling rule
/// and a filter chain. All state here is guarded by the owning MP's mutex.
pub struct MStream {
    pub index: u32,
    pub table_name: String,
    /// Emit after this many samples (sample-based mode, interval == 0).
    pub sample_thres: u32,
    /// Emit every this many seconds (time-based mode, > 0).
    pub sample_interval: f64,
    pub seqno: u32,
    sample_count: u32,
    pub filters: Vec<Box<dyn Filter>>,
    pub writer: Arc<OmlWriter>,
}

impl MStream {
    pub fn new(
        index: u32,
        table_name: String,
        sample_thres: u32,
        sample_interval: f64,
        filters: Vec<Box<dyn Filter>>,
        writer: Arc<OmlWriter>,
    ) -> MStream {
        MStream {
            index,
            table_name,
            sample_thres,
            sample_interval,
            seqno: 0,
            sample_count: 0,
            filters,
            writer,
        }
    }

    /// Derive the unique table name of the n-th stream attached to an MP.
    pub fn table_name(app_name: &str, mp_name: &str, nth: usize) -> String {
        if nth == 0 {
            format!("{}_{}", app_name, mp_name)
        } else {
            format!("{}_{}_{}", app_name, mp_name, nth + 1)
        }
    }

    /// The stream's schema, assembled from the filters' output fields. An
    /// unnamed output keeps the source field name, a named one is suffixed.
    pub fn schema(&self) -> Schema {
        let mut fields = Vec::new();
        for f in &self.filters {
            for (suffix, kind) in f.meta() {
                let name = match suffix {
                    None => f.field_name().to_string(),
                    Some(s) => format!("{}_{}", f.field_name(), s),
                };
                fields.push(SchemaField::new(&name, kind));
            }
        }
        Schema::new(self.index, &self.table_name, fields)
    }

    /// Feed one tuple into the filter windows. Returns true when a
    /// sample-based window just filled up.
    pub fn sample(&mut self, values: &[OmlValue]) -> bool {
        for f in self.filters.iter_mut() {
            f.input(&values[f.field_index()]);
        }
        self.sample_count += 1;
        self.sample_interval == 0.0
            && self.sample_thres > 0
            && self.sample_count >= self.sample_thres
    }

    /// Close the window: run the filters, emit one row, reset.
    pub fn process(&mut self, start_time: i64) {
        self.seqno += 1;
        self.sample_count = 0;
        let now = Local::now().timestamp_millis() as f64 / 1000.0 - start_time as f64;
        let mut row = Vec::with_capacity(self.filters.len());
        for f in self.filters.iter_mut() {
            row.extend(f.output());
        }
        match self.writer.write_row(self.index, self.seqno, now, &row) {
            Ok(n) => {
                instrument::counters().row_allocated(n);
                instrument::counters().row_freed(n);
            }
            Err(e) => {
                instrument::counters().dropped();
                log::warn!("dropped row {} of stream '{}': {}", self.seqno, self.table_name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::filter::default_filter;
    use crate::client::writer::Encoding;
    use crate::client::testutil::MemSink;
    use crate::protocol::value::OmlValueKind;

    fn test_stream(thres: u32) -> (MStream, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let (sink, captured) = MemSink::new();
        let writer = Arc::new(OmlWriter::with_sink(Encoding::Text, Box::new(sink)));
        let filters = vec![default_filter("v", OmlValueKind::Double, 0, thres > 1)];
        let ms = MStream::new(1, "app_mp".to_string(), thres, 0.0, filters, writer);
        (ms, captured)
    }

    #[test]
    fn table_names() {
        assert_eq!(MStream::table_name("app", "mp", 0), "app_mp");
        assert_eq!(MStream::table_name("app", "mp", 1), "app_mp_2");
        assert_eq!(MStream::table_name("app", "mp", 2), "app_mp_3");
    }

    #[test]
    fn sample_threshold_triggers() {
        let (mut ms, _) = test_stream(3);
        assert!(!ms.sample(&[OmlValue::Double(1.0)]));
        assert!(!ms.sample(&[OmlValue::Double(2.0)]));
        assert!(ms.sample(&[OmlValue::Double(3.0)]));
    }

    #[test]
    fn threshold_averaging_emits_one_row() {
        let (mut ms, captured) = test_stream(3);
        for v in [1.0, 2.0, 3.0].iter() {
            if ms.sample(&[OmlValue::Double(*v)]) {
                ms.process(0);
            }
        }
        let out = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 1);
        let fields: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(fields[1], "1"); // stream index
        assert_eq!(fields[2], "1"); // first row
        assert_eq!(fields[3], "2"); // avg of 1,2,3
    }

    #[test]
    fn seqno_is_gapless() {
        let (mut ms, captured) = test_stream(1);
        for i in 0..5 {
            if ms.sample(&[OmlValue::Double(i as f64)]) {
                ms.process(0);
            }
        }
        let out = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
        let seqnos: Vec<u32> = out
            .lines()
            .map(|l| l.split('\t').nth(2).unwrap().parse().unwrap())
            .collect();
        assert_eq!(seqnos, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn schema_from_filters() {
        let (ms, _) = test_stream(3);
        let schema = ms.schema();
        assert_eq!(schema.to_meta(), "1 app_mp v:double");
    }
}
