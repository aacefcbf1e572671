use crate::protocol::value::{OmlValue, OmlValueKind};
use anyhow::{anyhow, bail, Result};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// A per-field stream filter. Samples are pushed in under the MP lock; when a
/// window closes, `output()` emits the filter's contribution to the row and
/// resets its state.
pub trait Filter: Send {
    fn kind_name(&self) -> &'static str;
    fn field_name(&self) -> &str;
    fn field_index(&self) -> usize;
    /// Output fields this filter contributes to the stream schema:
    /// an optional name suffix and the output kind.
    fn meta(&self) -> Vec<(Option<&'static str>, OmlValueKind)>;
    fn input(&mut self, value: &OmlValue);
    fn output(&mut self) -> Vec<OmlValue>;
}

/// Keeps the first sample of each window.
struct FirstFilter {
    field: String,
    index: usize,
    kind: OmlValueKind,
    sample: Option<OmlValue>,
}

impl Filter for FirstFilter {
    fn kind_name(&self) -> &'static str {
        "first"
    }

    fn field_name(&self) -> &str {
        &self.field
    }

    fn field_index(&self) -> usize {
        self.index
    }

    fn meta(&self) -> Vec<(Option<&'static str>, OmlValueKind)> {
        vec![(None, self.kind)]
    }

    fn input(&mut self, value: &OmlValue) {
        if self.sample.is_none() {
            self.sample = Some(value.clone());
        }
    }

    fn output(&mut self) -> Vec<OmlValue> {
        vec![self.sample.take().unwrap_or_else(|| self.kind.zero())]
    }
}

/// Mean over the window, for numeric fields. The output is always a double.
struct AvgFilter {
    field: String,
    index: usize,
    sum: f64,
    count: u64,
}

impl Filter for AvgFilter {
    fn kind_name(&self) -> &'static str {
        "avg"
    }

    fn field_name(&self) -> &str {
        &self.field
    }

    fn field_index(&self) -> usize {
        self.index
    }

    fn meta(&self) -> Vec<(Option<&'static str>, OmlValueKind)> {
        vec![(None, OmlValueKind::Double)]
    }

    fn input(&mut self, value: &OmlValue) {
        if let Some(v) = value.as_f64() {
            self.sum += v;
            self.count += 1;
        }
    }

    fn output(&mut self) -> Vec<OmlValue> {
        let avg = if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        };
        self.sum = 0.0;
        self.count = 0;
        vec![OmlValue::Double(avg)]
    }
}

type FilterCtor = fn(&str, OmlValueKind, usize) -> Result<Box<dyn Filter>>;

fn new_first(field: &str, kind: OmlValueKind, index: usize) -> Result<Box<dyn Filter>> {
    Ok(Box::new(FirstFilter {
        field: field.to_string(),
        index,
        kind,
        sample: None,
    }))
}

fn new_avg(field: &str, kind: OmlValueKind, index: usize) -> Result<Box<dyn Filter>> {
    if !kind.is_numeric() {
        bail!(
            "filter 'avg' cannot aggregate {} field '{}'",
            kind.type_name(),
            field
        );
    }
    Ok(Box::new(AvgFilter {
        field: field.to_string(),
        index,
        sum: 0.0,
        count: 0,
    }))
}

static FILTERS: Lazy<BTreeMap<&'static str, FilterCtor>> = Lazy::new(|| {
    let mut m = BTreeMap::new();
    m.insert("first", new_first as FilterCtor);
    m.insert("avg", new_avg as FilterCtor);
    m
});

/// Instantiate a filter by name. Unknown names fail at configuration time.
pub fn create_filter(
    name: &str,
    field: &str,
    kind: OmlValueKind,
    index: usize,
) -> Result<Box<dyn Filter>> {
    let ctor = FILTERS
        .get(name)
        .ok_or_else(|| anyhow!("unknown filter '{}'", name))?;
    ctor(field, kind, index)
}

pub fn filter_names() -> Vec<&'static str> {
    FILTERS.keys().cloned().collect()
}

/// Default filter choice: `avg` for numeric fields when the window can hold
/// more than one sample, `first` otherwise.
pub fn default_filter(
    field: &str,
    kind: OmlValueKind,
    index: usize,
    multiple_samples: bool,
) -> Box<dyn Filter> {
    if multiple_samples && kind.is_numeric() {
        if let Ok(f) = create_filter("avg", field, kind, index) {
            return f;
        }
    }
    Box::new(FirstFilter {
        field: field.to_string(),
        index,
        kind,
        sample: None,
    })
}
