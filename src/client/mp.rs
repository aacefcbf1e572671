use crate::client::instrument;
use crate::client::stream::MStream;
use crate::protocol::schema::SchemaField;
use crate::protocol::value::OmlValue;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// A registered measurement point: a named field list plus the runtime state
/// of its attached streams.
///
/// The single mutex guards the active flag, the stream list and every
/// filter's window state; `inject` only ever blocks on it, never on I/O.
pub struct OmlMP {
    pub name: String,
    pub fields: Vec<SchemaField>,
    state: Mutex<MpState>,
    wakeup: Condvar,
}

pub struct MpState {
    pub active: bool,
    pub streams: Vec<MStream>,
}

impl OmlMP {
    pub fn new(name: &str, fields: Vec<SchemaField>) -> OmlMP {
        OmlMP {
            name: name.to_string(),
            fields,
            state: Mutex::new(MpState {
                active: true,
                streams: Vec::new(),
            }),
            wakeup: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, MpState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Inject one tuple. The values must match the MP's field list; a
    /// mismatched tuple is dropped and counted, never propagated as an
    /// error.
    pub fn inject(&self, values: &[OmlValue], start_time: i64) {
        if !self.check_values(values) {
            instrument::counters().dropped();
            return;
        }
        let mut state = self.lock();
        if !state.active {
            instrument::counters().dropped();
            return;
        }
        instrument::counters().injected();
        for i in 0..state.streams.len() {
            if state.streams[i].sample(values) {
                state.streams[i].process(start_time);
            }
        }
    }

    fn check_values(&self, values: &[OmlValue]) -> bool {
        if values.len() != self.fields.len() {
            log::warn!(
                "MP '{}' expects {} values, got {}",
                self.name,
                self.fields.len(),
                values.len()
            );
            return false;
        }
        for (v, f) in values.iter().zip(self.fields.iter()) {
            if v.kind() != f.kind {
                log::warn!(
                    "MP '{}': field '{}' expects {}, got {}",
                    self.name,
                    f.name,
                    f.kind,
                    v.kind()
                );
                return false;
            }
        }
        true
    }

    /// Clear the active flag and wake every timer thread so teardown can
    /// join them.
    pub fn deactivate(&self) {
        let mut state = self.lock();
        state.active = false;
        drop(state);
        self.wakeup.notify_all();
    }

    /// Start the timer thread of a time-based stream. The thread sleeps for
    /// the sampling interval, closes the window under the MP lock, and exits
    /// as soon as the MP goes inactive.
    pub fn start_timer(self: &Arc<Self>, stream_pos: usize, start_time: i64) -> JoinHandle<()> {
        let mp = Arc::clone(self);
        std::thread::spawn(move || {
            let interval = {
                let state = mp.lock();
                match state.streams.get(stream_pos) {
                    Some(ms) => ms.sample_interval,
                    None => return,
                }
            };
            let timeout = Duration::from_secs_f64(interval.max(0.001));
            let mut state = mp.lock();
            loop {
                if !state.active {
                    return;
                }
                let (guard, wait) = match mp.wakeup.wait_timeout(state, timeout) {
                    Ok(r) => r,
                    Err(poisoned) => {
                        state = poisoned.into_inner().0;
                        continue;
                    }
                };
                state = guard;
                if !state.active {
                    return;
                }
                if wait.timed_out() {
                    state.streams[stream_pos].process(start_time);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::filter::default_filter;
    use crate::client::testutil::MemSink;
    use crate::client::writer::{Encoding, OmlWriter};
    use crate::protocol::value::OmlValueKind;

    fn mp_with_stream(thres: u32) -> (Arc<OmlMP>, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let mp = Arc::new(OmlMP::new(
            "pressure",
            vec![SchemaField::new("v", OmlValueKind::Double)],
        ));
        let (sink, captured) = MemSink::new();
        let writer = Arc::new(OmlWriter::with_sink(Encoding::Text, Box::new(sink)));
        let filters = vec![default_filter("v", OmlValueKind::Double, 0, thres > 1)];
        mp.lock().streams.push(MStream::new(
            1,
            "app_pressure".to_string(),
            thres,
            0.0,
            filters,
            writer,
        ));
        (mp, captured)
    }

    #[test]
    fn mismatched_tuples_are_dropped() {
        let (mp, captured) = mp_with_stream(1);
        mp.inject(&[OmlValue::Int32(1)], 0);
        mp.inject(&[], 0);
        mp.inject(&[OmlValue::Double(1.0), OmlValue::Double(2.0)], 0);
        assert!(captured.lock().unwrap().is_empty());
    }

    #[test]
    fn inactive_mp_drops_samples() {
        let (mp, captured) = mp_with_stream(1);
        mp.deactivate();
        mp.inject(&[OmlValue::Double(1.0)], 0);
        assert!(captured.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_injection_yields_gapless_seqnos() {
        let (mp, captured) = mp_with_stream(1);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mp = Arc::clone(&mp);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    mp.inject(&[OmlValue::Double(i as f64)], 0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let out = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
        let mut seqnos: Vec<u32> = out
            .lines()
            .map(|l| l.split('\t').nth(2).unwrap().parse().unwrap())
            .collect();
        seqnos.sort_unstable();
        let want: Vec<u32> = (1..=200).collect();
        assert_eq!(seqnos, want);
    }

    #[test]
    fn timer_thread_exits_on_deactivate() {
        let (mp, _captured) = mp_with_stream(0);
        mp.lock().streams[0].sample_interval = 30.0;
        let handle = mp.start_timer(0, 0);
        mp.deactivate();
        handle.join().unwrap();
    }

    #[test]
    fn timer_thread_emits_rows() {
        let (mp, captured) = mp_with_stream(0);
        mp.lock().streams[0].sample_interval = 0.05;
        let handle = mp.start_timer(0, 0);
        mp.inject(&[OmlValue::Double(4.0)], 0);
        std::thread::sleep(Duration::from_millis(200));
        mp.deactivate();
        handle.join().unwrap();
        let out = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
        assert!(!out.is_empty());
        let first: Vec<&str> = out.lines().next().unwrap().split('\t').collect();
        assert_eq!(first[3], "4");
    }
}
