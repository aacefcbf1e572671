pub mod config;
pub mod filter;
pub mod instrument;
pub mod mp;
pub mod session;
pub mod sink;
pub mod stream;
pub mod writer;
pub mod zlib;

#[cfg(test)]
pub mod testutil {
    use super::sink::OutStream;
    use anyhow::Result;
    use std::sync::{Arc, Mutex};

    /// Sink capturing everything it is given, headers included.
    pub struct MemSink {
        data: Arc<Mutex<Vec<u8>>>,
        header: Vec<u8>,
        header_written: bool,
    }

    impl MemSink {
        pub fn new() -> (MemSink, Arc<Mutex<Vec<u8>>>) {
            let data = Arc::new(Mutex::new(Vec::new()));
            (
                MemSink {
                    data: data.clone(),
                    header: Vec::new(),
                    header_written: false,
                },
                data,
            )
        }
    }

    impl OutStream for MemSink {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            if !self.header_written && !self.header.is_empty() {
                let header = std::mem::take(&mut self.header);
                self.data.lock().unwrap().extend_from_slice(&header);
                self.header = header;
                self.header_written = true;
            }
            self.data.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn write_immediate(&mut self, data: &[u8]) -> Result<()> {
            self.write(data)
        }

        fn set_header_data(&mut self, header: Vec<u8>) {
            self.header = header;
            self.header_written = false;
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
