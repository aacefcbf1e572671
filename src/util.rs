use chrono::Local;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::Path;

/// Map the numeric verbosity used by `--oml-log-level` (error: 1 .. debug: 4)
/// onto a `log` filter.
pub fn level_filter(level: u32) -> log::LevelFilter {
    match level {
        0 | 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    }
}

pub fn init_logger(log_file: Option<&Path>, level: Option<u32>) {
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    let mut builder = env_logger::Builder::from_env(env);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} {} - {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            buf.default_styled_level(record.level()),
            &record.args()
        )
    });
    if let Some(level) = level {
        builder.filter_level(level_filter(level));
    }
    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("cannot open log file {}: {}", path.display(), e),
        }
    }
    let _ = builder.try_init();
}

pub fn spawn_and_log_error<F>(fut: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    smol::spawn(async move {
        if let Err(e) = fut.await {
            log::error!("{}", e)
        }
    })
    .detach();
}

/// Dump a buffer as rows of hex octets with an ASCII gutter, for logging
/// irrecoverable protocol garbage. Output is capped at 255 bytes.
pub fn bytes_hex_format(bytes: &[u8]) -> String {
    const COLUMN: usize = 16;
    let bytes = &bytes[..bytes.len().min(0xff)];
    let mut text = String::new();
    for (row, chunk) in bytes.chunks(COLUMN).enumerate() {
        text += &format!("{:2x} ", row);
        for i in 0..COLUMN {
            match chunk.get(i) {
                Some(b) => text += &format!("{:02x}", b),
                None => text += "  ",
            }
            if i % 8 == 7 {
                text += "  ";
            } else if i % 4 == 3 {
                text += " ";
            }
        }
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        text += &format!(" {}\n", ascii);
    }
    text
}

pub fn print_hex(bytes: &[u8]) {
    log::debug!("\n{}", bytes_hex_format(bytes));
}
