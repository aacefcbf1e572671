use clap::crate_version;
use clap::Parser;
use std::path::PathBuf;

use oml::server;
use oml::server::database::{configure_backend, Backend};
use oml::util;

#[derive(Parser, Debug)]
#[clap(version = crate_version!(), author = "ninthakeey <ninthakeey@hotmail.com>")]
struct Opts {
    /// Port to accept OMSP clients on
    #[clap(short, long, default_value = "3003")]
    listen: u16,
    /// Directory the measurement databases are stored in
    #[clap(short, long, default_value = ".")]
    data_dir: PathBuf,
    /// Storage backend, sqlite or text
    #[clap(short, long, default_value = "sqlite")]
    backend: String,
    /// Append the diagnostic log to this file instead of stderr
    #[clap(long)]
    log_file: Option<PathBuf>,
    /// Verbosity (error: 1 .. debug: 4)
    #[clap(long)]
    log_level: Option<u32>,
}

fn main() {
    let opts: Opts = Opts::parse();
    util::init_logger(opts.log_file.as_deref(), opts.log_level);
    log::info!("{:?}", &opts);

    let backend = match opts.backend.as_str() {
        "sqlite" => Backend::Sqlite {
            data_dir: opts.data_dir.clone(),
        },
        "text" => Backend::Text {
            data_dir: opts.data_dir.clone(),
        },
        other => {
            log::error!("unknown backend '{}' (expected sqlite or text)", other);
            std::process::exit(1);
        }
    };
    if let Err(e) = configure_backend(backend) {
        log::error!("{}", e);
        std::process::exit(1);
    }

    let addr = format!("0.0.0.0:{}", opts.listen);
    if let Err(e) = smol::block_on(server::accept_loop(&addr)) {
        log::error!("{}", e);
        std::process::exit(2);
    }
}
