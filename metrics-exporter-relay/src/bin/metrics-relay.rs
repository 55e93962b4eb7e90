use std::env;
use std::net::SocketAddr;
use std::process;
use std::time::Duration;

use getopts::{Matches, Options};
use metrics_exporter_relay::{BuildError, RelayBuilder};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

pub fn opts() -> Options {
    let mut opts = Options::new();

    opts.optopt(
        "i",
        "ingest-address",
        "address producers publish metrics to (default 0.0.0.0:50051)",
        "ADDRESS",
    );
    opts.optopt(
        "l",
        "listen-address",
        "address the Prometheus scrape endpoint listens on (default 0.0.0.0:2112)",
        "ADDRESS",
    );
    opts.optopt(
        "v",
        "validity-secs",
        "seconds a series stays exported without updates (default 60)",
        "INTEGER",
    );
    opts.optopt("", "label", "static label added to every series", "KEY:VALUE");
    opts.optmulti("", "allow", "address or subnet allowed to scrape (default: any)", "CIDR");
    opts.optflag("h", "help", "print this help menu");

    opts
}

fn parse_address(matches: &Matches, name: &str) -> Result<Option<SocketAddr>, String> {
    matches
        .opt_str(name)
        .map(|s| s.parse::<SocketAddr>().map_err(|e| format!("invalid --{} `{}`: {}", name, s, e)))
        .transpose()
}

fn builder_from(matches: &Matches) -> Result<RelayBuilder, String> {
    let mut builder = RelayBuilder::new();

    if let Some(addr) = parse_address(matches, "ingest-address")? {
        builder = builder.with_ingest_listener(addr);
    }
    if let Some(addr) = parse_address(matches, "listen-address")? {
        builder = builder.with_http_listener(addr);
    }
    if let Some(secs) = matches.opt_str("validity-secs") {
        let secs = secs
            .parse::<u64>()
            .map_err(|e| format!("invalid --validity-secs `{}`: {}", secs, e))?;
        builder = builder.validity_window(Duration::from_secs(secs)).map_err(|e| e.to_string())?;
    }
    if let Some(label) = matches.opt_str("label") {
        builder = builder.static_label_str(label).map_err(|e| e.to_string())?;
    }
    for address in matches.opt_strs("allow") {
        builder = builder.add_allowed_address(address).map_err(|e| e.to_string())?;
    }

    Ok(builder)
}

fn run(builder: RelayBuilder) -> Result<(), BuildError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

    let (_registry, exporter) = {
        let _g = runtime.enter();
        builder.build()?
    };

    info!("metrics relay running");

    if let Err(e) = runtime.block_on(exporter) {
        error!(error = %e, "metrics relay stopped");
        process::exit(1);
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let program = &args[0];
    let opts = opts();

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            error!("Failed to parse command line args: {}", f);
            process::exit(2);
        }
    };

    if matches.opt_present("help") {
        print_usage(program, &opts);
        return;
    }

    let builder = match builder_from(&matches) {
        Ok(builder) => builder,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    if let Err(e) = run(builder) {
        error!(error = %e, "failed to start metrics relay");
        process::exit(1);
    }
}
