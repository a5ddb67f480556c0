use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use syncbox::config::Config;
use syncbox::logger::{Logger, NoopLogger, TextLogger};
use syncbox::server::Server;

#[derive(Parser, Debug)]
#[command(name = "syncboxd", about = "Syncbox file synchronization server")]
struct Opts {
    /// Server configuration file
    config: PathBuf,

    /// Override the configured listen address (host:port)
    #[arg(long)]
    bind: Option<String>,

    /// Override the configured log file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let mut config = Config::load(&opts.config)?;
    if let Some(bind) = opts.bind {
        config.bind = bind;
    }
    if let Some(log_file) = opts.log_file {
        config.log_file = Some(log_file);
    }

    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("create sync root {}", config.root.display()))?;

    let logger: Arc<dyn Logger> = match &config.log_file {
        Some(path) => Arc::new(TextLogger::new(path)?),
        None => Arc::new(NoopLogger),
    };

    println!("Root: {}", config.root.display());
    println!("Bind: {}", config.bind);
    println!("Workers: {}", config.workers);

    Server::bind(config, logger)?.run()
}
