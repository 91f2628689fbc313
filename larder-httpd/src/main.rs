use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use larder_httpd as httpd;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = parse_options()?;

    httpd::logger::init().expect("global logger hasn't already been set");
    tracing::info!("version {}", env!("CARGO_PKG_VERSION"));

    match httpd::run(options).await {
        Ok(()) => {}
        Err(err) => {
            tracing::error!("Fatal: {:#}", err);
            process::exit(1);
        }
    }
    Ok(())
}

/// Parse command-line arguments into HTTP options.
fn parse_options() -> Result<httpd::Options, lexopt::Error> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut listen: Option<SocketAddr> = None;
    let mut config: Option<PathBuf> = None;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("listen") => {
                let addr = parser.value()?.parse()?;
                listen = Some(addr);
            }
            Long("config") | Short('c') => {
                let path: String = parser.value()?.parse()?;
                config = Some(PathBuf::from(path));
            }
            Long("help") | Short('h') => {
                println!("usage: larder-httpd [--listen <addr>] [--config <path>]");
                process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }
    Ok(httpd::Options {
        listen: listen.unwrap_or_else(|| ([0, 0, 0, 0], 8080).into()),
        config: config.unwrap_or_else(|| PathBuf::from("larder.json")),
    })
}
