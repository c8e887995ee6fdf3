mod certificate;
mod config;
mod crypto;
mod error;
mod network;
mod report;
mod session;
#[cfg(test)]
mod test_server;
mod verify;

use std::io::Write;

use tracing_subscriber::EnvFilter;

use config::Config;
use session::TlsSession;

fn run(config: &Config, out: &mut impl Write) -> Result<(), error::Error> {
    let identity = certificate::generate(config)?;
    let session = TlsSession::connect(config, &identity)?;

    report::report(&session.connection_state(), config, out)?;

    session.close()?;
    writeln!(out, "Connection closed.")?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let stdout = std::io::stdout();
    match run(&Config::default(), &mut stdout.lock()) {
        Ok(_) => {}
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };
}
