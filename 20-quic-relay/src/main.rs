use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use quic_relay::{
    cli::{Cli, Command},
    config::RelayConfig,
    server::RelayServer,
    store::open_store,
    transport::quic::TlsIdentity,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            init_tracing();
            let config = RelayConfig::try_from(args)?;
            let identity = TlsIdentity::load_or_generate(&config.cert_path, &config.key_path)?;
            info!(fingerprint = %identity.fingerprint(), "certificate fingerprint");

            let store = open_store(&config.store).await?;
            let server = RelayServer::bind(&config, &identity, store)?;
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Fingerprint(args) => {
            let identity = TlsIdentity::load_or_generate(&args.cert, &args.key)?;
            println!("{}", identity.fingerprint());
        }
    }

    Ok(())
}
