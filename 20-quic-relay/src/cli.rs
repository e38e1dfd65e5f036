use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting QUIC sessions.
    Serve(ServeArgs),
    /// Print the SHA-256 fingerprint of the server certificate, creating it if needed.
    Fingerprint(IdentityArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IdentityArgs {
    /// PEM certificate the server presents.
    #[arg(long, default_value = "cert.pem")]
    pub cert: PathBuf,

    /// PEM private key matching the certificate.
    #[arg(long, default_value = "key.pem")]
    pub key: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Directory for uploaded objects. Objects are kept in memory when unset.
    #[arg(long)]
    pub store_dir: Option<PathBuf>,

    /// Seconds between eviction sweeps.
    #[arg(long, default_value_t = 20)]
    pub sweep_interval_secs: u64,

    /// Seconds without traffic before a peer is evicted. Defaults to the sweep interval.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Largest accepted upload, in MiB.
    #[arg(long, default_value_t = 64)]
    pub max_upload_mib: u64,

    /// Largest accepted envelope, in KiB.
    #[arg(long, default_value_t = 8192)]
    pub max_envelope_kib: usize,

    /// Streams one session may have in flight at once.
    #[arg(long, default_value_t = 256)]
    pub max_streams_per_session: usize,
}
