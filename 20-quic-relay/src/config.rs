//! Validated server settings.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Error, ensure};

use crate::cli::ServeArgs;
use crate::dispatcher::DispatchLimits;
use crate::session::DEFAULT_MAX_STREAMS_PER_SESSION;
use crate::store::StoreConfig;
use crate::sweeper::SweepSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub store: StoreConfig,
    pub sweep: SweepSettings,
    pub limits: DispatchLimits,
    pub max_streams_per_session: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            cert_path: PathBuf::from("cert.pem"),
            key_path: PathBuf::from("key.pem"),
            store: StoreConfig::Memory,
            sweep: SweepSettings::default(),
            limits: DispatchLimits::default(),
            max_streams_per_session: DEFAULT_MAX_STREAMS_PER_SESSION,
        }
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        ensure!(args.sweep_interval_secs > 0, "sweep interval must be positive");
        let idle_timeout_secs = args.idle_timeout_secs.unwrap_or(args.sweep_interval_secs);
        ensure!(idle_timeout_secs > 0, "idle timeout must be positive");
        ensure!(args.max_upload_mib > 0, "upload limit must be positive");
        ensure!(args.max_envelope_kib > 0, "envelope limit must be positive");
        ensure!(
            args.max_streams_per_session > 0,
            "max streams per session must be positive"
        );

        let max_upload_bytes = args
            .max_upload_mib
            .checked_mul(1024 * 1024)
            .ok_or_else(|| anyhow::anyhow!("upload limit is too large"))?;
        let max_envelope_bytes = args
            .max_envelope_kib
            .checked_mul(1024)
            .ok_or_else(|| anyhow::anyhow!("envelope limit is too large"))?;

        Ok(Self {
            listen: args.listen,
            cert_path: args.identity.cert,
            key_path: args.identity.key,
            store: match args.store_dir {
                Some(dir) => StoreConfig::Directory(dir),
                None => StoreConfig::Memory,
            },
            sweep: SweepSettings {
                interval: Duration::from_secs(args.sweep_interval_secs),
                idle_timeout: Duration::from_secs(idle_timeout_secs),
            },
            limits: DispatchLimits {
                max_envelope_bytes,
                max_upload_bytes,
            },
            max_streams_per_session: args.max_streams_per_session,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Command};

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let argv = ["quic-relay", "serve"].iter().chain(extra);
        match Cli::parse_from(argv).command {
            Command::Serve(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn defaults_match_the_default_config() {
        let config = RelayConfig::try_from(serve_args(&[])).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn idle_timeout_follows_the_sweep_interval() {
        let config = RelayConfig::try_from(serve_args(&["--sweep-interval-secs", "5"])).unwrap();
        assert_eq!(config.sweep.interval, Duration::from_secs(5));
        assert_eq!(config.sweep.idle_timeout, Duration::from_secs(5));

        let config = RelayConfig::try_from(serve_args(&[
            "--sweep-interval-secs",
            "5",
            "--idle-timeout-secs",
            "30",
        ]))
        .unwrap();
        assert_eq!(config.sweep.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn store_dir_selects_the_directory_backend() {
        let config = RelayConfig::try_from(serve_args(&["--store-dir", "/tmp/blobs"])).unwrap();
        assert_eq!(config.store, StoreConfig::Directory(PathBuf::from("/tmp/blobs")));
    }

    #[test]
    fn zero_values_are_rejected() {
        for flag in [
            "--sweep-interval-secs",
            "--idle-timeout-secs",
            "--max-upload-mib",
            "--max-envelope-kib",
            "--max-streams-per-session",
        ] {
            let err = RelayConfig::try_from(serve_args(&[flag, "0"])).unwrap_err();
            assert!(err.to_string().contains("positive"), "{flag}: {err}");
        }
    }
}
