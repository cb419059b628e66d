//! kapsule-dbus-broker - D-Bus message bus broker.
//!
//! Listens on a Unix socket and routes messages between the peers that
//! connect to it.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kapsule_dbus_broker::user::UserLimits;
use kapsule_dbus_broker::{Broker, BusConfig, Error, Result};

/// D-Bus message bus broker.
#[derive(Parser, Debug)]
#[command(name = "kapsule-dbus-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Socket path for peers to connect to.
    #[arg(long, short = 'l')]
    listen: PathBuf,

    /// Log level filter (e.g., "debug", "info", "warn", "error").
    #[arg(long, short = 'v', default_value = "info")]
    log_level: String,

    /// Well-known names each user may own or queue for.
    #[arg(long, default_value_t = 512)]
    max_names: usize,

    /// Match rules each user may install.
    #[arg(long, default_value_t = 16 * 1024)]
    max_matches: usize,

    /// Pending method calls each user may have outstanding.
    #[arg(long, default_value_t = 8 * 1024)]
    max_replies: usize,

    /// Messages buffered per peer before delivery fails.
    #[arg(long, default_value_t = 256)]
    max_queue: usize,

    /// Largest message accepted from a peer, in bytes.
    #[arg(long)]
    max_message_size: Option<u64>,

    /// Deny ownership of this well-known name. May be repeated.
    #[arg(long = "deny-own", value_name = "NAME")]
    deny_own: Vec<String>,

    /// Server GUID as 32 hex digits. Random if not given.
    #[arg(long)]
    guid: Option<String>,
}

fn parse_guid(s: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(s).map_err(|e| Error::Config(format!("invalid GUID: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::Config("GUID must be 16 bytes".to_string()))
}

fn build_config(args: &Args) -> Result<BusConfig> {
    let mut config = BusConfig {
        limits: UserLimits {
            max_names: args.max_names,
            max_matches: args.max_matches,
            max_replies: args.max_replies,
        },
        max_queue: args.max_queue,
        ..BusConfig::default()
    };
    if let Some(size) = args.max_message_size {
        config.max_message_size = size.min(config.max_message_size);
    }
    if let Some(guid) = &args.guid {
        config.guid = parse_guid(guid)?;
    }
    for name in &args.deny_own {
        config.policy.deny_own(name);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    info!(
        listen = %args.listen.display(),
        version = env!("CARGO_PKG_VERSION"),
        git_hash = option_env!("GIT_HASH").unwrap_or("unknown"),
        built = env!("BUILD_TIMESTAMP"),
        "Starting kapsule-dbus-broker"
    );

    let config = build_config(&args)?;
    let broker = Broker::bind(args.listen.clone(), config)?;

    // Handle shutdown signals
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
    };

    tokio::select! {
        result = broker.run() => {
            if let Err(e) = result {
                error!(error = %e, "Broker error");
                return Err(e);
            }
        }
        _ = shutdown => {
            info!("Shutting down");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_guid() {
        let guid = parse_guid("30313233343536373839616263646566").unwrap();
        assert_eq!(&guid, b"0123456789abcdef");
        assert!(parse_guid("abcd").is_err());
        assert!(parse_guid("zz").is_err());
    }

    #[test]
    fn test_build_config() {
        let args = Args::parse_from([
            "kapsule-dbus-broker",
            "--listen",
            "/tmp/bus",
            "--max-names",
            "4",
            "--max-message-size",
            "1024",
            "--deny-own",
            "org.example.Forbidden",
            "--guid",
            "30313233343536373839616263646566",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.limits.max_names, 4);
        assert_eq!(config.limits.max_matches, 16 * 1024);
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(&config.guid, b"0123456789abcdef");

        let policy = config.policy.instantiate(1000);
        assert!(policy.check_own("org.example.Forbidden").is_err());
        assert!(policy.check_own("org.example.Allowed").is_ok());
    }
}
