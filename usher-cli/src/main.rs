use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info};
use usher_core::config::{Config, LoggingConfig};
use usher_core::core_audit::{latest_open_issuance, read_records, AuditRecord};
use usher_core::core_invite::{ChannelId, Registry, UserId};
use usher_core::logging::{init_logging, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "usher")]
#[command(author, version, about = "Inspect usher invite state offline", long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true, default_value = "usher.toml")]
    config: PathBuf,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configuration, then list tiers
    CheckConfig,

    /// Fold the audit log and print active assignments as JSON
    Replay,

    /// Print the last audit records
    Tail {
        /// Number of records
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },

    /// Show the issuance a join by this user would be reconciled against
    Lookup {
        /// Joining user id
        #[arg(long)]
        user: i64,

        /// Channel joined
        #[arg(long, allow_hyphen_values = true)]
        channel: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log_level.parse::<LogLevel>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', using 'warn'", args.log_level);
        LogLevel::Warn
    });
    init_logging(&LoggingConfig {
        level: log_level.to_string(),
        json_format: args.json_logs,
        ..LoggingConfig::default()
    })?;

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    debug!(path = %args.config.display(), "Configuration loaded");

    match args.command {
        Command::CheckConfig => {
            print!("{}", describe_tiers(&config));
            info!("Configuration is valid");
        }
        Command::Replay => {
            let records = read_log(&config)?;
            let registry = Registry::fold(&records, &config);
            let assignments = registry.snapshot().await;
            println!("{}", serde_json::to_string_pretty(&assignments)?);
        }
        Command::Tail { lines } => {
            let records = read_log(&config)?;
            for record in last_records(&records, lines) {
                print!("{}", record.to_line()?);
            }
        }
        Command::Lookup { user, channel } => {
            let records = read_log(&config)?;
            let found =
                latest_open_issuance(&records, UserId(user), channel.map(ChannelId), &config);
            match found {
                Some(record) => print!("{}", record.to_line()?),
                None => println!("no open issuance for {}", user),
            }
        }
    }

    Ok(())
}

fn read_log(config: &Config) -> Result<Vec<AuditRecord>> {
    let path = &config.storage.invite_log;
    read_records(path).with_context(|| format!("reading {}", path.display()))
}

fn describe_tiers(config: &Config) -> String {
    let mut out = String::new();
    for key in config.tiers.keys() {
        if let Some(tier) = config.tier(key) {
            out.push_str(&format!(
                "{} ({}) -> channel {} approval={} ttl={}s relay={}\n",
                tier.key,
                tier.label(),
                tier.channel_id,
                tier.approval_required,
                tier.ttl.as_secs(),
                tier.relay_command,
            ));
        }
    }
    out
}

fn last_records(records: &[AuditRecord], n: usize) -> &[AuditRecord] {
    &records[records.len().saturating_sub(n)..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use usher_core::config::TierConfig;
    use usher_core::core_audit::AuditAction;

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "usher",
            "--config",
            "prod.toml",
            "lookup",
            "--user",
            "555",
            "--channel",
            "-1001",
        ]);
        assert_eq!(args.config, PathBuf::from("prod.toml"));
        match args.command {
            Command::Lookup { user, channel } => {
                assert_eq!(user, 555);
                assert_eq!(channel, Some(-1001));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_describe_tiers() {
        let mut config = Config::default();
        config.tiers.insert("v1".to_string(), TierConfig::new(-1001));

        let text = describe_tiers(&config);
        assert_eq!(
            text,
            "v1 (VIP1) -> channel -1001 approval=true ttl=86400s relay=/addv1\n"
        );
    }

    #[test]
    fn test_last_records() {
        let records: Vec<AuditRecord> = (0..5)
            .map(|_| AuditRecord::new(AuditAction::RelayAddv))
            .collect();
        assert_eq!(last_records(&records, 2).len(), 2);
        assert_eq!(last_records(&records, 10).len(), 5);
    }
}
