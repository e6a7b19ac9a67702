mod db_commands;
mod key_commands;
mod pii_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    keyward_config::{KeywardConfig, Severity},
    keyward_keys::KeyPurpose,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "keyward", about = "Keyward: per-tenant envelope encryption and key lifecycle")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of ./keyward.toml and ~/.config/keyward/).
    #[arg(long, global = true, env = "KEYWARD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh random base64 master key.
    GenMasterKey,
    /// Encrypt stdin and print the payload as JSON.
    Encrypt {
        #[arg(long)]
        tenant: String,
        #[arg(long, value_parser = parse_purpose)]
        purpose: KeyPurpose,
        /// Field name bound into the ciphertext.
        #[arg(long)]
        field: Option<String>,
    },
    /// Decrypt a JSON payload read from stdin.
    Decrypt {
        #[arg(long)]
        tenant: String,
    },
    /// Rotate the active key and print the re-encryption task.
    Rotate {
        #[arg(long)]
        tenant: String,
        #[arg(long, value_parser = parse_purpose)]
        purpose: KeyPurpose,
    },
    /// Retire a superseded key after its data has been migrated.
    CompleteRotation {
        #[arg(long)]
        tenant: String,
        #[arg(long, value_parser = parse_purpose)]
        purpose: KeyPurpose,
        #[arg(long)]
        key_id: String,
    },
    /// List key versions (metadata only).
    Keys {
        #[arg(long)]
        tenant: String,
        /// Limit to one purpose; all purposes when omitted.
        #[arg(long, value_parser = parse_purpose)]
        purpose: Option<KeyPurpose>,
    },
    /// Hash an identifier with the configured salt.
    Hash {
        /// Value to hash; read from stdin when omitted.
        value: Option<String>,
        /// Environment variable holding the salt (overrides pii.hash_salt_var).
        #[arg(long)]
        salt_var: Option<String>,
    },
    /// Mask a value for display.
    Mask {
        /// Value to mask; read from stdin when omitted.
        value: Option<String>,
        #[arg(long = "type", value_parser = parse_mask_type)]
        mask_type: keyward_keys::MaskType,
    },
    /// Validate the configuration and print diagnostics.
    CheckConfig,
    /// Database management.
    Db {
        #[command(subcommand)]
        action: db_commands::DbAction,
    },
}

fn parse_purpose(s: &str) -> Result<KeyPurpose, String> {
    s.parse().map_err(|e: keyward_keys::KeyError| e.to_string())
}

fn parse_mask_type(s: &str) -> Result<keyward_keys::MaskType, String> {
    s.parse().map_err(|e: keyward_keys::KeyError| e.to_string())
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries command output.
    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<KeywardConfig> {
    let config = match &cli.config {
        Some(path) => keyward_config::load_config(path)?,
        None => keyward_config::discover_and_load()?,
    };

    let result = keyward_config::validate(&config);
    for diagnostic in &result.diagnostics {
        match diagnostic.severity {
            Severity::Error => tracing::error!(path = %diagnostic.path, "{}", diagnostic.message),
            Severity::Warning => warn!(path = %diagnostic.path, "{}", diagnostic.message),
        }
    }
    if result.has_errors() {
        anyhow::bail!("invalid configuration; run `keyward check-config` for details");
    }
    Ok(config)
}

fn init_metrics(config: &KeywardConfig) -> anyhow::Result<keyward_metrics::MetricsHandle> {
    keyward_metrics::init_metrics(keyward_metrics::MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels: config
            .metrics
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "keyward starting");

    if let Commands::GenMasterKey = cli.command {
        println!("{}", keyward_keys::master_key::generate_master_key().as_str());
        return Ok(());
    }
    if let Commands::CheckConfig = cli.command {
        return check_config(&cli);
    }

    let config = load_config(&cli)?;
    let metrics = init_metrics(&config)?;

    let result = match cli.command {
        Commands::Encrypt {
            tenant,
            purpose,
            field,
        } => key_commands::encrypt(&config, &tenant, purpose, field).await,
        Commands::Decrypt { tenant } => key_commands::decrypt(&config, &tenant).await,
        Commands::Rotate { tenant, purpose } => {
            key_commands::rotate(&config, &tenant, purpose).await
        },
        Commands::CompleteRotation {
            tenant,
            purpose,
            key_id,
        } => key_commands::complete_rotation(&config, &tenant, purpose, &key_id).await,
        Commands::Keys { tenant, purpose } => {
            key_commands::list_keys(&config, &tenant, purpose).await
        },
        Commands::Hash { value, salt_var } => {
            pii_commands::hash(&config, value, salt_var.as_deref())
        },
        Commands::Mask { value, mask_type } => pii_commands::mask(value, mask_type),
        Commands::Db { action } => db_commands::handle_db(&config, action).await,
        Commands::GenMasterKey | Commands::CheckConfig => Ok(()),
    };

    if config.metrics.prometheus {
        eprint!("{}", metrics.render());
    }
    result
}

fn check_config(cli: &Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => keyward_config::load_config(path)?,
        None => keyward_config::discover_and_load()?,
    };
    let result = keyward_config::validate(&config);
    if result.diagnostics.is_empty() {
        println!("configuration OK");
    }
    for diagnostic in &result.diagnostics {
        println!("{diagnostic}");
    }
    if result.has_errors() {
        anyhow::bail!("configuration has errors");
    }
    Ok(())
}
