//! Depot server binary.
//!
//! Usage: depotd [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>   Run with a TOML configuration file
//!   -g, --generate        Print a default configuration
//!   --allow-client <FILE> <NAME> <KEYFILE>
//!                         Add a base64 client public key to the allowlist
//!   -h, --help            Print help information

use std::env;
use std::sync::Arc;

use depot::server::{Server, ServerConfig, ServerConfigFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; respects RUST_LOG env var (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => print_usage(),
        "-g" | "--generate" => generate_config()?,
        "-c" | "--config" => {
            let Some(path) = args.get(2) else {
                anyhow::bail!("--config requires a file path");
            };
            run_server(path).await?;
        }
        "--allow-client" => {
            let [config, name, keyfile] = &args[2..] else {
                anyhow::bail!("--allow-client requires <CONFIG> <NAME> <KEYFILE>");
            };
            allow_client(config, name, keyfile)?;
        }
        other => {
            eprintln!("Unknown option: {other}");
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"depotd - depot file transfer server

USAGE:
    depotd [OPTIONS]

OPTIONS:
    -c, --config <FILE>                     Run with a configuration file
    -g, --generate                          Print a default configuration
    --allow-client <CONFIG> <NAME> <KEYFILE>
                                            Allow a client public key (base64 file)
    -h, --help                              Print help information

EXAMPLES:
    Generate a configuration:
        depotd --generate > depot.toml

    Run the server:
        depotd --config depot.toml

    Allow a client exported with `depot identity show`:
        depotd --allow-client depot.toml laptop laptop.pk
"#
    );
}

fn load_config(path: &str) -> anyhow::Result<ServerConfig> {
    let text = std::fs::read_to_string(path)?;
    let file: ServerConfigFile = toml::from_str(&text)?;
    Ok(file.to_config())
}

async fn run_server(path: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let server = Arc::new(Server::new(config)?);
    server.run().await?;
    Ok(())
}

fn generate_config() -> anyhow::Result<()> {
    let mut config = ServerConfig::new("/srv/depot");
    config.passphrase = Some("change-me".to_string());

    println!("# depot server configuration");
    println!("{}", toml::to_string_pretty(&ServerConfigFile::from_config(&config))?);
    Ok(())
}

fn allow_client(config_path: &str, name: &str, keyfile: &str) -> anyhow::Result<()> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use depot::identity::IdentityStore;

    let config = load_config(config_path)?;
    let store = IdentityStore::open(config.config_dir.clone())?;

    let encoded = std::fs::read_to_string(keyfile)?;
    let key = STANDARD.decode(encoded.trim())?;
    store.allow_client(name, &key)?;

    println!("allowed client '{name}' ({} key bytes)", key.len());
    Ok(())
}
