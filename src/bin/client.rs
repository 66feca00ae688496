//! Depot client binary.
//!
//! Usage: depot [OPTIONS] <COMMAND> [ARGS]
//!
//! Commands:
//!   send <LOCAL>... [--to <REMOTE_DIR>]   Upload files or trees
//!   recv <REMOTE>... [--into <DIR>]       Download files or trees
//!   list <REMOTE>                         List a remote path
//!   identity init                         Generate a client identity
//!   identity show                         Print the client public key (base64)

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use depot::identity::IdentityStore;
use depot::wire::EntryKind;
use depot::{Client, ClientConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    match run().await {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            eprintln!("depot: {e}");
            ExitCode::from(1)
        }
    }
}

struct Cli {
    config: ClientConfig,
    command: String,
    args: Vec<String>,
    to: String,
    into: PathBuf,
}

fn parse_args() -> anyhow::Result<Cli> {
    let mut config = ClientConfig::new("127.0.0.1");
    let mut command = String::new();
    let mut positional = Vec::new();
    let mut to = String::new();
    let mut into = PathBuf::from(".");

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
        };
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--host" => config.host = value("--host")?,
            "--port" => config.port = value("--port")?.parse()?,
            "--psk" => config.psk = Some(value("--psk")?),
            "--config-dir" => config.config_dir = Some(PathBuf::from(value("--config-dir")?)),
            "--skip-existing" => config.skip_existing = true,
            "--to" => to = value("--to")?,
            "--into" => into = PathBuf::from(value("--into")?),
            other if command.is_empty() && !other.starts_with('-') => {
                command = other.to_string();
            }
            other if !other.starts_with('-') => positional.push(other.to_string()),
            other => anyhow::bail!("unknown option {other}"),
        }
    }

    if command.is_empty() {
        print_usage();
        std::process::exit(0);
    }

    Ok(Cli {
        config,
        command,
        args: positional,
        to,
        into,
    })
}

async fn run() -> anyhow::Result<bool> {
    let cli = parse_args()?;

    match cli.command.as_str() {
        "identity" => return identity_command(&cli),
        "send" => {
            if cli.args.is_empty() {
                anyhow::bail!("send requires at least one local path");
            }
            let mut client = Client::connect(&cli.config).await?;
            let paths: Vec<PathBuf> = cli.args.iter().map(PathBuf::from).collect();
            let summary = client.send_many(&paths, &cli.to).await?;
            client.close().await?;
            println!(
                "sent {} file(s), {} byte(s), {} skipped, {} failed",
                summary.files_sent, summary.bytes_moved, summary.skipped, summary.failed
            );
            Ok(summary.is_clean())
        }
        "recv" => {
            if cli.args.is_empty() {
                anyhow::bail!("recv requires at least one remote path");
            }
            let mut client = Client::connect(&cli.config).await?;
            let summary = client.recv_many(&cli.args, &cli.into).await?;
            client.close().await?;
            println!(
                "received {} file(s), {} byte(s), {} skipped, {} failed",
                summary.files_received, summary.bytes_moved, summary.skipped, summary.failed
            );
            Ok(summary.is_clean())
        }
        "list" => {
            let remote = cli.args.first().map(String::as_str).unwrap_or(".");
            let mut client = Client::connect(&cli.config).await?;
            let entries = client.list(remote).await?;
            client.close().await?;
            for entry in entries {
                match entry.kind {
                    EntryKind::Dir => println!("{}/", entry.path),
                    EntryKind::File => println!("{}\t{}", entry.path, entry.size),
                }
            }
            Ok(true)
        }
        other => anyhow::bail!("unknown command {other}"),
    }
}

fn identity_command(cli: &Cli) -> anyhow::Result<bool> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let store = IdentityStore::open(cli.config.config_dir.clone())?;
    match cli.args.first().map(String::as_str) {
        Some("init") => {
            let identity = store.init_client()?;
            println!("{}", STANDARD.encode(identity.public_bytes()));
            Ok(true)
        }
        Some("show") => match store.load_client()? {
            Some(identity) => {
                println!("{}", STANDARD.encode(identity.public_bytes()));
                Ok(true)
            }
            None => anyhow::bail!("no client identity; run `depot identity init`"),
        },
        _ => anyhow::bail!("identity requires `init` or `show`"),
    }
}

fn print_usage() {
    println!(
        r#"depot - secure file transfer client

USAGE:
    depot [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    send <LOCAL>...      Upload files or directory trees
    recv <REMOTE>...     Download files or directory trees
    list <REMOTE>        List a remote path
    identity init|show   Manage the client identity

OPTIONS:
    --host <HOST>            Server host (default 127.0.0.1)
    --port <PORT>            Server port (default 60006)
    --psk <KEY>              Pre-shared key
    --to <REMOTE_DIR>        Remote directory for send (default share root)
    --into <DIR>             Local destination for recv (default .)
    --skip-existing          Count existing destinations as skips
    --config-dir <DIR>       Override the key/trust directory
    -h, --help               Print help information

EXAMPLES:
    depot --host files.example.net send report.pdf --to inbox
    depot --host files.example.net recv inbox --into ~/Downloads
    depot --host files.example.net list inbox
"#
    );
}
