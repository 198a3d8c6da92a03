//! docwire - command-line client
//!
//! Connects to a server, runs one command against `<db>.$cmd` and prints the
//! reply documents.

use anyhow::Context;
use bson::Document;
use docwire::protocol::command;
use docwire::{BackendKind, Connection, ConnectionConfig, IdlePool, DEFAULT_HOST, DEFAULT_PORT};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Client configuration
struct Config {
    connection: ConnectionConfig,
    /// Database whose `$cmd` namespace receives the command
    database: String,
    user: Option<String>,
    password: Option<String>,
    /// Command name, sent as `{ <command>: 1 }`
    command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            database: "admin".to_string(),
            user: None,
            password: None,
            command: "ping".to_string(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.connection.host = value(&args, i, "--host").to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.connection.port = value(&args, i, "--port").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--db" | "-d" => {
                    config.database = value(&args, i, "--db").to_string();
                    i += 2;
                }
                "--user" | "-u" => {
                    config.user = Some(value(&args, i, "--user").to_string());
                    i += 2;
                }
                "--password" => {
                    config.password = Some(value(&args, i, "--password").to_string());
                    i += 2;
                }
                "--backend" => {
                    config.connection.backend = value(&args, i, "--backend")
                        .parse::<BackendKind>()
                        .unwrap_or_else(|e| {
                            eprintln!("Error: {}", e);
                            std::process::exit(1);
                        });
                    i += 2;
                }
                "--connect-timeout" => {
                    config.connection.connect_timeout = seconds(value(&args, i, "--connect-timeout"));
                    i += 2;
                }
                "--request-timeout" => {
                    config.connection.request_timeout = seconds(value(&args, i, "--request-timeout"));
                    i += 2;
                }
                "--no-autoreconnect" => {
                    config.connection.autoreconnect = false;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("docwire version {}", docwire::VERSION);
                    std::process::exit(0);
                }
                arg if arg.starts_with('-') => {
                    eprintln!("Unknown argument: {}", arg);
                    print_help();
                    std::process::exit(1);
                }
                name => {
                    config.command = name.to_string();
                    i += 1;
                }
            }
        }

        match (&config.user, &config.password) {
            (Some(user), Some(password)) => {
                config.connection = config.connection.credentials(user.as_str(), password.as_str());
            }
            (None, None) => {}
            _ => {
                eprintln!("Error: --user and --password must be given together");
                std::process::exit(1);
            }
        }

        config
    }
}

/// Returns the value following the flag at `i`, or exits.
fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(v) => v.as_str(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

/// Parses a timeout in seconds; `0` disables it.
fn seconds(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid timeout: {}", raw);
        std::process::exit(1);
    });
    if secs <= 0.0 {
        None
    } else {
        Some(Duration::from_secs_f64(secs))
    }
}

fn print_help() {
    println!(
        r#"
docwire - connection-level document database client

USAGE:
    docwire [OPTIONS] [COMMAND]

ARGS:
    <COMMAND>                      Command to run as {{ <COMMAND>: 1 }} (default: ping)

OPTIONS:
    -h, --host <HOST>              Server host (default: {host})
    -p, --port <PORT>              Server port (default: {port})
    -d, --db <DB>                  Database for the command and login (default: admin)
    -u, --user <USER>              Username
        --password <PASSWORD>      Password
        --backend <BACKEND>        Transport backend: tokio, blocking (default: tokio)
        --connect-timeout <SECS>   Connect timeout, 0 disables (default: 20)
        --request-timeout <SECS>   Request timeout, 0 disables (default: 20)
        --no-autoreconnect         Do not reconnect a closed connection
    -v, --version                  Print version information
        --help                     Print this help message

EXAMPLES:
    docwire                                  # ping 127.0.0.1:27017
    docwire --db app -u app --password s3cret buildinfo
    RUST_LOG=docwire=trace docwire ismaster  # show wire-level events
"#,
        host = DEFAULT_HOST,
        port = DEFAULT_PORT,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let pool = Arc::new(IdlePool::new(config.database.as_str()));
    let address = config.connection.address();

    let conn = Connection::connect(config.connection, pool)
        .await
        .with_context(|| format!("could not connect to {}", address))?;
    info!(connection = conn.id(), address = %address, "Connected");

    let mut body = Document::new();
    body.insert(config.command.as_str(), 1);
    let message = command(&config.database, &body)?;
    debug!(request_id = message.request_id, command = %config.command, "Sending command");

    let outcome = match conn.send_message(message) {
        Ok(pending) => pending.await,
        Err(e) => Err(e),
    };
    conn.close().await;

    let reply = outcome.with_context(|| format!("{} failed", config.command))?;
    for document in &reply.documents {
        println!("{}", document);
    }

    Ok(())
}
