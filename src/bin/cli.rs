use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use tracing::{debug, Level};

use rustdis_client::config::{ProtocolVersion, TlsConfig, DEFAULT_PORT};
use rustdis_client::{Command, Config, Connection, Error, Frame};

#[derive(Parser, Debug)]
#[command(
    name = "rustdis-cli",
    about = "Send a command to a Redis server",
    disable_help_flag = true
)]
struct Args {
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Server url, e.g. redis://:password@localhost:6379/0
    #[arg(long, env = "REDIS_URL", conflicts_with_all = ["host", "port"])]
    url: Option<String>,

    #[arg(short = 'h', long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short = 'a', long, env = "REDIS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long)]
    user: Option<String>,

    /// Database number
    #[arg(short = 'n', long)]
    db: Option<i64>,

    #[arg(long)]
    tls: bool,

    /// Negotiate RESP3 with HELLO
    #[arg(long)]
    resp3: bool,

    /// Command timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Log protocol traffic
    #[arg(short, long)]
    verbose: bool,

    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Args {
    fn config(&self) -> Result<Config, Error> {
        let mut config = match &self.url {
            Some(url) => Config::from_url(url)?,
            None => Config {
                host: self.host.clone(),
                port: self.port,
                ..Config::default()
            },
        };

        if self.password.is_some() {
            config.password = self.password.clone();
        }
        if self.user.is_some() {
            config.username = self.user.clone();
        }
        if let Some(db) = self.db {
            config.database = db;
        }
        if self.tls && config.tls.is_none() {
            config.tls = Some(TlsConfig::default());
        }
        if self.resp3 {
            config.protocol = ProtocolVersion::Resp3;
        }
        config.command_timeout = self.timeout.map(Duration::from_millis);

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _ = tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| eprintln!("Failed to initialize global tracing: {}", e));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("(error) {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let config = args.config()?;
    debug!(?config, "connecting");

    let connection = Connection::connect(config).await?;
    let command = Command::new(&args.command[0]).args(&args.command[1..]);

    if command.is_subscribe() {
        let mut subscription = if command.name() == "PSUBSCRIBE" {
            connection.psubscribe(command.params().iter()).await?
        } else {
            connection.subscribe(command.params().iter()).await?
        };

        for name in command.params() {
            println!("Reading messages from {}...", String::from_utf8_lossy(name));
        }

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                message = subscription.next() => match message {
                    Some(message) => {
                        let channel = String::from_utf8_lossy(&message.channel);
                        let payload = String::from_utf8_lossy(&message.payload);
                        match &message.pattern {
                            Some(pattern) => println!(
                                "{} {} {}",
                                String::from_utf8_lossy(pattern),
                                channel,
                                payload
                            ),
                            None => println!("{} {}", channel, payload),
                        }
                    }
                    None => break,
                },
            }
        }
    } else {
        let reply = connection.submit(command).await;
        match reply {
            Ok(frame) => print!("{}", render(&frame, 0)),
            Err(Error::Server(msg)) => println!("(error) {}", msg),
            Err(err) => return Err(err),
        }
    }

    connection.close().await;

    Ok(())
}

/// Formats a reply the way `redis-cli` does.
fn render(frame: &Frame, indent: usize) -> String {
    match frame {
        Frame::Simple(s) => format!("{}\n", s),
        Frame::Error(s) => format!("(error) {}\n", s),
        Frame::Integer(i) => format!("(integer) {}\n", i),
        Frame::Bulk(bytes) => format!("\"{}\"\n", String::from_utf8_lossy(bytes).escape_debug()),
        Frame::Verbatim { text, .. } => format!("{}\n", String::from_utf8_lossy(text)),
        Frame::NullBulk | Frame::NullArray | Frame::Null => "(nil)\n".to_string(),
        Frame::Boolean(b) => format!("({})\n", if *b { "true" } else { "false" }),
        Frame::Double(d) => format!("(double) {}\n", d),
        Frame::BigNumber(n) => format!("(big number) {}\n", n),
        Frame::Array(frames) | Frame::Set(frames) | Frame::Push(frames) => {
            if frames.is_empty() {
                return "(empty array)\n".to_string();
            }
            let elements: Vec<String> = frames
                .iter()
                .map(|frame| render(frame, indent + 3))
                .collect();
            numbered(elements, indent)
        }
        Frame::Map(pairs) => {
            if pairs.is_empty() {
                return "(empty hash)\n".to_string();
            }
            let elements: Vec<String> = pairs
                .iter()
                .map(|(key, value)| {
                    let key = render(key, indent + 3);
                    format!("{} => {}", key.trim_end(), render(value, indent + 3))
                })
                .collect();
            numbered(elements, indent)
        }
    }
}

fn numbered(elements: Vec<String>, indent: usize) -> String {
    let mut out = String::new();
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            out.push_str(&" ".repeat(indent));
        }
        out.push_str(&format!("{}) {}", i + 1, element));
    }
    out
}
