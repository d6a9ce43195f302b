use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use recorder::session::token::{SessionKind, mint_recording_id};
use recorder::{
    CachedPlaceDirectory, FileStorage, Server, ServerConfig, SessionToken, StaticPlaceDirectory,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rtsp-recorder", about = "Push-RTSP camera recording server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept camera pushes and record them to a directory
    Serve(ServeArgs),
    /// Print a signed Authorization header for a camera
    Token(TokenArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// HMAC secret for session tokens
    #[arg(long, env = "RECORDER_SECRET", hide_env_values = true)]
    secret: String,

    /// Directory recordings are written to
    #[arg(long, short, default_value = "recordings")]
    output: PathBuf,

    /// Place to account mapping (PLACE=ACCOUNT), repeatable
    #[arg(long = "place", value_parser = parse_place)]
    places: Vec<(Uuid, Uuid)>,

    /// Account for places without a mapping
    #[arg(long)]
    default_account: Option<Uuid>,

    /// Maximum age of a presented recording id, in seconds
    #[arg(long, default_value_t = 60)]
    session_timeout: u64,

    /// Idle read timeout, in seconds
    #[arg(long, default_value_t = 30)]
    idle_timeout: u64,

    /// Stream time between output flushes, in seconds
    #[arg(long, default_value_t = 5)]
    flush_interval: u64,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 1024)]
    max_connections: usize,

    /// Retention of live-stream sessions, in seconds
    #[arg(long)]
    stream_ttl: Option<u64>,
}

#[derive(Args)]
struct TokenArgs {
    #[arg(long, env = "RECORDER_SECRET", hide_env_values = true)]
    secret: String,

    #[arg(long)]
    account: Uuid,

    #[arg(long)]
    camera: Uuid,

    #[arg(long)]
    place: Uuid,

    #[arg(long)]
    person: Uuid,

    /// Recording id; nil lets the server mint one
    #[arg(long, default_value_t = Uuid::nil(), conflicts_with = "stream")]
    recording: Uuid,

    /// Mint a live-stream recording id now
    #[arg(long)]
    stream: bool,
}

fn parse_place(s: &str) -> Result<(Uuid, Uuid), String> {
    let (place, account) = s
        .split_once('=')
        .ok_or_else(|| format!("expected PLACE=ACCOUNT, got {s}"))?;
    let place = place.parse().map_err(|e| format!("place: {e}"))?;
    let account = account.parse().map_err(|e| format!("account: {e}"))?;
    Ok((place, account))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args),
        Command::Token(args) => token(args),
    }
}

fn serve(args: ServeArgs) {
    let config = ServerConfig {
        bind_addr: args.bind,
        secret: args.secret.into_bytes(),
        session_timeout_secs: args.session_timeout,
        idle_timeout_secs: args.idle_timeout,
        flush_interval_secs: args.flush_interval,
        max_connections: args.max_connections,
        stream_ttl_secs: args.stream_ttl,
        ..ServerConfig::default()
    };

    let mut storage = match FileStorage::new(&args.output) {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("Failed to open {}: {}", args.output.display(), e);
            return;
        }
    };
    if let Some(ttl) = config.stream_ttl() {
        storage = storage.with_stream_ttl(ttl);
    }

    let mut places = StaticPlaceDirectory::new();
    for (place, account) in args.places {
        places = places.with_place(place, account);
    }
    if let Some(account) = args.default_account {
        places = places.with_fallback(account);
    }

    let mut server = Server::new(
        config,
        Arc::new(storage),
        Arc::new(CachedPlaceDirectory::new(places)),
    );

    let addr = match server.start() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Failed to start server: {}", e);
            return;
        }
    };

    println!("Recording pushes on {addr}, commands: list, stop <recording>, quit");
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("quit" | "exit"), _) => break,
            (Some("list"), _) => {
                for id in server.recordings() {
                    println!("{id}");
                }
            }
            (Some("stop"), Some(id)) => match id.parse::<Uuid>() {
                Ok(id) if server.stop_recording(&id) => println!("stopping {id}"),
                Ok(id) => println!("no live recording {id}"),
                Err(e) => println!("invalid recording id: {e}"),
            },
            (None, _) => {}
            _ => println!("unknown command: {line}"),
        }
    }

    server.stop();
}

fn token(args: TokenArgs) {
    let recording = if args.stream {
        mint_recording_id(SessionKind::Stream)
    } else {
        args.recording
    };
    let token = SessionToken::issue(
        args.secret.as_bytes(),
        args.account,
        args.camera,
        args.place,
        args.person,
        recording,
    );
    println!("Authorization: {}", token.authorization_header());
}
