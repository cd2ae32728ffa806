//! One member of the nine-seat consensus panel: an engine, a listener, and a
//! fixed roster loaded from disk.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use conclave::{Engine, MemberId, Membership, Profile, TcpTransport, TokioNet, run_listener};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "conclave")]
#[command(about = "Run one member of the nine-seat consensus panel")]
struct Args {
    /// Member identity, M1 through M9.
    member: MemberId,

    /// Network behavior for this process.
    #[arg(long, value_enum)]
    profile: Profile,

    /// Roster file, one `memberId,host,port` line per member.
    #[arg(long, default_value = "network.config")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::try_parse().unwrap_or_else(|error| {
        eprintln!("{error}");
        std::process::exit(1);
    });

    let members = Arc::new(Membership::load(&args.config)?);
    let port = match members.addr(args.member) {
        Some(addr) => addr.port,
        None => return Err(format!("no roster entry for {}", args.member).into()),
    };

    let transport = TcpTransport::new(TokioNet, members);
    let engine = Engine::new(args.member, transport);
    info!(member = %args.member, profile = ?args.profile, "starting");
    run_listener(TokioNet, port, engine, args.profile).await?;
    Ok(())
}
