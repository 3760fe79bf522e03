// LanBeam peer CLI: list peers, send files or text, receive.

use std::path::PathBuf;

use anyhow::{bail, Context};
use lanbeam_core::{format_speed, Direction, Event, TransferKey};
use lanbeam_peer::config::{self, Config};
use lanbeam_peer::presence::find_peer;
use lanbeam_peer::{inbox, Payload, Runtime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: lanbeam-peer <command>
  list                      show peers on the server
  send <peer> <file>...     offer files to a peer (id or name)
  text <peer> <message>     send a text message
  listen                    receive offers and messages until Ctrl+C";

enum Command {
    List,
    Send { peer: String, files: Vec<PathBuf> },
    Text { peer: String, message: String },
    Listen,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    match args.first().map(String::as_str) {
        Some("list") => Ok(Command::List),
        Some("listen") => Ok(Command::Listen),
        Some("send") if args.len() >= 3 => Ok(Command::Send {
            peer: args[1].clone(),
            files: args[2..].iter().map(PathBuf::from).collect(),
        }),
        Some("text") if args.len() >= 3 => Ok(Command::Text {
            peer: args[1].clone(),
            message: args[2..].join(" "),
        }),
        _ => Err(USAGE.to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("lanbeam-peer {}", VERSION);
        return Ok(());
    }
    let command = match parse_args(&args) {
        Ok(c) => c,
        Err(usage) => {
            eprintln!("{usage}");
            std::process::exit(2);
        }
    };

    let cfg = config::load()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut rt = Runtime::start(&cfg)
        .await
        .with_context(|| format!("starting peer against {}", cfg.server_url))?;
    let result = match command {
        Command::List => list(&rt).await,
        Command::Send { peer, files } => {
            let target = resolve(&rt, &peer).await?;
            run_send(&mut rt, &cfg, &target, Payload::Files(files)).await
        }
        Command::Text { peer, message } => {
            let target = resolve(&rt, &peer).await?;
            run_send(&mut rt, &cfg, &target, Payload::Text(message)).await
        }
        Command::Listen => listen(&mut rt, &cfg).await,
    };
    rt.shutdown().await;
    result
}

async fn list(rt: &Runtime) -> anyhow::Result<()> {
    let peers = rt.devices().await?;
    if peers.is_empty() {
        println!("no other peers");
    }
    for p in peers {
        println!("{}  {:<24} {}", p.id, p.name, p.device_class.as_str());
    }
    Ok(())
}

async fn resolve(rt: &Runtime, query: &str) -> anyhow::Result<String> {
    let peers = rt.devices().await?;
    match find_peer(&peers, query) {
        Some(p) => Ok(p.id.clone()),
        None => bail!("no peer named or with id {query}"),
    }
}

async fn run_send(rt: &mut Runtime, cfg: &Config, peer: &str, payload: Payload) -> anyhow::Result<()> {
    let node = rt.node.clone();
    let target = peer.to_string();
    let mut sending = tokio::spawn(async move { node.send_payload(&target, payload).await });
    loop {
        tokio::select! {
            res = &mut sending => {
                res.context("send task")??;
                println!("done");
                return Ok(());
            }
            Some(ev) = rt.events.recv() => report(rt, cfg, ev).await,
            _ = shutdown_signal() => {
                sending.abort();
                bail!("interrupted");
            }
        }
    }
}

async fn listen(rt: &mut Runtime, cfg: &Config) -> anyhow::Result<()> {
    println!("listening as {} ({})", cfg.device_name, rt.peer_id);
    loop {
        tokio::select! {
            Some(ev) = rt.events.recv() => report(rt, cfg, ev).await,
            _ = shutdown_signal() => return Ok(()),
        }
    }
}

async fn report(rt: &Runtime, cfg: &Config, event: Event) {
    match event {
        Event::IncomingOffer {
            key,
            file_size,
            sender_name,
        } => {
            println!("{sender_name} offers {} ({file_size} bytes)", key.file_name);
            let accept = cfg.auto_accept || ask(&key).await;
            let res = if accept {
                rt.node.accept_transfer(&key).await
            } else {
                rt.node.decline_transfer(&key).await
            };
            if let Err(e) = res {
                warn!(event = "answer_failed", error = %e, "Could not answer offer");
            }
        }
        Event::AcceptResult { key, accepted } => {
            let verdict = if accepted { "accepted" } else { "declined" };
            println!("{} {verdict}", key.file_name);
        }
        Event::Progress {
            key,
            direction,
            progress,
        } => {
            let arrow = match direction {
                Direction::Outbound => "->",
                Direction::Inbound => "<-",
            };
            println!(
                "{arrow} {} {:>3}% {}",
                key.file_name,
                progress.percent,
                format_speed(progress.bytes_per_sec)
            );
        }
        Event::Completed(delivery) => match inbox::save(&cfg.download_dir, &delivery).await {
            Ok(path) => println!(
                "received {} from {} -> {}",
                delivery.key.file_name,
                delivery.sender_name,
                path.display()
            ),
            Err(e) => eprintln!("could not save {}: {e:#}", delivery.key.file_name),
        },
        Event::Sent { key } => println!("{} sent", key.file_name),
        Event::TextReceived {
            sender_name, text, ..
        } => println!("{sender_name}: {text}"),
        Event::Error { key, error } => match key {
            Some(k) => eprintln!("{}: {error}", k.file_name),
            None => eprintln!("{error}"),
        },
    }
}

async fn ask(key: &TransferKey) -> bool {
    println!("accept {}? [y/N]", key.file_name);
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    match stdin.read_line(&mut line).await {
        Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn parses_commands() {
        assert!(matches!(parse_args(&args(&["list"])), Ok(Command::List)));
        match parse_args(&args(&["send", "bob", "a.txt", "b.txt"])) {
            Ok(Command::Send { peer, files }) => {
                assert_eq!(peer, "bob");
                assert_eq!(files.len(), 2);
            }
            _ => panic!("expected send"),
        }
        match parse_args(&args(&["text", "bob", "hello", "there"])) {
            Ok(Command::Text { message, .. }) => assert_eq!(message, "hello there"),
            _ => panic!("expected text"),
        }
        assert!(parse_args(&args(&["send", "bob"])).is_err());
        assert!(parse_args(&[]).is_err());
    }
}
