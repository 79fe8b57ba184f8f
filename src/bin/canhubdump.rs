use anyhow::{bail, Context};
use clap::Parser;
use tokio::signal;

use ucan_hub::hub::ring::RingItem;
use ucan_hub::{ClientHandle, ClientOptions, EchoMode};

/// Dump traffic of a channel served by a running canhubd, candump style.
#[derive(Debug, Parser)]
#[command(name = "canhubdump")]
#[command(about = "Attach to a canhubd session and print its traffic")]
struct Cli {
    /// Session id printed by canhubd; defaults to the only one running
    #[arg(short = 's', long = "session")]
    session: Option<String>,

    /// Show echoes of our own transmissions
    #[arg(short = 'e', long = "echo")]
    echo: bool,

    /// List running sessions and exit
    #[arg(long = "sessions")]
    sessions: bool,
}

fn print_frame(prefix: &str, frame: &ucan_hub::CanFrame) {
    let timestamp = frame
        .timestamp_us()
        .map(|ts| format!("({}.{:06}) ", ts / 1_000_000, ts % 1_000_000))
        .unwrap_or_default();

    let id = if frame.is_extended() {
        format!("{:08X}", frame.id())
    } else {
        format!("{:03X}", frame.id())
    };

    let body = if frame.is_rtr() {
        format!("R{}", frame.dlc())
    } else {
        frame
            .data()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut marks = String::new();
    if frame.is_fd() {
        marks.push_str(" FD");
    }
    if frame.is_brs() {
        marks.push_str(" BRS");
    }
    if frame.is_esi() {
        marks.push_str(" ESI");
    }

    println!("{timestamp}{prefix}{id}  [{}]  {body}{marks}", frame.dlc());
}

fn resolve_session(requested: Option<String>) -> anyhow::Result<String> {
    if let Some(session) = requested {
        return Ok(session);
    }
    let mut sessions = ucan_hub::hub::discover_sessions();
    match sessions.len() {
        0 => bail!("no canhubd session found; is the daemon running?"),
        1 => Ok(sessions.remove(0)),
        _ => bail!(
            "several sessions are running, pick one with --session: {}",
            sessions.join(", ")
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.sessions {
        for session in ucan_hub::hub::discover_sessions() {
            println!("{session}");
        }
        return Ok(());
    }

    let session = resolve_session(cli.session)?;
    let mut client = ClientHandle::connect(
        &session,
        ClientOptions {
            echo_mode: if cli.echo {
                EchoMode::Receipt
            } else {
                EchoMode::Off
            },
            ..ClientOptions::default()
        },
    )
    .await
    .with_context(|| format!("could not attach to session {session}"))?;

    println!(
        "attached to {} (serial {}), ctrl-c to exit",
        client.descriptor().name,
        client.descriptor().serial
    );

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("detaching");
                break;
            }
            item = client.recv() => {
                match item {
                    Ok(RingItem::Rx(frame)) => print_frame("  ", &frame),
                    Ok(RingItem::TxEcho(echo)) => print_frame("T ", &echo.frame),
                    Ok(RingItem::Status(status)) => {
                        log::info!(
                            "bus {:?} rxerr={} txerr={} lost={}",
                            status.bus_state, status.rx_errors, status.tx_errors, status.rx_lost
                        );
                    }
                    Ok(RingItem::Error(error)) => {
                        log::warn!(
                            "error frame {:?} {} bus={:?}",
                            error.kind,
                            if error.tx { "tx" } else { "rx" },
                            error.bus_state
                        );
                    }
                    Ok(RingItem::Log(record)) => {
                        log::log!(record.level, "hub: {}", record.message);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        eprintln!("receive failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    client.detach().await.ok();
    Ok(())
}
