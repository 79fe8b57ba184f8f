use anyhow::{bail, Context};
use clap::Parser;

use ucan_hub::hub::ring::RingItem;
use ucan_hub::{CanFrame, ClientHandle, ClientOptions};

/// Send a single frame through a running canhubd, cansend style:
/// `canhubsend 123#DEADBEEF`.
#[derive(Debug, Parser)]
#[command(name = "canhubsend")]
#[command(about = "Send one CAN frame through a canhubd session")]
struct Cli {
    /// Frame as <id>#<hex-data>, <id>#R<dlc> for RTR, or <id>##<hex-data>
    /// for CAN-FD
    frame: String,

    /// Session id printed by canhubd; defaults to the only one running
    #[arg(short = 's', long = "session")]
    session: Option<String>,
}

fn parse_hex_data(s: &str) -> anyhow::Result<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| *c != '.').collect();
    hex::decode(&cleaned).context("invalid hex payload")
}

/// Parse the classic can-utils frame syntax.
fn parse_frame(text: &str) -> anyhow::Result<CanFrame> {
    let (id_part, rest) = text.split_once('#').context("expected <id>#<data>")?;
    let id = u32::from_str_radix(id_part, 16).context("invalid frame id")?;
    let extended = id_part.len() > 3 || id > ucan_hub::can::SFF_MASK;

    if let Some(fd_part) = rest.strip_prefix('#') {
        let data = parse_hex_data(fd_part)?;
        return Ok(CanFrame::new_fd(id, &data, extended, true, false)?);
    }

    if let Some(dlc_part) = rest.strip_prefix('R') {
        let dlc = if dlc_part.is_empty() {
            0
        } else {
            dlc_part.parse::<u8>().context("invalid RTR dlc")?
        };
        return Ok(CanFrame::new_remote(id, dlc, extended)?);
    }

    let data = parse_hex_data(rest)?;
    let frame = if extended {
        CanFrame::new_eff(id, &data)?
    } else {
        CanFrame::new(id, &data)?
    };
    Ok(frame)
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

    let frame = parse_frame(&cli.frame)?;
    let session = resolve_session(cli.session)?;

    let mut client = ClientHandle::connect(&session, ClientOptions::default())
        .await
        .with_context(|| format!("could not attach to session {session}"))?;

    let track_id = client.send(frame)?;

    // wait for the transmit receipt before detaching
    loop {
        match client.recv().await? {
            RingItem::TxEcho(echo) if echo.track_id == track_id => {
                if echo.dropped {
                    bail!("frame dropped by the device");
                }
                break;
            }
            _ => {}
        }
    }

    client.detach().await.ok();
    Ok(())
}
