use anyhow::Context;
use clap::Parser;
use tokio::signal;

use ucan_hub::hub::server;
use ucan_hub::{ClientOptions, Hub, HubOptions, OpenParams};

/// Hub daemon: open a USB CAN(-FD) interface, bring it on bus, and serve
/// it to canhubdump/canhubsend clients over the session's control socket.
#[derive(Debug, Parser)]
#[command(name = "canhubd")]
#[command(about = "Serve a USB CAN(-FD) interface to multiple client processes")]
struct Cli {
    /// Device: auto, a scan index, a serial, or bus:address
    #[arg(default_value = "auto")]
    device: String,

    /// Arbitration-phase bitrate in bit/s
    #[arg(short = 'b', long = "bitrate", default_value_t = 500_000)]
    bitrate: u32,

    /// Data-phase bitrate in bit/s (enables CAN-FD)
    #[arg(short = 'd', long = "data-bitrate")]
    data_bitrate: Option<u32>,

    /// Sample point, e.g. 0.8
    #[arg(long = "sample-point")]
    sample_point: Option<f64>,

    /// Data-phase sample point
    #[arg(long = "data-sample-point")]
    data_sample_point: Option<f64>,

    /// Listen-only mode
    #[arg(short = 'm', long = "monitor")]
    monitor: bool,

    /// Serve without configuring the bus (a client must bring it up)
    #[arg(long = "no-bus-on")]
    no_bus_on: bool,

    /// List matching devices and exit
    #[arg(long = "scan")]
    scan: bool,

    /// Print the device descriptor as JSON after the handshake
    #[arg(long = "info")]
    info: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.scan {
        let entries = ucan_hub::scan().await.context("device scan failed")?;
        if entries.is_empty() {
            println!("no devices found");
        }
        for entry in entries {
            println!(
                "{}: {} serial={} [{}]",
                entry.index,
                entry.product.as_deref().unwrap_or("?"),
                entry.serial.as_deref().unwrap_or("?"),
                entry.bus_address
            );
        }
        return Ok(());
    }

    let device = ucan_hub::open_usb(&cli.device)
        .await
        .with_context(|| format!("could not open device '{}'", cli.device))?;

    println!(
        "{} serial {} fw {}.{}.{}",
        device.descriptor.name,
        device.descriptor.serial,
        device.descriptor.fw_version.0,
        device.descriptor.fw_version.1,
        device.descriptor.fw_version.2
    );

    if cli.info {
        println!("{}", serde_json::to_string_pretty(&device.descriptor)?);
    }

    let hub = Hub::open(device, HubOptions::default()).context("hub open failed")?;

    if !cli.no_bus_on {
        // configure through a short-lived internal client; the lease is
        // released with it and the bus stays on
        let configurator = hub
            .attach_client(ClientOptions::default())
            .await
            .context("attach failed")?;
        let params = OpenParams {
            bitrate: cli.bitrate,
            data_bitrate: cli.data_bitrate,
            sample_point: cli.sample_point,
            data_sample_point: cli.data_sample_point,
            sjw: None,
            data_sjw: None,
            fd: cli.data_bitrate.is_some(),
            one_shot: false,
            listen_only: cli.monitor,
        };
        configurator
            .bring_up(&params)
            .await
            .context("bring-up failed")?;
        configurator.detach().await.ok();
        println!("on bus at {} bit/s", cli.bitrate);
    }

    println!("session {}", hub.session());

    let server_hub = hub.clone();
    let mut server_task = tokio::spawn(server::serve(server_hub));

    tokio::select! {
        _ = signal::ctrl_c() => {
            println!("shutting down");
        }
        result = &mut server_task => {
            if let Ok(Err(e)) = result {
                eprintln!("control server failed: {e}");
            }
        }
    }

    server_task.abort();
    hub.close().await.ok();
    Ok(())
}
