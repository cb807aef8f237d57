use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::warn;

use gesture_capture::protocol::DEFAULT_DEVICE_NAME;
use gesture_capture::simulator::{DeliveryOrder, SimulatedLink, SimulatorConfig};
use gesture_capture::{run_capture, CaptureConfig, ConnectionManager, GattLink, Status};

#[derive(Parser, Debug)]
#[command(
    name = "gesture-capture",
    about = "Capture accelerometer gestures from the Nano 33 IoT over BLE"
)]
struct Args {
    /// Bluetooth MAC address; scans by name when omitted
    address: Option<String>,
    /// Advertised name prefix to scan for
    #[arg(long, default_value = DEFAULT_DEVICE_NAME)]
    name: String,
    /// Seconds to wait for each capture to complete
    #[arg(long, default_value_t = 15.0)]
    timeout: f64,
    /// Number of gestures to record
    #[arg(long, default_value_t = 1)]
    attempts: u32,
    /// Use the built-in simulated device instead of BlueZ
    #[arg(long)]
    simulate: bool,
    /// Debug logging unless GESTURE_CAPTURE_LOG/RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    gesture_capture::logging::init_logging(args.verbose);

    if !args.timeout.is_finite() || args.timeout <= 0.0 {
        bail!("--timeout must be a positive number of seconds");
    }
    let config = CaptureConfig::default()
        .with_timeout(Duration::from_secs_f64(args.timeout))
        .with_observer(print_status);

    let runtime = tokio::runtime::Runtime::new().context("tokio runtime init failed")?;
    runtime.block_on(async {
        if args.simulate {
            println!("--- Using simulated device ---");
            let sim = SimulatorConfig {
                order: DeliveryOrder::Interleaved,
                ..SimulatorConfig::default()
            };
            let link = SimulatedLink::with_config("00:00:00:00:00:00", &sim);
            return capture_loop(&ConnectionManager::new(link), &config, args.attempts).await;
        }
        connect_and_capture(&args, &config).await
    })
}

#[cfg(feature = "bluez")]
async fn connect_and_capture(args: &Args, config: &CaptureConfig) -> Result<()> {
    let connector = gesture_capture::BluezConnector::default();
    let address = match &args.address {
        Some(a) => a.clone(),
        None => {
            println!("Scanning for '{}'...", args.name);
            connector.discover(&args.name).await?
        }
    };
    println!("Connecting to {address}...");
    let link = connector.connect(&address, connector.connect_timeout).await?;
    capture_loop(&ConnectionManager::new(link), config, args.attempts).await
}

#[cfg(not(feature = "bluez"))]
async fn connect_and_capture(_args: &Args, _config: &CaptureConfig) -> Result<()> {
    bail!("built without the `bluez` feature; rebuild with it or pass --simulate")
}

async fn capture_loop<L: GattLink>(
    manager: &ConnectionManager<L>,
    config: &CaptureConfig,
    attempts: u32,
) -> Result<()> {
    println!("Connected to {}", manager.address());
    let mut captured = 0;
    for attempt in 1..=attempts {
        println!("[Attempt {attempt}/{attempts}] Get ready...");
        match run_capture(manager, config).await {
            Ok(capture) => {
                captured += 1;
                let (x, y, z) = capture.axes();
                println!(
                    "[Attempt {attempt}] {} samples in {:.1}s | mean x={:+.3} y={:+.3} z={:+.3}",
                    capture.len(),
                    capture.elapsed.as_secs_f64(),
                    mean(&x),
                    mean(&y),
                    mean(&z)
                );
            }
            Err(e) => {
                warn!("attempt {attempt} failed: {e}");
                eprintln!("[Attempt {attempt}] failed: {e}");
            }
        }
    }

    println!("Disconnecting...");
    manager.disconnect().await;
    println!("Done. {captured}/{attempts} captures succeeded.");
    Ok(())
}

fn print_status(status: Status) {
    if let Some(secs) = status.countdown() {
        println!("  {secs}...");
        return;
    }
    match status {
        Status::Capturing => println!("  GO!"),
        Status::Complete => println!("  Capture complete"),
        Status::Error => println!("  Device reported an error"),
        _ => {}
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
