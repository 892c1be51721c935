use accel_core::dispatcher::{Dispatched, packet_type_name};
use accel_rust::ProtocolEngine;
use accel_rust::collection::{AccelCollection, CollectionConfig};
use anyhow::{Result, bail};
use clap::Parser;
use std::{
    thread,
    time::{Duration, Instant},
};

// cargo run -p accel_rust --example simple_reader -- /dev/ttyACM0 --seconds 10

#[derive(Parser, Debug)]
#[command(about = "Stream orientations from an AccelDrum sensor hub")]
struct Args {
    /// Serial port of the hub. Defaults to the first port found.
    port: Option<String>,

    #[arg(long, default_value_t = 1_000_000)]
    baud: u32,

    /// List the available serial ports and exit.
    #[arg(long)]
    list: bool,

    /// Stop after this many seconds. Runs until the device goes away when omitted.
    #[arg(long)]
    seconds: Option<f64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let ports = ProtocolEngine::get_port_names()?;

    if args.list {
        for port in &ports {
            println!("{port}");
        }
        return Ok(());
    }

    let Some(port_name) = args.port.or_else(|| ports.first().cloned()) else {
        bail!("No serial ports detected");
    };
    println!("Connecting to {port_name}");

    let mut collection = AccelCollection::new(CollectionConfig {
        baud_rate: args.baud,
        ..CollectionConfig::default()
    });
    collection.connect(&port_name)?;

    let started = Instant::now();
    let mut last_print = started;
    loop {
        let now = Instant::now();
        for dispatched in collection.update(now)? {
            match dispatched {
                Dispatched::Text(Some(message)) => println!("[device] {message}"),
                Dispatched::Settings(settings) => println!("Settings: {settings:#?}"),
                Dispatched::Backlight(on) => println!("Backlight is {}", if on { "on" } else { "off" }),
                _ => {}
            }
        }

        if let Some(err) = collection.check_error() {
            eprintln!("Error: {err}");
            break;
        }
        if !collection.is_connected() {
            break;
        }

        if now.duration_since(last_print) >= Duration::from_millis(500) {
            last_print = now;
            for track in collection.tracks() {
                let (roll, pitch, yaw) = track.orientation().euler_angles();
                println!(
                    "#{} roll {:7.2} pitch {:7.2} yaw {:7.2}  pos {:?}",
                    track.index(),
                    roll.to_degrees(),
                    pitch.to_degrees(),
                    yaw.to_degrees(),
                    track.position().as_slice()
                );
            }
            println!(
                "{} packets, {} corrupted",
                collection.packet_count(),
                collection.corrupted_packet_count()
            );
        }

        if args
            .seconds
            .is_some_and(|limit| started.elapsed().as_secs_f64() >= limit)
        {
            break;
        }

        thread::sleep(Duration::from_millis(10));
    }

    for (packet_type, count) in collection.histogram() {
        println!("{:>10}: {count}", packet_type_name(packet_type));
    }

    if collection.is_connected() {
        collection.disconnect()?;
    }
    Ok(())
}
