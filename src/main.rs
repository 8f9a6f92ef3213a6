// src/main.rs - demo harness driving a simulated print
use std::rc::Rc;

use clap::Parser;

use printhead::config::Config;
use printhead::extruder::PrinterExtruder;
use printhead::kinematics::CartesianKinematics;
use printhead::mcu::SimMcu;
use printhead::reactor::{Reactor, SimReactor};
use printhead::toolhead::ToolHead;

#[derive(Parser)]
#[command(name = "printhead", about = "Toolhead motion coordinator demo")]
struct Args {
    /// Path to the printer configuration file
    #[arg(long, default_value = "printer.toml")]
    config: String,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Dispatch any due reactor timers to the toolhead's flush handler, the
/// way the real event loop would.
async fn service_timers(toolhead: &mut ToolHead, reactor: &SimReactor) {
    let now = reactor.monotonic();
    for timer in reactor.due_timers(now) {
        if timer == toolhead.flush_timer() {
            let waketime = toolhead.flush_handler(now).await;
            reactor.update_timer(timer, waketime);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting printhead motion coordinator");
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(%err, "falling back to default configuration");
            Config::default()
        }
    };
    tracing::info!("Max velocity: {} mm/s", config.printer.max_velocity);
    tracing::info!("Max acceleration: {} mm/s²", config.printer.max_accel);
    if config.printer.kinematics != "cartesian" {
        tracing::warn!(
            kinematics = %config.printer.kinematics,
            "only cartesian kinematics are built in; using cartesian"
        );
    }

    let reactor = Rc::new(SimReactor::new());
    let mcu = Rc::new(SimMcu::new());
    let kin = Box::new(CartesianKinematics::new(
        [
            (config.printer.position_min[0], config.printer.position_max[0]),
            (config.printer.position_min[1], config.printer.position_max[1]),
            (config.printer.position_min[2], config.printer.position_max[2]),
        ],
        config.printer.max_z_velocity,
        config.printer.max_z_accel,
    ));
    let mut toolhead = ToolHead::new(&config, reactor.clone(), mcu.clone(), kin);
    toolhead.events_mut().subscribe(|event| {
        tracing::debug!(?event, "toolhead event");
    });

    let mut extruder = PrinterExtruder::new(
        &config.extruder,
        config.printer.max_velocity,
        config.printer.max_accel,
    );
    extruder.set_can_extrude(true);
    toolhead.set_extruder(Box::new(extruder), 0.0);

    // Home, then run a travel square and one extruded edge
    toolhead.set_position([0.0, 0.0, 0.2, 0.0], &[0, 1, 2]).await?;
    let square = [
        [60.0, 10.0, 0.2],
        [60.0, 60.0, 0.2],
        [10.0, 60.0, 0.2],
        [10.0, 10.0, 0.2],
    ];
    for corner in square {
        toolhead
            .move_to([corner[0], corner[1], corner[2], 0.0], 120.0)
            .await?;
        service_timers(&mut toolhead, &reactor).await;
    }
    let e_start = toolhead.get_position()[3];
    toolhead
        .move_to([60.0, 10.0, 0.2, e_start + 2.5], 40.0)
        .await?;

    toolhead.cmd_g4(250.0).await?;
    toolhead.cmd_m400().await?;
    service_timers(&mut toolhead, &reactor).await;

    let now = reactor.monotonic();
    let (_, stats) = toolhead.stats(now);
    tracing::info!("{stats}");
    let status = toolhead.get_status(now);
    println!("{}", serde_json::to_string_pretty(&status)?);
    tracing::info!(
        flushed_upto = mcu.flushed_upto(),
        "simulated print complete"
    );
    Ok(())
}
