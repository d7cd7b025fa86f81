//! skyscand - air-side imaging daemon
//!
//! Reads operator commands and flight telemetry as lines on stdin:
//!
//! ```text
//! start | stop | status | queue | airstart | set NAME VALUE | boundary PATH
//! velocity AIRSPEED GROUNDSPEED
//! terrain HEIGHT
//! fix TIME LAT LON ALT [ROLL PITCH YAW]
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use skyscan::{
    default_codec, AirConfig, Collaborators, ControlCommand, PipelineController, Position,
    PositionHistory, StopSignal, Telemetry,
};

const TICK: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about = "Air-side image capture, scan and downlink daemon")]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "SKYSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Start capture immediately.
    #[arg(long, conflicts_with = "airstart")]
    start: bool,

    /// Arm capture to start once the aircraft is flying.
    #[arg(long)]
    airstart: bool,
}

/// One parsed console line.
enum ConsoleLine {
    Command(ControlCommand),
    Telemetry(Telemetry),
    Fix(Position),
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = AirConfig::load_from(args.config.as_deref())?;
    let codec = default_codec().ok_or_else(|| anyhow!("no image codec compiled in"))?;
    let history = Arc::new(PositionHistory::default());
    let mut controller =
        PipelineController::new(config, Collaborators::new(codec, history.clone()))?;

    let stop = StopSignal::new();
    let signal = stop.clone();
    ctrlc::set_handler(move || signal.set()).context("error setting Ctrl-C handler")?;

    let (telemetry_tx, telemetry_rx) = crossbeam_channel::unbounded();
    spawn_console(controller.command_sender(), telemetry_tx, history)?;

    if args.start {
        controller.execute(ControlCommand::Start);
    } else if args.airstart {
        controller.execute(ControlCommand::Airstart);
    }

    log::info!("skyscand running; Ctrl-C to unload");
    while !stop.is_set() {
        match telemetry_rx.recv_timeout(TICK) {
            Ok(telemetry) => controller.on_telemetry(telemetry),
            Err(RecvTimeoutError::Timeout) => {}
            // Console closed; keep serving the ground links.
            Err(RecvTimeoutError::Disconnected) => {
                stop.wait(TICK);
            }
        }
        controller.pump_commands();
    }

    log::info!("shutdown signal received, unloading...");
    let abandoned = controller.unload();
    if abandoned > 0 {
        log::warn!("{} worker(s) did not exit in time", abandoned);
    }
    Ok(())
}

fn spawn_console(
    commands: Sender<ControlCommand>,
    telemetry: Sender<Telemetry>,
    history: Arc<PositionHistory>,
) -> Result<()> {
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        log::warn!("console read failed: {}", err);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(ConsoleLine::Command(cmd)) => {
                        if commands.send(cmd).is_err() {
                            break;
                        }
                    }
                    Ok(ConsoleLine::Telemetry(t)) => {
                        if telemetry.send(t).is_err() {
                            break;
                        }
                    }
                    Ok(ConsoleLine::Fix(fix)) => history.add_fix(fix),
                    Err(err) => log::warn!("{:#}", err),
                }
            }
        })
        .context("failed to spawn console thread")?;
    Ok(())
}

fn parse_line(line: &str) -> Result<ConsoleLine> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let nums = |args: &[&str]| -> Result<Vec<f64>> {
        args.iter()
            .map(|w| w.parse::<f64>().with_context(|| format!("bad number {:?}", w)))
            .collect()
    };
    match words.first().copied() {
        Some("velocity") => match nums(&words[1..])?.as_slice() {
            [airspeed, groundspeed] => Ok(ConsoleLine::Telemetry(Telemetry::Velocity {
                airspeed: *airspeed,
                groundspeed: *groundspeed,
            })),
            _ => bail!("usage: velocity AIRSPEED GROUNDSPEED"),
        },
        Some("terrain") => match nums(&words[1..])?.as_slice() {
            [height] => Ok(ConsoleLine::Telemetry(Telemetry::TerrainHeight(*height))),
            _ => bail!("usage: terrain HEIGHT"),
        },
        Some("fix") => {
            let v = nums(&words[1..])?;
            let (time, lat, lon, altitude) = match v.as_slice() {
                [t, lat, lon, alt, ..] if v.len() == 4 || v.len() == 7 => (*t, *lat, *lon, *alt),
                _ => bail!("usage: fix TIME LAT LON ALT [ROLL PITCH YAW]"),
            };
            let attitude = v.get(4..7).unwrap_or(&[0.0, 0.0, 0.0]);
            Ok(ConsoleLine::Fix(Position {
                time,
                lat,
                lon,
                altitude,
                roll: attitude[0],
                pitch: attitude[1],
                yaw: attitude[2],
            }))
        }
        _ => ControlCommand::parse(line).map(ConsoleLine::Command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_telemetry_and_fixes() {
        match parse_line("velocity 12.5 3").unwrap() {
            ConsoleLine::Telemetry(Telemetry::Velocity {
                airspeed,
                groundspeed,
            }) => {
                assert_eq!(airspeed, 12.5);
                assert_eq!(groundspeed, 3.0);
            }
            _ => panic!("expected velocity"),
        }
        match parse_line("fix 100 -35.1 149.2 120 5 0 90").unwrap() {
            ConsoleLine::Fix(fix) => {
                assert_eq!(fix.altitude, 120.0);
                assert_eq!(fix.yaw, 90.0);
            }
            _ => panic!("expected fix"),
        }
        assert!(parse_line("fix 100 -35.1 149.2").is_err());
        assert!(parse_line("terrain abc").is_err());
        assert!(matches!(
            parse_line("status").unwrap(),
            ConsoleLine::Command(ControlCommand::Status)
        ));
    }
}
