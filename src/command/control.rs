use anyhow::{anyhow, bail, Result};
use std::fmt;
use std::path::PathBuf;

/// Operator command understood by the pipeline controller.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlCommand {
    Start,
    Stop,
    Status,
    Queue,
    Airstart,
    Set { name: String, value: String },
    Boundary(PathBuf),
}

pub const USAGE: &str = "usage: <start|airstart|stop|status|queue|set NAME VALUE|boundary PATH>";

impl ControlCommand {
    /// Parse one command line, e.g. `set minscore 500`.
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| anyhow!("empty command; {}", USAGE))?;
        let cmd = match verb {
            "start" => ControlCommand::Start,
            "stop" => ControlCommand::Stop,
            "status" => ControlCommand::Status,
            "queue" => ControlCommand::Queue,
            "airstart" => ControlCommand::Airstart,
            "set" => {
                let name = words
                    .next()
                    .ok_or_else(|| anyhow!("set needs a setting name"))?
                    .to_string();
                let value = words.collect::<Vec<_>>().join(" ");
                if value.is_empty() {
                    bail!("set {} needs a value", name);
                }
                return Ok(ControlCommand::Set { name, value });
            }
            "boundary" => {
                let path = words.next().ok_or_else(|| anyhow!("boundary needs a file"))?;
                ControlCommand::Boundary(PathBuf::from(path))
            }
            other => bail!("unknown command {:?}; {}", other, USAGE),
        };
        if let Some(extra) = words.next() {
            bail!("unexpected argument {:?} to {}", extra, verb);
        }
        Ok(cmd)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Start => f.write_str("start"),
            ControlCommand::Stop => f.write_str("stop"),
            ControlCommand::Status => f.write_str("status"),
            ControlCommand::Queue => f.write_str("queue"),
            ControlCommand::Airstart => f.write_str("airstart"),
            ControlCommand::Set { name, value } => write!(f, "set {} {}", name, value),
            ControlCommand::Boundary(path) => write!(f, "boundary {}", path.display()),
        }
    }
}
