use serde::Serialize;
use std::fmt;

use crate::command::RouterSnapshot;
use crate::dispatch::DispatchStats;
use crate::stage::CounterSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
    /// Dispatch is up; capture waits for the aircraft to fly.
    Armed,
    Stopping,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Armed => "armed",
            PipelineState::Stopping => "stopping",
        })
    }
}

/// Polled status surface.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub stages: CounterSnapshot,
    pub router: RouterSnapshot,
    pub dispatch: DispatchStats,
    pub scan_queue: usize,
    pub outbound_queue: usize,
}

impl PipelineStatus {
    /// One-line counters summary, the reply to `status`.
    pub fn summary(&self) -> String {
        format!(
            "{} cap imgs:{} err:{} shed:{} scan:{} regions:{} jsize:{:.0} xmitq:{} sq:{} eff:{}",
            self.state,
            self.stages.captured,
            self.stages.capture_errors + self.stages.scan_errors,
            self.stages.capture_shed,
            self.stages.scanned,
            self.stages.regions,
            self.router.jpeg_size,
            list(self.dispatch.links.iter().map(|l| l.queued.to_string())),
            self.scan_queue,
            list(self.dispatch.links.iter().map(|l| format!("{:.2}", l.efficiency))),
        )
    }

    /// Queue and link summary, the reply to `queue`.
    pub fn queue_summary(&self) -> String {
        let links = &self.dispatch.links;
        format!(
            "scan {} transmit {} eff {} bw {} rtt {}",
            self.scan_queue,
            self.outbound_queue,
            list(links.iter().map(|l| format!("{:.2}", l.efficiency))),
            list(links.iter().map(|l| format!("{:.0}", l.bandwidth_used))),
            list(links.iter().map(|l| format!("{:.3}", l.rtt_estimate))),
        )
    }
}

fn list(items: impl Iterator<Item = String>) -> String {
    format!("[{}]", items.collect::<Vec<_>>().join(", "))
}
