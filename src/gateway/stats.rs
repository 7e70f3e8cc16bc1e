//! Host statistics for the periodic `stats` frames.

use crate::protocol::payload::{CpuStats, FrameStats, MemoryStats, StatsFrame};

use sysinfo::{CpuExt, PidExt, ProcessExt, System, SystemExt};

use tokio::time::Instant;

use std::sync::Mutex;

pub struct StatsCollector {
    system: Mutex<System>,
    started: Instant,
}

impl StatsCollector {
    pub fn new() -> StatsCollector {
        StatsCollector {
            system: Mutex::new(System::new()),
            started: Instant::now(),
        }
    }

    /// Assembles a `stats` frame around the pool's player counts.
    pub fn frame(&self, players: usize, playing_players: usize) -> StatsFrame {
        let mut system = self.system.lock().unwrap();

        system.refresh_memory();
        system.refresh_cpu();

        let pid = sysinfo::Pid::from_u32(std::process::id());
        system.refresh_process(pid);

        let cores = num_cpus::get();
        let total = system.total_memory();
        let used = system.used_memory();

        let system_load = f64::from(system.global_cpu_info().cpu_usage()) / 100.0;
        let lavalink_load = system
            .process(pid)
            .map(|process| f64::from(process.cpu_usage()) / 100.0 / cores as f64)
            .unwrap_or(0.0);

        StatsFrame {
            players,
            playing_players,
            uptime: self.started.elapsed().as_millis() as u64,
            memory: MemoryStats {
                free: total.saturating_sub(used),
                used,
                allocated: total,
                reservable: total,
            },
            cpu: CpuStats {
                cores,
                system_load,
                lavalink_load,
            },
            frame_stats: FrameStats::default(),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> StatsCollector {
        StatsCollector::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_has_sane_shape() {
        let collector = StatsCollector::new();
        let frame = collector.frame(3, 1);

        assert_eq!(frame.players, 3);
        assert_eq!(frame.playing_players, 1);
        assert!(frame.cpu.cores > 0);
        assert!(frame.memory.allocated >= frame.memory.used);
        assert_eq!(frame.frame_stats.sent, 0);
    }
}
