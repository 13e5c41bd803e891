/// CPU package energy from the RAPL powercap interface
use std::fs;
use std::path::{Path, PathBuf};

pub const POWERCAP_ROOT: &str = "/sys/class/powercap";

/// One reading of all package-level RAPL domains
#[derive(Clone, Debug, PartialEq)]
pub struct EnergySample {
    /// (domain directory, energy_uj, max_energy_range_uj)
    domains: Vec<(PathBuf, u64, u64)>,
}

impl EnergySample {
    /// Read every `intel-rapl:N` package domain. `None` when no domain is
    /// readable (no RAPL, or counters restricted to root).
    pub fn read() -> Option<Self> {
        Self::read_from(Path::new(POWERCAP_ROOT))
    }

    pub fn read_from(root: &Path) -> Option<Self> {
        let mut domains = Vec::new();
        for entry in fs::read_dir(root).ok()?.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Package domains only; subdomains (intel-rapl:0:0) are included in them.
            if !name.starts_with("intel-rapl:") || name.matches(':').count() != 1 {
                continue;
            }
            let dir = entry.path();
            let energy = read_u64(&dir.join("energy_uj"));
            let range = read_u64(&dir.join("max_energy_range_uj"));
            if let (Some(energy), Some(range)) = (energy, range) {
                domains.push((dir, energy, range));
            }
        }
        domains.sort();
        if domains.is_empty() {
            None
        } else {
            Some(Self { domains })
        }
    }

    /// Joules consumed between `self` and `later`, accounting for counter wraparound.
    pub fn joules_until(&self, later: &EnergySample) -> Option<f64> {
        if self.domains.len() != later.domains.len() {
            return None;
        }
        let mut micro_joules = 0u64;
        for ((dir_a, start, range), (dir_b, end, _)) in self.domains.iter().zip(&later.domains) {
            if dir_a != dir_b {
                return None;
            }
            let delta = if end >= start {
                end - start
            } else {
                range.saturating_sub(*start).saturating_add(*end)
            };
            micro_joules = micro_joules.saturating_add(delta);
        }
        Some(micro_joules as f64 / 1_000_000.0)
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
