/*
This file is part of the Hydrological Routing Tool
Copyright (C) 2022 Novel-T

The Hydrological Routing Tool is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::info;
use uuid::Uuid;

pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    let hours = secs / 3600;
    secs = secs % 3600;
    let minutes = secs / 60;
    secs = secs % 60;

    let ms = d.as_millis() % 1000;

    format!("{}h {}m {}s {}ms", hours, minutes, secs, ms)
}

/// Time-throttled progress reporting for the tile-scan outer loops.
pub struct ProgressLog {
    started: Instant,
    last_report: Instant,
    period_secs: u64,
}

impl ProgressLog {
    pub fn new() -> Self {
        let now = Instant::now();
        ProgressLog {
            started: now,
            last_report: now,
            period_secs: 5,
        }
    }

    pub fn tick(&mut self, num_processed: usize, num_total: usize, what: &str) {
        if self.last_report.elapsed().as_secs() < self.period_secs {
            return;
        }
        self.last_report = Instant::now();

        let elapsed = self.started.elapsed();
        let time_per_result = if num_processed == 0 {
            elapsed
        } else {
            elapsed / num_processed as u32
        };
        let est_remaining = time_per_result * (num_total - num_processed) as u32;

        info!(
            "{}: through {} of {}, elapsed {}, est. remaining {}",
            what,
            num_processed,
            num_total,
            format_duration(elapsed),
            format_duration(est_remaining)
        );
    }
}

impl Default for ProgressLog {
    fn default() -> Self {
        ProgressLog::new()
    }
}

/// Creates a fresh scratch directory next to `target` for an algorithm
/// invocation.  Removed by the caller on success, retained on failure so the
/// intermediate rasters can be inspected.
pub fn scratch_dir(target: &Path, prefix: &str) -> Result<PathBuf> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let dir = parent.join(format!("{}_{}", prefix, Uuid::new_v4()));
    create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(
            "0h 0m 1s 500ms",
            format_duration(Duration::from_millis(1500))
        );
        assert_eq!(
            "1h 1m 1s 0ms",
            format_duration(Duration::from_secs(3661))
        );
    }

    #[test]
    fn test_scratch_dir_unique() {
        let target = std::env::temp_dir().join("out.tif");
        let a = scratch_dir(&target, "fill_pits").unwrap();
        let b = scratch_dir(&target, "fill_pits").unwrap();
        assert!(a.exists());
        assert!(b.exists());
        assert_ne!(a, b);
        std::fs::remove_dir_all(&a).unwrap();
        std::fs::remove_dir_all(&b).unwrap();
    }
}
