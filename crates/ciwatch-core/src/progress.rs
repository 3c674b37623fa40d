use crate::Run;

const OVERTIME_RATIO: f64 = 1.2;

/// Estimated completion of an in-flight run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Progress {
    pub percent: f64,
    pub overtime: bool,
}

/// Offset between the server's wall clock and ours, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockSkew(i64);

impl ClockSkew {
    pub fn measure(server_time: i64, local_now: i64) -> Self {
        Self(server_time - local_now)
    }

    pub fn seconds(&self) -> i64 {
        self.0
    }

    pub fn server_now(&self, local_now: i64) -> i64 {
        local_now + self.0
    }
}

/// Progress for `run` at server time `server_now`, if the server gave it an
/// estimated completion time.
pub fn estimate(run: &Run, server_now: i64) -> Option<Progress> {
    let started = run.started?;
    let etc = run.etc?;
    if etc <= started {
        return None;
    }
    let ratio = (server_now - started) as f64 / (etc - started) as f64;
    let percent = if ratio >= 1.0 {
        99.0
    } else {
        (100.0 * ratio).max(0.0)
    };
    Some(Progress {
        percent,
        overtime: ratio > OVERTIME_RATIO,
    })
}

/// Recomputes percent-complete for running runs using the skew measured at
/// the last sync.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressEstimator {
    skew: ClockSkew,
}

impl ProgressEstimator {
    pub fn sync(&mut self, server_time: i64, local_now: i64) {
        self.skew = ClockSkew::measure(server_time, local_now);
    }

    pub fn skew(&self) -> ClockSkew {
        self.skew
    }

    pub fn refresh(&self, runs: &mut [Run], local_now: i64) {
        let server_now = self.skew.server_now(local_now);
        for run in runs {
            if let Some(progress) = estimate(run, server_now) {
                run.progress = Some(progress);
            }
        }
    }
}
