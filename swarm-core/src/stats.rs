// Lightweight throughput accounting, sampled once per second by the owning
// session/handler. Not part of the wire protocol; purely observability.

#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputStats {
    pub up: Counter,
    pub down: Counter,
}

impl ThroughputStats {
    pub fn reset(&mut self) {
        self.up.reset();
        self.down.reset();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    total: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {
    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    // Decays the running average towards this round's total, over a 5-tick window.
    pub fn reset(&mut self) {
        self.avg = (self.avg * (5 - 1) as f64 / 5.0) + (self.round as f64 / 5.0);
        self.round = 0;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
    }

    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

impl std::ops::AddAssign<u64> for Counter {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}
