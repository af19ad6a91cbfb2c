//! Routing-anomaly scoring
//!
//! Builds a population model of navigation behavior: every observed
//! (previous path, current path) transition feeds a shared path graph, and
//! each session's jump scores are compared against the global average. The
//! resulting score in [0, 1] is attached to the upstream-bound request as a
//! header so the origin can act on it.
//!
//! All shared state is lock-protected; scoring is safe under concurrent
//! requests.

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::pathgraph::PathGraph;
use crate::tracker::CookieTracker;

/// Cookie carrying the per-session tracking identifier.
pub const TRACKING_COOKIE: &str = "rg-trc";
/// Tracking cookie lifetime: 24 hours.
pub const TRACKING_COOKIE_MAX_AGE: u32 = 24 * 60 * 60;

/// Tuning knobs for the scorer, normally taken from the service config.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Header attached to the upstream request.
    pub header_name: String,
    /// Number of globally observed jumps before scores are emitted.
    pub threshold: u64,
    /// Raw scores below this clamp to 0.
    pub min_score: f64,
    /// Raw scores above this clamp to 1.
    pub max_score: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            header_name: "X-Anomaly-Score".to_string(),
            threshold: 100,
            min_score: 100.0,
            max_score: 200.0,
        }
    }
}

#[derive(Default)]
struct SessionRecord {
    jumps_count: u64,
    jumps_score_sum: f64,
    last_path: Option<String>,
}

#[derive(Default)]
struct GlobalStats {
    number_of_jumps: u64,
    score_sum: f64,
    avg_deviation: f64,
}

/// Scores each session's navigation against the learned population model.
pub struct AnomalyDetector {
    graph: Mutex<PathGraph>,
    sessions: DashMap<String, SessionRecord>,
    stats: Mutex<GlobalStats>,
    tracker: CookieTracker,
    header: hyper::header::HeaderName,
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, secure_cookie: bool) -> Self {
        let header = config
            .header_name
            .parse()
            .unwrap_or(hyper::header::HeaderName::from_static("x-anomaly-score"));
        Self {
            graph: Mutex::new(PathGraph::new()),
            sessions: DashMap::new(),
            stats: Mutex::new(GlobalStats::default()),
            tracker: CookieTracker::new(TRACKING_COOKIE, TRACKING_COOKIE_MAX_AGE, secure_cookie),
            header,
            config,
        }
    }

    pub fn tracker(&self) -> &CookieTracker {
        &self.tracker
    }

    pub fn header(&self) -> &hyper::header::HeaderName {
        &self.header
    }

    /// Record one request for `session_id` landing on `current_path` and
    /// return its anomaly score.
    ///
    /// The previous path is the session's last observed path, falling back
    /// to `referer_path` for the session's first request, falling back to
    /// the empty entry vertex.
    pub fn observe(&self, session_id: &str, referer_path: Option<&str>, current_path: &str) -> f64 {
        let (jump_score, session_avg) = {
            let mut record = self.sessions.entry(session_id.to_string()).or_default();

            let previous = record
                .last_path
                .clone()
                .or_else(|| referer_path.map(str::to_string))
                .unwrap_or_default();

            let jump_score = self.graph.lock().add_jump(&previous, current_path) as f64;

            record.jumps_count += 1;
            record.jumps_score_sum += jump_score;
            record.last_path = Some(current_path.to_string());

            (jump_score, record.jumps_score_sum / record.jumps_count as f64)
        };

        let mut stats = self.stats.lock();
        stats.number_of_jumps += 1;
        stats.score_sum += jump_score;

        let n = stats.number_of_jumps as f64;
        let global_avg = (stats.score_sum / n) * 2.0;
        let deviation = (global_avg - session_avg).abs();

        // Raw score uses the deviation history as it stood before this jump
        let raw = if stats.avg_deviation == 0.0 {
            f64::INFINITY
        } else {
            deviation / (stats.avg_deviation / 100.0)
        };

        stats.avg_deviation = ((stats.avg_deviation * n) + deviation) / n;

        if stats.number_of_jumps < self.config.threshold {
            return 0.0;
        }

        if raw < self.config.min_score {
            0.0
        } else if raw > self.config.max_score {
            1.0
        } else {
            (raw - self.config.min_score) / 100.0
        }
    }

    #[cfg(test)]
    fn global_jumps(&self) -> u64 {
        self.stats.lock().number_of_jumps
    }
}
