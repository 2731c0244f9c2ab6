//! Passive liveness heuristic over a short observation window.
//!
//! A printed photograph held to the camera keeps its landmarks and expression
//! scores nearly constant from frame to frame. A live face drifts, changes
//! expression and blinks. Each tracked subject gets a session that counts
//! those events; once enough of them accumulate within the observation
//! windows, the subject is approved for the rest of its continuous detection
//! run. Losing the subject discards the session.
//!
//! # Threat coverage
//!
//! - **Blocks:** static prints and still images.
//! - **Does not block:** video replay, masks, adversarial displays.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use uuid::Uuid;

use crate::types::{DetectionSample, Point};

/// Whom a liveness session tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKey {
    Identity(Uuid),
    /// Any face that did not match an enrolled descriptor.
    Unknown,
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKey::Identity(id) => write!(f, "{id}"),
            SubjectKey::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessVerdict {
    Pending,
    Approved,
}

impl LivenessVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, LivenessVerdict::Approved)
    }
}

/// Tunables for the liveness heuristic. Defaults are the deployed policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Summed landmark displacement (px) between two frames that counts as movement.
    pub motion_threshold: f32,
    /// A `neutral` score below this looks like a blink.
    pub blink_neutral_below: f32,
    /// A `sad` score above this looks like a blink.
    pub blink_sad_above: f32,
    pub min_blink_interval_ms: u64,
    /// Summed per-category expression delta that counts as an expression change.
    pub expression_change_threshold: f32,
    /// After this, a blink alone (or movement plus expression change) approves.
    pub fast_window_ms: u64,
    /// Nothing is approved before this; after it, two of three weak signals approve.
    pub slow_window_ms: u64,
    pub landmark_history: usize,
    pub expression_history: usize,
    pub quality_history: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            motion_threshold: 2.0,
            blink_neutral_below: 0.8,
            blink_sad_above: 0.05,
            min_blink_interval_ms: 300,
            expression_change_threshold: 0.1,
            fast_window_ms: 1_500,
            slow_window_ms: 800,
            landmark_history: 10,
            expression_history: 5,
            quality_history: 5,
        }
    }
}

/// Box geometry and detector confidence for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualitySample {
    pub area: f32,
    pub aspect_ratio: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
struct LivenessSession {
    started_ms: u64,
    landmarks: VecDeque<Vec<Point>>,
    expressions: VecDeque<BTreeMap<String, f32>>,
    quality: VecDeque<QualitySample>,
    movements: u32,
    expression_changes: u32,
    blinks: u32,
    last_blink_ms: Option<u64>,
    approved: bool,
}

impl LivenessSession {
    fn new(started_ms: u64) -> Self {
        Self {
            started_ms,
            landmarks: VecDeque::new(),
            expressions: VecDeque::new(),
            quality: VecDeque::new(),
            movements: 0,
            expression_changes: 0,
            blinks: 0,
            last_blink_ms: None,
            approved: false,
        }
    }
}

/// Read-only view of one session's counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionStats {
    pub elapsed_ms: u64,
    pub movements: u32,
    pub expression_changes: u32,
    pub blinks: u32,
    pub quality_samples: usize,
    pub latest_quality: Option<QualitySample>,
    pub approved: bool,
}

/// Owns every liveness session.
#[derive(Debug, Clone, Default)]
pub struct LivenessEvaluator {
    config: LivenessConfig,
    sessions: HashMap<SubjectKey, LivenessSession>,
}

impl LivenessEvaluator {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Feed one detection of `key` and return the current verdict.
    pub fn observe(&mut self, key: SubjectKey, sample: &DetectionSample, now_ms: u64) -> LivenessVerdict {
        if !self.sessions.contains_key(&key) {
            tracing::debug!(subject = %key, "liveness session started");
            self.sessions.insert(key, LivenessSession::new(now_ms));
            return LivenessVerdict::Pending;
        }
        let cfg = &self.config;
        let Some(session) = self.sessions.get_mut(&key) else {
            return LivenessVerdict::Pending;
        };
        if session.approved {
            return LivenessVerdict::Approved;
        }

        record_landmarks(cfg, session, &sample.landmarks);
        if let Some(scores) = &sample.expressions {
            record_expressions(cfg, session, scores, now_ms);
        }
        push_capped(
            &mut session.quality,
            QualitySample {
                area: sample.bbox.area(),
                aspect_ratio: sample.bbox.aspect_ratio(),
                confidence: sample.bbox.confidence,
            },
            cfg.quality_history,
        );

        let verdict = decide(cfg, session, now_ms);
        if verdict.is_approved() {
            session.approved = true;
            tracing::info!(
                subject = %key,
                elapsed_ms = now_ms.saturating_sub(session.started_ms),
                movements = session.movements,
                expression_changes = session.expression_changes,
                blinks = session.blinks,
                "liveness approved"
            );
        }
        verdict
    }

    /// Current verdict for `key` without feeding a sample.
    pub fn verdict(&self, key: SubjectKey) -> LivenessVerdict {
        match self.sessions.get(&key) {
            Some(s) if s.approved => LivenessVerdict::Approved,
            _ => LivenessVerdict::Pending,
        }
    }

    /// Tear down every session whose subject is not in `present`.
    pub fn retain_present(&mut self, present: &[SubjectKey]) {
        self.sessions.retain(|key, _| {
            let keep = present.contains(key);
            if !keep {
                tracing::debug!(subject = %key, "subject lost; liveness session discarded");
            }
            keep
        });
    }

    pub fn discard(&mut self, key: SubjectKey) {
        self.sessions.remove(&key);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self, key: SubjectKey, now_ms: u64) -> Option<SessionStats> {
        self.sessions.get(&key).map(|s| SessionStats {
            elapsed_ms: now_ms.saturating_sub(s.started_ms),
            movements: s.movements,
            expression_changes: s.expression_changes,
            blinks: s.blinks,
            quality_samples: s.quality.len(),
            latest_quality: s.quality.back().copied(),
            approved: s.approved,
        })
    }
}

fn record_landmarks(cfg: &LivenessConfig, session: &mut LivenessSession, current: &[Point]) {
    if current.is_empty() {
        return;
    }
    if let Some(previous) = session.landmarks.back() {
        let displacement: f32 = current
            .iter()
            .zip(previous.iter())
            .map(|(a, b)| a.distance(b))
            .sum();
        if displacement > cfg.motion_threshold {
            session.movements += 1;
        }
    }
    push_capped(&mut session.landmarks, current.to_vec(), cfg.landmark_history);
}

fn record_expressions(
    cfg: &LivenessConfig,
    session: &mut LivenessSession,
    scores: &BTreeMap<String, f32>,
    now_ms: u64,
) {
    let neutral_dropped = scores
        .get("neutral")
        .is_some_and(|&n| n < cfg.blink_neutral_below);
    let sad_rose = scores.get("sad").is_some_and(|&s| s > cfg.blink_sad_above);
    let interval_ok = session
        .last_blink_ms
        .map_or(true, |last| now_ms.saturating_sub(last) > cfg.min_blink_interval_ms);
    if (neutral_dropped || sad_rose) && interval_ok {
        session.blinks += 1;
        session.last_blink_ms = Some(now_ms);
    }

    if let Some(previous) = session.expressions.back() {
        let delta: f32 = scores
            .iter()
            .filter_map(|(category, score)| previous.get(category).map(|p| (score - p).abs()))
            .sum();
        if delta > cfg.expression_change_threshold {
            session.expression_changes += 1;
        }
    }
    push_capped(&mut session.expressions, scores.clone(), cfg.expression_history);
}

fn decide(cfg: &LivenessConfig, session: &LivenessSession, now_ms: u64) -> LivenessVerdict {
    let elapsed = now_ms.saturating_sub(session.started_ms);
    if elapsed <= cfg.slow_window_ms {
        return LivenessVerdict::Pending;
    }

    let moved = session.movements >= 1;
    let expressive = session.expression_changes >= 1;

    if elapsed > cfg.fast_window_ms && (session.blinks >= 1 || (moved && expressive)) {
        return LivenessVerdict::Approved;
    }

    let varied = session.quality.len() > 2;
    let criteria = [moved, expressive, varied].iter().filter(|&&c| c).count();
    if criteria >= 2 {
        LivenessVerdict::Approved
    } else {
        LivenessVerdict::Pending
    }
}

fn push_capped<T>(history: &mut VecDeque<T>, item: T, cap: usize) {
    history.push_back(item);
    while history.len() > cap {
        history.pop_front();
    }
}
