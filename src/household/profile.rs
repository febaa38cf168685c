//! Virtual user profiles and per-user sentiment
//!
//! Each household user carries a closed set of traffic-shape parameters, a
//! DSCP tag for server-side classification, latency/jitter budgets, and the
//! message table the view layer renders per (level, trend). The `computer`
//! profile's download target is updatable exactly once, from the adaptive
//! probe result.

use crate::household::wire::marker as wire_marker;
use crate::types::{Sentiment, SentimentLevel, SentimentTrend, UserId};
use rand::Rng;
use rand::rngs::SmallRng;
use std::collections::VecDeque;
use std::time::Duration;

pub use crate::household::wire::PayloadKind;

/// Gaming traffic: small packets on a tight clock
#[derive(Clone, Copy, Debug)]
pub struct GamerShape {
    /// Smallest packet in bytes
    pub packet_min: usize,
    /// Largest packet in bytes
    pub packet_max: usize,
    /// Send interval
    pub interval: Duration,
    /// Anti-synchronization jitter applied to each interval
    pub anti_sync_jitter: Duration,
}

/// Video-call traffic: codec GOP of I/P/B frames
#[derive(Clone, Copy, Debug)]
pub struct VideoShape {
    /// Packets per group-of-pictures
    pub gop_length: u32,
    /// I-frame size in bytes (one per GOP)
    pub i_frame: usize,
    /// P-frame size in bytes
    pub p_frame: usize,
    /// B-frame size in bytes
    pub b_frame: usize,
    /// Send interval
    pub interval: Duration,
}

/// HD streaming traffic: large download-heavy segments
#[derive(Clone, Copy, Debug)]
pub struct StreamerShape {
    /// Packet size in bytes
    pub packet_size: usize,
    /// Send interval
    pub interval: Duration,
}

/// Bulk transfer traffic: back-to-back large packets
#[derive(Clone, Copy, Debug)]
pub struct BulkShape {
    /// Packet size in bytes
    pub packet_size: usize,
    /// Send interval
    pub interval: Duration,
}

/// Closed variant over the four traffic shapes
#[derive(Clone, Copy, Debug)]
pub enum UserShape {
    /// Gaming (alex)
    Gamer(GamerShape),
    /// Video call (sarah)
    Video(VideoShape),
    /// HD streaming (jake)
    Streamer(StreamerShape),
    /// Bulk transfer (computer)
    Bulk(BulkShape),
}

/// Full static record for one virtual user
#[derive(Clone, Debug)]
pub struct UserProfile {
    /// The user this profile belongs to
    pub user: UserId,
    /// Traffic shape parameters
    pub shape: UserShape,
    /// Activity label sent in `start_traffic`
    pub activity: &'static str,
    /// DSCP priority tag, opaque to the engine
    pub dscp: &'static str,
    /// Download throughput target in Mbps
    pub target_down_mbps: f64,
    /// Upload throughput target in Mbps
    pub target_up_mbps: f64,
    /// Upload share of the traffic split, in [0, 1]
    pub upload_share: f64,
    /// Latency budget in milliseconds for sentiment and severity tagging
    pub latency_threshold_ms: f64,
    /// Jitter budget in milliseconds
    pub jitter_threshold_ms: f64,
    /// Whether the download target may still be overwritten by the probe
    target_down_updatable: bool,
}

impl UserProfile {
    /// The documented profile for a user
    pub fn for_user(user: UserId) -> Self {
        match user {
            UserId::Alex => Self {
                user,
                shape: UserShape::Gamer(GamerShape {
                    packet_min: 64,
                    packet_max: 128,
                    interval: Duration::from_millis(25),
                    anti_sync_jitter: Duration::from_millis(2),
                }),
                activity: "gaming",
                dscp: "EF",
                target_down_mbps: 1.5,
                target_up_mbps: 0.75,
                upload_share: 0.30,
                latency_threshold_ms: 75.0,
                jitter_threshold_ms: 30.0,
                target_down_updatable: false,
            },
            UserId::Sarah => Self {
                user,
                shape: UserShape::Video(VideoShape {
                    gop_length: 30,
                    i_frame: 1400,
                    p_frame: 1000,
                    b_frame: 600,
                    interval: Duration::from_millis(20),
                }),
                activity: "video-call",
                dscp: "AF41",
                target_down_mbps: 2.5,
                target_up_mbps: 2.5,
                upload_share: 0.50,
                latency_threshold_ms: 150.0,
                jitter_threshold_ms: 50.0,
                target_down_updatable: false,
            },
            UserId::Jake => Self {
                user,
                shape: UserShape::Streamer(StreamerShape {
                    packet_size: 8 * 1024,
                    interval: Duration::from_millis(8),
                }),
                activity: "streaming",
                dscp: "AF21",
                target_down_mbps: 25.0,
                target_up_mbps: 2.5,
                upload_share: 0.10,
                latency_threshold_ms: 200.0,
                jitter_threshold_ms: 80.0,
                target_down_updatable: false,
            },
            UserId::Computer => Self {
                user,
                shape: UserShape::Bulk(BulkShape {
                    packet_size: 16 * 1024,
                    interval: Duration::from_millis(1),
                }),
                activity: "bulk",
                dscp: "CS1",
                target_down_mbps: 50.0,
                target_up_mbps: 10.0,
                upload_share: 0.40,
                latency_threshold_ms: 400.0,
                jitter_threshold_ms: 150.0,
                target_down_updatable: true,
            },
        }
    }

    /// Profiles for the whole household, in canonical order
    pub fn household() -> Vec<UserProfile> {
        UserId::ALL.into_iter().map(Self::for_user).collect()
    }

    /// Apply the adaptive probe result to the download target.
    ///
    /// Only the `computer` profile accepts this, and only once per run.
    /// Returns whether the update was applied.
    pub fn set_target_down_once(&mut self, mbps: f64) -> bool {
        if !self.target_down_updatable || !mbps.is_finite() || mbps <= 0.0 {
            return false;
        }
        self.target_down_mbps = mbps;
        self.target_down_updatable = false;
        true
    }

    /// Next packet's size and frame kind, advancing the shape pattern
    pub fn next_packet(&self, sequence: u32, rng: &mut SmallRng) -> (usize, PayloadKind) {
        match &self.shape {
            UserShape::Gamer(shape) => (
                rng.gen_range(shape.packet_min..=shape.packet_max),
                PayloadKind::Data,
            ),
            UserShape::Video(shape) => {
                let position = sequence % shape.gop_length;
                if position == 0 {
                    (shape.i_frame, PayloadKind::IFrame)
                } else if position % 3 == 0 {
                    (shape.p_frame, PayloadKind::PFrame)
                } else {
                    (shape.b_frame, PayloadKind::BFrame)
                }
            }
            UserShape::Streamer(shape) => (shape.packet_size, PayloadKind::Data),
            UserShape::Bulk(shape) => (shape.packet_size, PayloadKind::Data),
        }
    }

    /// Base send interval of the shape
    pub fn interval(&self) -> Duration {
        match &self.shape {
            UserShape::Gamer(shape) => shape.interval,
            UserShape::Video(shape) => shape.interval,
            UserShape::Streamer(shape) => shape.interval,
            UserShape::Bulk(shape) => shape.interval,
        }
    }

    /// Send interval with the shape's anti-sync jitter applied
    ///
    /// Only the gamer carries jitter; every other shape returns the base
    /// interval unchanged.
    pub fn jittered_interval(&self, rng: &mut SmallRng) -> Duration {
        match &self.shape {
            UserShape::Gamer(shape) => {
                let jitter_us = shape.anti_sync_jitter.as_micros() as i64;
                let offset = rng.gen_range(-jitter_us..=jitter_us);
                let base = shape.interval.as_micros() as i64;
                Duration::from_micros((base + offset).max(0) as u64)
            }
            _ => self.interval(),
        }
    }

    /// Nominal packet size for the `start_traffic` announcement
    pub fn nominal_packet_size(&self) -> usize {
        match &self.shape {
            UserShape::Gamer(shape) => (shape.packet_min + shape.packet_max) / 2,
            UserShape::Video(shape) => shape.p_frame,
            UserShape::Streamer(shape) => shape.packet_size,
            UserShape::Bulk(shape) => shape.packet_size,
        }
    }

    /// Four-byte payload marker for auditable server-side logs
    pub fn marker(&self) -> [u8; 4] {
        match self.user {
            UserId::Alex => *wire_marker::GAMER,
            UserId::Sarah => *wire_marker::VIDEO,
            UserId::Jake => *wire_marker::STREAMER,
            UserId::Computer => *wire_marker::BULK,
        }
    }

    /// Download target in bits per second
    pub fn target_down_bps(&self) -> u64 {
        (self.target_down_mbps * 1_000_000.0) as u64
    }
}

/// Sentiment weights per activity: how much each impairment hurts this user
struct SentimentWeights {
    latency: f64,
    jitter: f64,
    loss: f64,
    throughput: f64,
}

fn weights(profile: &UserProfile) -> SentimentWeights {
    match profile.shape {
        // The gamer lives and dies by latency
        UserShape::Gamer(_) => SentimentWeights {
            latency: 0.50,
            jitter: 0.30,
            loss: 0.15,
            throughput: 0.05,
        },
        // Calls need both directions steady
        UserShape::Video(_) => SentimentWeights {
            latency: 0.35,
            jitter: 0.35,
            loss: 0.20,
            throughput: 0.10,
        },
        // Streaming buffers absorb latency; bandwidth is what matters
        UserShape::Streamer(_) => SentimentWeights {
            latency: 0.15,
            jitter: 0.10,
            loss: 0.25,
            throughput: 0.50,
        },
        UserShape::Bulk(_) => SentimentWeights {
            latency: 0.05,
            jitter: 0.05,
            loss: 0.20,
            throughput: 0.70,
        },
    }
}

/// Rolling sentiment state for one user
#[derive(Debug, Default)]
pub struct SentimentScorer {
    history: VecDeque<f64>,
}

/// Scores retained for trend detection
const TREND_HISTORY: usize = 6;

/// Score delta over the history window that counts as a trend
const TREND_DELTA: f64 = 5.0;

impl SentimentScorer {
    /// Create an empty scorer
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive sentiment from the current metrics tick
    ///
    /// `throughput_ratio` is achieved/target download throughput. All inputs
    /// are weighted per the user's activity.
    pub fn tick(
        &mut self,
        profile: &UserProfile,
        latency_ms: f64,
        jitter_ms: f64,
        loss: f64,
        throughput_ratio: f64,
    ) -> Sentiment {
        let w = weights(profile);

        // Each component maps to [0, 1]: 1 at ideal, 0 at twice the budget
        let latency_ok = 1.0 - (latency_ms / (2.0 * profile.latency_threshold_ms)).clamp(0.0, 1.0);
        let jitter_ok = 1.0 - (jitter_ms / (2.0 * profile.jitter_threshold_ms)).clamp(0.0, 1.0);
        let loss_ok = 1.0 - (loss * 5.0).clamp(0.0, 1.0);
        let throughput_ok = throughput_ratio.clamp(0.0, 1.0);

        let score = 100.0
            * (w.latency * latency_ok
                + w.jitter * jitter_ok
                + w.loss * loss_ok
                + w.throughput * throughput_ok);
        let score = score.clamp(0.0, 100.0);

        let trend = self.trend(score);
        if self.history.len() == TREND_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(score);

        Sentiment {
            score,
            level: level_for(score),
            trend,
        }
    }

    fn trend(&self, score: f64) -> SentimentTrend {
        if self.history.len() < 2 {
            return SentimentTrend::Stable;
        }
        let mean = self.history.iter().sum::<f64>() / self.history.len() as f64;
        if score > mean + TREND_DELTA {
            SentimentTrend::Improving
        } else if score < mean - TREND_DELTA {
            SentimentTrend::Degrading
        } else {
            SentimentTrend::Stable
        }
    }
}

fn level_for(score: f64) -> SentimentLevel {
    if score >= 90.0 {
        SentimentLevel::Excellent
    } else if score >= 70.0 {
        SentimentLevel::Good
    } else if score >= 50.0 {
        SentimentLevel::Fair
    } else {
        SentimentLevel::Poor
    }
}

/// The user's message for a (level, trend) cell, as rendered by the view layer
pub fn message_for(user: UserId, level: SentimentLevel, trend: SentimentTrend) -> &'static str {
    use SentimentLevel::*;
    use SentimentTrend::*;

    match user {
        UserId::Alex => match (level, trend) {
            (Excellent, Improving) => "Connection keeps getting better. Carrying the team!",
            (Excellent, Stable) => "Zero lag. Every shot lands.",
            (Excellent, Degrading) => "Still crisp, but something is creeping in.",
            (Good, Improving) => "Lag is clearing up nicely.",
            (Good, Stable) => "Playable, the occasional stutter.",
            (Good, Degrading) => "Starting to feel the rubber-banding.",
            (Fair, Improving) => "Getting better, still missing shots to lag.",
            (Fair, Stable) => "Constant peeker's advantage against me.",
            (Fair, Degrading) => "This is getting unplayable fast.",
            (Poor, Improving) => "Awful, but at least it's improving.",
            (Poor, Stable) => "Unplayable. Teleporting around the map.",
            (Poor, Degrading) => "Rage quitting. The connection lost this game.",
        },
        UserId::Sarah => match (level, trend) {
            (Excellent, Improving) => "Video just got even smoother.",
            (Excellent, Stable) => "Crystal clear call, no freezes.",
            (Excellent, Degrading) => "Call is fine but I see early warning signs.",
            (Good, Improving) => "The choppiness is going away.",
            (Good, Stable) => "Decent call with a rare frozen frame.",
            (Good, Degrading) => "People are starting to sound robotic.",
            (Fair, Improving) => "Still rough, slowly recovering.",
            (Fair, Stable) => "\"You're breaking up\" every other sentence.",
            (Fair, Degrading) => "Faces are freezing mid-word.",
            (Poor, Improving) => "Audio only, but it's coming back.",
            (Poor, Stable) => "Call is a slideshow.",
            (Poor, Degrading) => "Dropped off the meeting entirely.",
        },
        UserId::Jake => match (level, trend) {
            (Excellent, Improving) => "Stream bumped itself up to max quality.",
            (Excellent, Stable) => "Full HD, zero buffering.",
            (Excellent, Degrading) => "Still sharp but the buffer is shrinking.",
            (Good, Improving) => "Quality is stepping back up.",
            (Good, Stable) => "Solid stream, dips once in a while.",
            (Good, Degrading) => "Resolution just dropped a notch.",
            (Fair, Improving) => "Buffering less than a minute ago.",
            (Fair, Stable) => "Watching in potato quality.",
            (Fair, Degrading) => "Spinner city. Buffering every scene.",
            (Poor, Improving) => "Still unwatchable, trending better.",
            (Poor, Stable) => "Show stopped. Endless buffering.",
            (Poor, Degrading) => "Gave up and turned the TV off.",
        },
        UserId::Computer => match (level, trend) {
            (Excellent, Improving) => "Transfer accelerating past the estimate.",
            (Excellent, Stable) => "Download cruising at full speed.",
            (Excellent, Degrading) => "Fast, but the curve is bending down.",
            (Good, Improving) => "Throughput recovering.",
            (Good, Stable) => "Steady progress, slightly under target.",
            (Good, Degrading) => "ETA keeps climbing.",
            (Fair, Improving) => "Crawling upward again.",
            (Fair, Stable) => "Half the expected speed.",
            (Fair, Degrading) => "Transfer slowing to a trickle.",
            (Poor, Improving) => "Nearly stalled, inching back.",
            (Poor, Stable) => "Transfer effectively stalled.",
            (Poor, Degrading) => "Connection starved out completely.",
        },
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    // ── Shape parameters ────────────────────────────────────────────────

    #[test]
    fn profiles_match_the_documented_traffic_table() {
        let alex = UserProfile::for_user(UserId::Alex);
        assert_eq!(alex.interval(), Duration::from_millis(25));
        assert!((alex.upload_share - 0.30).abs() < f64::EPSILON);

        let sarah = UserProfile::for_user(UserId::Sarah);
        assert_eq!(sarah.interval(), Duration::from_millis(20));
        assert!((sarah.upload_share - 0.50).abs() < f64::EPSILON);

        let jake = UserProfile::for_user(UserId::Jake);
        assert_eq!(jake.interval(), Duration::from_millis(8));
        assert_eq!(jake.nominal_packet_size(), 8 * 1024);

        let computer = UserProfile::for_user(UserId::Computer);
        assert_eq!(computer.interval(), Duration::from_millis(1));
        assert_eq!(computer.nominal_packet_size(), 16 * 1024);
    }

    #[test]
    fn gamer_packets_stay_within_64_to_128_bytes() {
        let profile = UserProfile::for_user(UserId::Alex);
        let mut rng = rng();
        for seq in 0..500 {
            let (size, kind) = profile.next_packet(seq, &mut rng);
            assert!((64..=128).contains(&size), "gamer packet was {size} bytes");
            assert_eq!(kind, PayloadKind::Data);
        }
    }

    #[test]
    fn video_gop_has_one_i_frame_per_30_packets() {
        let profile = UserProfile::for_user(UserId::Sarah);
        let mut rng = rng();

        let mut i_frames = 0;
        for seq in 0..60 {
            let (size, kind) = profile.next_packet(seq, &mut rng);
            if kind == PayloadKind::IFrame {
                i_frames += 1;
                assert_eq!(size, 1400, "I-frames are the largest");
            }
            assert!((600..=1400).contains(&size));
        }
        assert_eq!(i_frames, 2, "two GOPs means exactly two I-frames");

        // The I-frame must sit at the GOP boundary
        let (_, kind) = profile.next_packet(30, &mut rng);
        assert_eq!(kind, PayloadKind::IFrame);
    }

    #[test]
    fn gamer_jitter_stays_within_plus_minus_2ms() {
        let profile = UserProfile::for_user(UserId::Alex);
        let mut rng = rng();
        for _ in 0..500 {
            let interval = profile.jittered_interval(&mut rng);
            assert!(
                (Duration::from_millis(23)..=Duration::from_millis(27)).contains(&interval),
                "jittered interval {interval:?} out of bounds"
            );
        }
    }

    #[test]
    fn non_gamer_shapes_have_no_jitter() {
        let mut rng = rng();
        for user in [UserId::Sarah, UserId::Jake, UserId::Computer] {
            let profile = UserProfile::for_user(user);
            assert_eq!(profile.jittered_interval(&mut rng), profile.interval());
        }
    }

    #[test]
    fn markers_match_the_documented_tags() {
        assert_eq!(&UserProfile::for_user(UserId::Alex).marker(), b"GAME");
        assert_eq!(&UserProfile::for_user(UserId::Sarah).marker(), b"VIDE");
        assert_eq!(&UserProfile::for_user(UserId::Jake).marker(), b"NFLX");
        assert_eq!(&UserProfile::for_user(UserId::Computer).marker(), b"DATA");
    }

    // ── Adaptive computer target ────────────────────────────────────────

    #[test]
    fn computer_target_updates_exactly_once() {
        let mut profile = UserProfile::for_user(UserId::Computer);
        assert!(profile.set_target_down_once(87.5));
        assert!((profile.target_down_mbps - 87.5).abs() < f64::EPSILON);

        assert!(
            !profile.set_target_down_once(10.0),
            "second update must be rejected"
        );
        assert!((profile.target_down_mbps - 87.5).abs() < f64::EPSILON);
    }

    #[test]
    fn non_computer_targets_are_immutable() {
        let mut profile = UserProfile::for_user(UserId::Jake);
        assert!(!profile.set_target_down_once(100.0));
        assert!((profile.target_down_mbps - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn degenerate_probe_results_are_rejected() {
        let mut profile = UserProfile::for_user(UserId::Computer);
        assert!(!profile.set_target_down_once(f64::NAN));
        assert!(!profile.set_target_down_once(0.0));
        assert!(!profile.set_target_down_once(-5.0));
        assert!(
            profile.set_target_down_once(42.0),
            "the slot must still be open after rejected values"
        );
    }

    // ── Sentiment ───────────────────────────────────────────────────────

    #[test]
    fn perfect_conditions_score_excellent() {
        let profile = UserProfile::for_user(UserId::Alex);
        let mut scorer = SentimentScorer::new();
        let sentiment = scorer.tick(&profile, 5.0, 0.5, 0.0, 1.0);
        assert!(sentiment.score >= 90.0, "got {}", sentiment.score);
        assert_eq!(sentiment.level, SentimentLevel::Excellent);
    }

    #[test]
    fn saturated_latency_tanks_the_gamer_score() {
        let profile = UserProfile::for_user(UserId::Alex);
        let mut scorer = SentimentScorer::new();
        // 300 ms against a 75 ms budget, with jitter blown too
        let sentiment = scorer.tick(&profile, 300.0, 80.0, 0.05, 1.0);
        assert!(
            sentiment.score < 50.0,
            "gamer under heavy bloat must score poor, got {}",
            sentiment.score
        );
        assert_eq!(sentiment.level, SentimentLevel::Poor);
    }

    #[test]
    fn bulk_user_cares_about_throughput_not_latency() {
        let computer = UserProfile::for_user(UserId::Computer);
        let mut scorer = SentimentScorer::new();
        // Terrible latency but full throughput: the bulk user barely notices
        let sentiment = scorer.tick(&computer, 500.0, 200.0, 0.0, 1.0);
        assert!(
            sentiment.score >= 70.0,
            "bulk with full throughput should stay good, got {}",
            sentiment.score
        );
    }

    #[test]
    fn trend_degrades_when_scores_fall() {
        let profile = UserProfile::for_user(UserId::Sarah);
        let mut scorer = SentimentScorer::new();

        for _ in 0..4 {
            scorer.tick(&profile, 20.0, 2.0, 0.0, 1.0);
        }
        // Sudden congestion
        let sentiment = scorer.tick(&profile, 400.0, 120.0, 0.2, 0.3);
        assert_eq!(sentiment.trend, SentimentTrend::Degrading);
    }

    #[test]
    fn trend_improves_when_scores_recover() {
        let profile = UserProfile::for_user(UserId::Sarah);
        let mut scorer = SentimentScorer::new();

        for _ in 0..4 {
            scorer.tick(&profile, 400.0, 120.0, 0.2, 0.3);
        }
        let sentiment = scorer.tick(&profile, 20.0, 2.0, 0.0, 1.0);
        assert_eq!(sentiment.trend, SentimentTrend::Improving);
    }

    #[test]
    fn first_tick_is_stable_by_definition() {
        let profile = UserProfile::for_user(UserId::Jake);
        let mut scorer = SentimentScorer::new();
        let sentiment = scorer.tick(&profile, 50.0, 5.0, 0.0, 0.9);
        assert_eq!(sentiment.trend, SentimentTrend::Stable);
    }

    #[test]
    fn every_message_cell_is_nonempty() {
        for user in UserId::ALL {
            for level in [
                SentimentLevel::Excellent,
                SentimentLevel::Good,
                SentimentLevel::Fair,
                SentimentLevel::Poor,
            ] {
                for trend in [
                    SentimentTrend::Improving,
                    SentimentTrend::Stable,
                    SentimentTrend::Degrading,
                ] {
                    assert!(
                        !message_for(user, level, trend).is_empty(),
                        "missing message for {user:?}/{level:?}/{trend:?}"
                    );
                }
            }
        }
    }
}
