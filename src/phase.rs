//! Single-user phase controller
//!
//! Runs the fixed wall-clock timetable on a 100 ms tick against a monotonic
//! clock. Transitions are strictly forward; a late tick walks through every
//! missed threshold in order so no phase event is ever skipped.

use crate::types::{Event, Phase};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Total single-user test duration
pub const TEST_DURATION: Duration = Duration::from_secs(60);

/// Phase start offsets in seconds from test start
///
/// Each phase runs from its offset to the next phase's offset; `Bidi` ends
/// at [`TEST_DURATION`].
const TIMETABLE: [(Phase, u64); 6] = [
    (Phase::Baseline, 0),
    (Phase::DlWarmup, 4),
    (Phase::Dl, 11),
    (Phase::UlWarmup, 23),
    (Phase::Ul, 36),
    (Phase::Bidi, 48),
];

/// The phase the timetable prescribes at `elapsed` since test start
pub fn phase_at(elapsed: Duration) -> Phase {
    if elapsed >= TEST_DURATION {
        return Phase::Complete;
    }
    let secs = elapsed.as_secs_f64();
    let mut current = Phase::Baseline;
    for (phase, start) in TIMETABLE {
        if secs >= start as f64 {
            current = phase;
        }
    }
    current
}

/// Start and end offsets of a phase, or `None` for `Idle`/`Complete`
pub fn phase_window(phase: Phase) -> Option<(Duration, Duration)> {
    let idx = TIMETABLE.iter().position(|&(p, _)| p == phase)?;
    let start = Duration::from_secs(TIMETABLE[idx].1);
    let end = TIMETABLE
        .get(idx + 1)
        .map(|&(_, s)| Duration::from_secs(s))
        .unwrap_or(TEST_DURATION);
    Some((start, end))
}

/// Monotonic deadline of a phase given the test's t0
pub fn phase_deadline(t0: Instant, phase: Phase) -> Option<Instant> {
    phase_window(phase).map(|(_, end)| t0 + end)
}

/// Parameters for spawning the phase controller
pub(crate) struct PhaseControllerParams {
    /// Tick period (100 ms)
    pub tick: Duration,
    /// Ordered phase delivery to the engine loop
    pub phase_tx: tokio::sync::mpsc::Sender<Phase>,
    /// Event broadcast sender for `phase-changed`
    pub event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Cancellation token
    pub cancel: CancellationToken,
}

/// Spawn the timetable ticker.
///
/// Captures a monotonic t0 at spawn. Each tick compares elapsed time to the
/// timetable and steps the state forward through every crossed threshold,
/// publishing `phase-changed` per step and delivering the phase to the
/// engine's bounded channel. The controller never raises; it stops once
/// `Complete` is delivered or the engine hangs up.
pub(crate) fn spawn_phase_controller(
    params: PhaseControllerParams,
) -> tokio::task::JoinHandle<()> {
    let PhaseControllerParams {
        tick,
        phase_tx,
        event_tx,
        cancel,
    } = params;

    tokio::spawn(async move {
        let t0 = Instant::now();
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut current = Phase::Idle;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let target = phase_at(t0.elapsed());

                    // Walk forward through every missed phase in order
                    while current < target {
                        let Some(next) = current.next() else {
                            break;
                        };
                        current = next;

                        tracing::info!(phase = %current, elapsed_ms = t0.elapsed().as_millis(), "phase changed");
                        event_tx
                            .send(Event::PhaseChanged { phase: current })
                            .ok();
                        if phase_tx.send(current).await.is_err() {
                            // Engine dropped its receiver -- nothing left to drive
                            return;
                        }
                    }

                    if current == Phase::Complete {
                        return;
                    }
                }
                _ = cancel.cancelled() => {
                    return;
                }
            }
        }
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    // ── Timetable lookup ────────────────────────────────────────────────

    #[test]
    fn phase_at_matches_the_documented_timetable() {
        let cases = [
            (0.0, Phase::Baseline),
            (3.9, Phase::Baseline),
            (4.0, Phase::DlWarmup),
            (10.9, Phase::DlWarmup),
            (11.0, Phase::Dl),
            (22.9, Phase::Dl),
            (23.0, Phase::UlWarmup),
            (35.9, Phase::UlWarmup),
            (36.0, Phase::Ul),
            (47.9, Phase::Ul),
            (48.0, Phase::Bidi),
            (59.9, Phase::Bidi),
            (60.0, Phase::Complete),
            (90.0, Phase::Complete),
        ];

        for (secs, expected) in cases {
            let actual = phase_at(Duration::from_secs_f64(secs));
            assert_eq!(actual, expected, "at t={secs}s expected {expected:?}");
        }
    }

    #[test]
    fn phase_windows_tile_the_full_minute() {
        let phases = [
            Phase::Baseline,
            Phase::DlWarmup,
            Phase::Dl,
            Phase::UlWarmup,
            Phase::Ul,
            Phase::Bidi,
        ];

        let mut cursor = Duration::ZERO;
        for phase in phases {
            let (start, end) = phase_window(phase).unwrap();
            assert_eq!(start, cursor, "{phase:?} must start where the last ended");
            assert!(end > start);
            cursor = end;
        }
        assert_eq!(cursor, TEST_DURATION, "windows must cover exactly 60 s");
    }

    #[test]
    fn idle_and_complete_have_no_window() {
        assert!(phase_window(Phase::Idle).is_none());
        assert!(phase_window(Phase::Complete).is_none());
    }

    #[test]
    fn phase_deadline_is_t0_plus_window_end() {
        let t0 = Instant::now();
        let deadline = phase_deadline(t0, Phase::Dl).unwrap();
        assert_eq!(deadline, t0 + Duration::from_secs(23));
    }

    // ── Controller behavior (paused clock) ──────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn controller_emits_every_phase_in_timetable_order() {
        let (phase_tx, mut phase_rx) = tokio::sync::mpsc::channel(16);
        let (event_tx, _event_rx) = tokio::sync::broadcast::channel(1000);
        let cancel = CancellationToken::new();

        let handle = spawn_phase_controller(PhaseControllerParams {
            tick: Duration::from_millis(100),
            phase_tx,
            event_tx,
            cancel,
        });

        let mut received = Vec::new();
        // Step the paused clock through the whole minute
        for _ in 0..650 {
            tokio::time::advance(Duration::from_millis(100)).await;
            while let Ok(phase) = phase_rx.try_recv() {
                received.push(phase);
            }
        }

        assert_eq!(
            received,
            vec![
                Phase::Baseline,
                Phase::DlWarmup,
                Phase::Dl,
                Phase::UlWarmup,
                Phase::Ul,
                Phase::Bidi,
                Phase::Complete,
            ],
            "phases must arrive exactly once each, in timetable order"
        );

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("controller should stop after Complete")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_ticks_walk_through_missed_phases_without_skipping() {
        let (phase_tx, mut phase_rx) = tokio::sync::mpsc::channel(16);
        let (event_tx, _event_rx) = tokio::sync::broadcast::channel(1000);
        let cancel = CancellationToken::new();

        let _handle = spawn_phase_controller(PhaseControllerParams {
            tick: Duration::from_millis(100),
            phase_tx,
            event_tx,
            cancel,
        });

        // Jump straight past three thresholds in one leap (as if the
        // process stalled for 25 s), then let the controller catch up
        tokio::time::advance(Duration::from_millis(25_100)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        let mut received = Vec::new();
        while let Ok(phase) = phase_rx.try_recv() {
            received.push(phase);
        }

        assert_eq!(
            received,
            vec![Phase::Baseline, Phase::DlWarmup, Phase::Dl, Phase::UlWarmup],
            "a stalled tick must emit every crossed phase in order"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn controller_stops_when_cancelled() {
        let (phase_tx, _phase_rx) = tokio::sync::mpsc::channel(16);
        let (event_tx, _event_rx) = tokio::sync::broadcast::channel(1000);
        let cancel = CancellationToken::new();

        let handle = spawn_phase_controller(PhaseControllerParams {
            tick: Duration::from_millis(100),
            phase_tx,
            event_tx,
            cancel: cancel.clone(),
        });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("controller should stop promptly on cancel")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn controller_exits_when_engine_drops_the_receiver() {
        let (phase_tx, phase_rx) = tokio::sync::mpsc::channel(16);
        let (event_tx, _event_rx) = tokio::sync::broadcast::channel(1000);
        let cancel = CancellationToken::new();

        let handle = spawn_phase_controller(PhaseControllerParams {
            tick: Duration::from_millis(100),
            phase_tx,
            event_tx,
            cancel,
        });

        drop(phase_rx);
        tokio::time::advance(Duration::from_millis(300)).await;

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("controller should exit once the engine hangs up")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn phase_changed_events_mirror_channel_delivery() {
        let (phase_tx, mut phase_rx) = tokio::sync::mpsc::channel(16);
        let (event_tx, mut event_rx) = tokio::sync::broadcast::channel(1000);
        let cancel = CancellationToken::new();

        let _handle = spawn_phase_controller(PhaseControllerParams {
            tick: Duration::from_millis(100),
            phase_tx,
            event_tx,
            cancel,
        });

        tokio::time::advance(Duration::from_millis(4_200)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        let mut channel_phases = Vec::new();
        while let Ok(phase) = phase_rx.try_recv() {
            channel_phases.push(phase);
        }
        let mut event_phases = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            if let Event::PhaseChanged { phase } = event {
                event_phases.push(phase);
            }
        }

        assert_eq!(channel_phases, vec![Phase::Baseline, Phase::DlWarmup]);
        assert_eq!(
            event_phases, channel_phases,
            "bus events and channel delivery must agree"
        );
    }
}
