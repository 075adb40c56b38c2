//! Historical replay
//!
//! Drives one `InstrumentEngine` per instrument over recorded candles and
//! level sets. Instruments are independent and replayed in parallel.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::CandleRow;
use crate::config::EngineConfig;
use crate::regime_core::{
    Alarm, EngineEvent, EngineOutput, ForceExit, InstrumentEngine, LevelSet, SessionCalendar, TransitionRecord,
};

/// Outcome of replaying one instrument
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub instrument: String,
    pub events: usize,
    pub rejected: usize,
    pub records: Vec<TransitionRecord>,
    pub force_exits: Vec<ForceExit>,
    pub alarms: Vec<Alarm>,
    pub final_output: EngineOutput,
}

/// Order a single instrument's inputs into an event timeline.
///
/// Candles are ordered by close time, lower timeframes first on ties so the
/// 5m guard runs before the 15m close that shares its timestamp. Each level set
/// is released just before the first candle of its trading day.
pub fn build_timeline(mut candles: Vec<CandleRow>, mut levels: Vec<LevelSet>, calendar: &SessionCalendar) -> Vec<EngineEvent> {
    candles.sort_by(|a, b| {
        a.close_time
            .cmp(&b.close_time)
            .then(a.timeframe.cmp(&b.timeframe))
            .then(a.is_final.cmp(&b.is_final))
    });
    levels.sort_by_key(|l| l.session_date);

    let mut pending = levels.into_iter().peekable();
    let mut events = Vec::with_capacity(candles.len() + 4);

    for row in candles {
        let day = calendar.session_date(row.close_time);
        while let Some(next) = pending.next_if(|l| l.session_date <= day) {
            events.push(EngineEvent::Levels(next));
        }
        events.push(EngineEvent::Candle(row.candle()));
    }
    events.extend(pending.map(EngineEvent::Levels));
    events
}

/// Replay one instrument's timeline
pub fn replay_instrument(instrument: &str, events: &[EngineEvent], config: &EngineConfig) -> ReplayReport {
    let mut engine = InstrumentEngine::new(instrument, config.clone());
    let mut report = ReplayReport {
        instrument: instrument.to_string(),
        events: events.len(),
        rejected: 0,
        records: Vec::new(),
        force_exits: Vec::new(),
        alarms: Vec::new(),
        final_output: engine.output().clone(),
    };

    for event in events {
        match engine.handle(event) {
            Ok(update) => {
                report.records.extend(update.records);
                report.force_exits.extend(update.force_exit);
                report.alarms.extend(update.alarms);
            }
            Err(e) => {
                report.rejected += 1;
                if !e.is_rejection() {
                    warn!("{}: {}", instrument, e);
                }
            }
        }
    }

    report.final_output = engine.output().clone();
    info!(
        "{}: {} events, {} rejected, {} transitions, {} forced exits",
        instrument,
        report.events,
        report.rejected,
        report.records.len(),
        report.force_exits.len()
    );
    report
}

/// Replay every instrument found in `candles` in parallel
pub fn replay_all(candles: Vec<CandleRow>, levels: Vec<LevelSet>, config: &EngineConfig) -> Vec<ReplayReport> {
    let calendar = SessionCalendar::new(config.session_preset);

    let mut by_instrument: BTreeMap<String, (Vec<CandleRow>, Vec<LevelSet>)> = BTreeMap::new();
    for row in candles {
        by_instrument.entry(row.instrument.clone()).or_default().0.push(row);
    }
    for level in levels {
        by_instrument.entry(level.instrument.clone()).or_default().1.push(level);
    }

    let work: Vec<(String, Vec<EngineEvent>)> = by_instrument
        .into_iter()
        .map(|(instrument, (candles, levels))| (instrument, build_timeline(candles, levels, &calendar)))
        .collect();

    info!("Replaying {} instruments", work.len());

    work.par_iter()
        .map(|(instrument, events)| replay_instrument(instrument, events, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime_core::candle::test_support::candle;
    use crate::regime_core::levels::test_support::level_set;
    use crate::regime_core::{RegimeState, Direction, Timeframe};

    fn row(instrument: &str, timeframe: Timeframe, idx: i64, close: f64) -> CandleRow {
        let c = candle(timeframe, idx, close);
        CandleRow {
            instrument: instrument.to_string(),
            timeframe,
            open_time: c.open_time,
            close_time: c.close_time,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            is_final: true,
        }
    }

    #[test]
    fn test_timeline_releases_levels_first_and_orders_timeframes() {
        let calendar = SessionCalendar::default();
        let candles = vec![
            row("NQ", Timeframe::M15, 0, 95.0),
            row("NQ", Timeframe::M5, 2, 95.0),
        ];
        let events = build_timeline(candles, vec![level_set(100.0, 90.0)], &calendar);

        assert!(matches!(events[0], EngineEvent::Levels(_)));
        // Both close at t0 + 15m; the 5m candle goes first
        match (&events[1], &events[2]) {
            (EngineEvent::Candle(a), EngineEvent::Candle(b)) => {
                assert_eq!(a.timeframe, Timeframe::M5);
                assert_eq!(b.timeframe, Timeframe::M15);
            }
            other => panic!("unexpected timeline {:?}", other),
        }
    }

    #[test]
    fn test_replay_two_instruments_independently() {
        let mut es_levels = level_set(5000.0, 4980.0);
        es_levels.instrument = "ES".to_string();

        let candles = vec![
            row("NQ", Timeframe::M15, 0, 101.0),
            row("NQ", Timeframe::M15, 1, 102.0),
            row("ES", Timeframe::M15, 0, 4990.0),
            row("ES", Timeframe::M15, 1, 4991.0),
        ];
        let reports = replay_all(candles, vec![level_set(100.0, 90.0), es_levels], &EngineConfig::default());

        assert_eq!(reports.len(), 2);
        let es = reports.iter().find(|r| r.instrument == "ES").unwrap();
        let nq = reports.iter().find(|r| r.instrument == "NQ").unwrap();
        assert_eq!(es.final_output.regime, RegimeState::Balance);
        assert_eq!(nq.final_output.regime, RegimeState::Discovery(Direction::Up));
        assert_eq!(nq.rejected, 0);
    }
}
