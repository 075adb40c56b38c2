#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use regime_gate::regime_core::{
    Candle, EngineEvent, InstrumentEngine, LevelSet, MovingAverageUpdate, MovingAverages, PositionUpdate,
    RiskFlagUpdate, RiskFlags, Side, Timeframe,
};
use regime_gate::EngineConfig;

/// 2025-03-04 14:00 UTC, 09:00 New York: the end of the opening lock of the day that opened at 08:30
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 4, 14, 0, 0).unwrap()
}

pub fn candle(timeframe: Timeframe, idx: i64, close: f64) -> Candle {
    let open_time = t0() + Duration::minutes(timeframe.minutes() * idx);
    Candle {
        timeframe,
        open_time,
        close_time: open_time + Duration::minutes(timeframe.minutes()),
        open: close,
        high: close + 0.25,
        low: close - 0.25,
        close,
        is_final: true,
    }
}

pub fn levels(breakout: f64, breakdown: f64) -> LevelSet {
    LevelSet {
        instrument: "NQ".to_string(),
        session_date: NaiveDate::from_ymd_opt(2025, 3, 4).unwrap(),
        breakout_trigger: breakout,
        breakdown_trigger: breakdown,
        daily_support: breakdown - 10.0,
        daily_resistance: breakout + 10.0,
        htf_support: None,
        htf_resistance: None,
        opening_range_high: None,
        opening_range_low: None,
        moving_averages: BTreeMap::new(),
    }
}

/// BO 100 / BD 90 with 1h and 4h averages well below the triggers (bullish HTF above 100)
pub fn bullish_levels() -> LevelSet {
    let mut l = levels(100.0, 90.0);
    l.moving_averages.insert(
        Timeframe::H1,
        MovingAverages {
            ema21: Some(95.0),
            sma200: Some(90.0),
        },
    );
    l.moving_averages.insert(
        Timeframe::H4,
        MovingAverages {
            ema21: Some(94.0),
            sma200: Some(88.0),
        },
    );
    l
}

pub fn engine_with(levels: LevelSet) -> InstrumentEngine {
    let mut engine = InstrumentEngine::new("NQ", EngineConfig::default());
    engine.handle(&EngineEvent::Levels(levels)).unwrap();
    engine.handle(&EngineEvent::Clock(t0())).unwrap();
    engine
}

pub fn close15(engine: &mut InstrumentEngine, idx: i64, close: f64) -> regime_gate::EngineUpdate {
    engine
        .handle(&EngineEvent::Candle(candle(Timeframe::M15, idx, close)))
        .unwrap()
}

pub fn close5(engine: &mut InstrumentEngine, idx: i64, close: f64) -> regime_gate::EngineUpdate {
    engine
        .handle(&EngineEvent::Candle(candle(Timeframe::M5, idx, close)))
        .unwrap()
}

pub fn ema5(engine: &mut InstrumentEngine, value: f64, at: DateTime<Utc>) {
    engine
        .handle(&EngineEvent::MovingAverages(MovingAverageUpdate {
            timeframe: Timeframe::M5,
            as_of: at,
            values: MovingAverages {
                ema21: Some(value),
                sma200: None,
            },
        }))
        .unwrap();
}

pub fn position(engine: &mut InstrumentEngine, direction: Side, price: f64, open: bool, at: DateTime<Utc>) -> regime_gate::EngineUpdate {
    engine
        .handle(&EngineEvent::Position(PositionUpdate {
            timestamp: at,
            direction,
            entry_price: price,
            is_open: open,
        }))
        .unwrap()
}

pub fn risk(engine: &mut InstrumentEngine, flags: RiskFlags, at: DateTime<Utc>) -> regime_gate::EngineUpdate {
    engine
        .handle(&EngineEvent::RiskFlags(RiskFlagUpdate { timestamp: at, flags }))
        .unwrap()
}

/// Rally from 96 to 111 on the 5m, then a pullback to 102: stochastic comes
/// off overbought and the last close sits just above a 101.8 EMA.
pub fn feed_pullback(engine: &mut InstrumentEngine) {
    let mut closes: Vec<f64> = (0..16).map(|i| 96.0 + i as f64).collect();
    closes.extend([108.0, 105.0, 103.0, 102.0]);
    for (i, close) in closes.iter().enumerate() {
        close5(engine, i as i64, *close);
    }
    ema5(engine, 101.8, t0() + Duration::minutes(100));
}

/// Levels, pullback, two closes above the breakout: Core granted in AcceptanceConfirmed
pub fn core_ready_engine() -> InstrumentEngine {
    let mut engine = engine_with(bullish_levels());
    feed_pullback(&mut engine);
    close15(&mut engine, 0, 101.0);
    close15(&mut engine, 1, 102.0);
    engine
}
