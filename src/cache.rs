//! File loading for replay: level sets (`.json` / `.json.zst`) and candle CSVs
//! (`.csv` / `.csv.zst`)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::info;

use crate::regime_core::{Candle, LevelSet, Timeframe};

/// One row of a candle CSV
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleRow {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default = "default_final")]
    pub is_final: bool,
}

fn default_final() -> bool {
    true
}

impl CandleRow {
    pub fn candle(&self) -> Candle {
        Candle {
            timeframe: self.timeframe,
            open_time: self.open_time,
            close_time: self.close_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            is_final: self.is_final,
        }
    }
}

/// A level file holds one level set or a list of them
#[derive(Deserialize)]
#[serde(untagged)]
enum LevelFile {
    Many(Vec<LevelSet>),
    One(LevelSet),
}

fn is_zstd(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "zst")
}

fn open_maybe_compressed(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    if is_zstd(path) {
        let decoder = zstd::stream::Decoder::new(file)
            .with_context(|| format!("Failed to create zstd decoder for: {:?}", path))?;
        Ok(Box::new(decoder))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Load level sets, sorted by instrument then session date
pub fn load_levels(path: &Path) -> Result<Vec<LevelSet>> {
    let bytes = if is_zstd(path) {
        let compressed = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
        zstd::decode_all(&compressed[..]).with_context(|| format!("Failed to decompress {:?}", path))?
    } else {
        std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?
    };

    let mut levels = match serde_json::from_slice::<LevelFile>(&bytes)
        .with_context(|| format!("Failed to parse level file {:?}", path))?
    {
        LevelFile::Many(v) => v,
        LevelFile::One(l) => vec![l],
    };
    levels.sort_by(|a, b| {
        a.instrument
            .cmp(&b.instrument)
            .then(a.session_date.cmp(&b.session_date))
    });

    info!("Loaded {} level sets from {:?}", levels.len(), path);
    Ok(levels)
}

/// Save level sets as zstd-compressed JSON
pub fn save_levels(levels: &[LevelSet], path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_vec(levels)?;
    if is_zstd(path) {
        let compressed = zstd::encode_all(&json[..], 3)?;
        std::fs::write(path, compressed)?;
    } else {
        std::fs::write(path, json)?;
    }
    Ok(())
}

/// Load candle rows in file order
pub fn load_candles(path: &Path) -> Result<Vec<CandleRow>> {
    let reader = open_maybe_compressed(path)?;
    let mut csv_reader = csv::Reader::from_reader(reader);

    let mut rows = Vec::new();
    for (line, result) in csv_reader.deserialize().enumerate() {
        let row: CandleRow = result.with_context(|| format!("Failed to parse CSV row {}", line + 2))?;
        rows.push(row);
    }

    info!("Loaded {} candles from {:?}", rows.len(), path);
    Ok(rows)
}
