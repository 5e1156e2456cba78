use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use piecewise_bleed::config::{ChannelConfig, RunConfig};
use piecewise_bleed::data::model::{ConditionValue, EventTable};
use piecewise_bleed::data::writer::write_file;

const CHANNELS: [&str; 3] = ["FITC-A", "PE-A", "APC-A"];
const RANGE: f64 = 262_144.0;
const AF_STDEV: f64 = 30.0;
const EVENTS_PER_CONTROL: usize = 5_000;
const MIXED_EVENTS: usize = 20_000;

/// `SPILL[from][to]`: fraction of dye `from` seen in channel `to` at low
/// intensity.
const SPILL: [[f64; 3]; 3] = [[1.0, 0.15, 0.01], [0.02, 1.0, 0.05], [0.0, 0.03, 1.0]];

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5)).rotate_left(7).wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }

    /// Log-uniform brightness between 10 and 10^`max_decade`.
    fn brightness(&mut self, max_decade: f64) -> f64 {
        10f64.powf(1.0 + self.next_f64() * (max_decade - 1.0))
    }
}

/// Signal of dye `from` in channel `to`. The spill fraction creeps up with
/// brightness so a single compensation matrix cannot fit it.
fn detected(from: usize, to: usize, dye: f64) -> f64 {
    let a = SPILL[from][to];
    if from == to {
        dye
    } else {
        a * dye * (1.0 + 0.3 * dye / RANGE)
    }
}

/// Raw measurement of a cell carrying `dyes`, with autofluorescence noise.
fn measure(dyes: &[f64; 3], rng: &mut SimpleRng) -> [f64; 3] {
    let mut raw = [0.0; 3];
    for (to, slot) in raw.iter_mut().enumerate() {
        let signal: f64 = (0..3).map(|from| detected(from, to, dyes[from])).sum();
        *slot = signal + rng.gauss(0.0, AF_STDEV);
    }
    raw
}

fn to_table(rows: &[[f64; 3]]) -> Result<EventTable> {
    EventTable::from_channels(
        CHANNELS
            .iter()
            .enumerate()
            .map(|(c, name)| (*name, rows.iter().map(|r| r[c]).collect())),
    )
}

fn control(dye: usize, rng: &mut SimpleRng) -> Result<EventTable> {
    let rows: Vec<[f64; 3]> = (0..EVENTS_PER_CONTROL)
        .map(|_| {
            let mut dyes = [0.0; 3];
            dyes[dye] = rng.brightness(5.2);
            measure(&dyes, rng)
        })
        .collect();
    to_table(&rows)
}

fn mixed(rng: &mut SimpleRng) -> Result<EventTable> {
    let wells = ["A1", "A2", "B1", "B2"];
    let mut rows = Vec::with_capacity(MIXED_EVENTS);
    let mut well = Vec::with_capacity(MIXED_EVENTS);
    let mut dose = Vec::with_capacity(MIXED_EVENTS);

    for i in 0..MIXED_EVENTS {
        let w = i % wells.len();
        let mut dyes = [0.0; 3];
        for d in &mut dyes {
            if rng.next_f64() < 0.6 {
                *d = rng.brightness(4.5);
            }
        }
        rows.push(measure(&dyes, rng));
        well.push(ConditionValue::String(wells[w].to_string()));
        dose.push(ConditionValue::Float([0.0, 0.1, 1.0, 10.0][w]));
    }

    let mut table = to_table(&rows)?;
    table.insert_condition("well", well)?;
    table.insert_condition("dose", dose)?;
    Ok(table)
}

fn main() -> Result<()> {
    env_logger::init();
    let out_dir = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("sample_data"), PathBuf::from);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let mut rng = SimpleRng::new(42);
    let mut channels = BTreeMap::new();
    for (dye, name) in CHANNELS.iter().enumerate() {
        let file = format!("control_{}.parquet", name.to_ascii_lowercase());
        write_file(&control(dye, &mut rng)?, &out_dir.join(&file))?;
        channels.insert(
            name.to_string(),
            ChannelConfig {
                control: PathBuf::from(file),
                range: RANGE,
                af_median: 0.0,
                af_stdev: AF_STDEV,
            },
        );
    }

    let events = out_dir.join("mixed_events.parquet");
    write_file(&mixed(&mut rng)?, &events)?;

    let config = RunConfig {
        channels,
        ..RunConfig::default()
    };
    let config_path: &Path = &out_dir.join("run.toml");
    std::fs::write(config_path, config.to_toml_string()?)
        .with_context(|| format!("writing {}", config_path.display()))?;

    println!(
        "Wrote {} controls ({EVENTS_PER_CONTROL} events each), {MIXED_EVENTS} mixed events and {}",
        CHANNELS.len(),
        config_path.display()
    );
    println!(
        "Try: piecewise-bleed run --config {} --input {} --output corrected.csv",
        config_path.display(),
        events.display()
    );
    Ok(())
}
