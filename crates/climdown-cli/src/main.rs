//! Command-line boundary of the downscaling engine: configuration loading,
//! prepared-input loading, learning cache handling, and exit-code
//! translation.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::ThreadPoolBuilder;
use serde::Deserialize;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use climdown_core::{
    assemble, downscale, load_cache, save_cache, stream_records, AnalogEmitter, Config, Day,
    DownscaleError, DownscaledDay, EofProjection, Field, Grid, LearningInputs, LearningRecord,
    RunInputs,
};

#[derive(Parser)]
#[command(name = "climdown", about = "Statistical downscaling by weather typing")]
struct Cli {
    /// Path to the JSON configuration file.
    config: PathBuf,

    /// Prepared inputs (model/control runs and learning data) as JSON.
    #[arg(long)]
    inputs: PathBuf,

    /// Load the learning record from this cache instead of assembling it.
    #[arg(long)]
    learning_cache: Option<PathBuf>,

    /// Write the assembled learning record to this cache.
    #[arg(long)]
    save_cache: Option<PathBuf>,

    /// Where to write the analog record stream (stdout when omitted).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Worker threads for the analog search ("auto" or a count).
    #[arg(long, default_value = "auto")]
    threads: String,

    /// Override the configured master PRNG seed.
    #[arg(long)]
    seed: Option<u64>,
}

/// One simulation as the preprocessor hands it over.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RunData {
    eofs: EofProjection,
    secondary: Field,
    days: Vec<Day>,
}

/// Raw learning inputs when no cache is available.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LearningData {
    rea_eofs: EofProjection,
    rea_days: Vec<Day>,
    obs_eofs: EofProjection,
    obs_days: Vec<Day>,
    precip: Field,
    precip_grid: Grid,
    /// Secondary reanalysis field on the reanalysis calendar.
    secondary: Field,
    learning_mask: Option<Vec<u8>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct InputBundle {
    model: RunData,
    control: Option<RunData>,
    secondary_mask: Option<Vec<u8>>,
    learning: Option<LearningData>,
}

/// Collects the emitted stream for JSON output.
#[derive(Default)]
struct JsonEmitter {
    records: Vec<DownscaledDay>,
}

impl AnalogEmitter for JsonEmitter {
    fn emit(&mut self, day: &DownscaledDay) -> climdown_core::Result<()> {
        self.records.push(day.clone());
        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run(&cli) {
        error!("{err:#}");
        let code = err
            .downcast_ref::<DownscaleError>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    configure_threads(&cli.threads);

    let mut config: Config = read_json(&cli.config)
        .with_context(|| format!("reading configuration {}", cli.config.display()))?;
    if let Some(seed) = cli.seed {
        config.seed = Some(seed);
    }
    config.validate()?;

    // Seed once at startup; reruns with the same seed reproduce the run.
    let seed = config.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    });
    config.seed = Some(seed);
    info!(seed, "master PRNG seed");

    let bundle: InputBundle = read_json(&cli.inputs)
        .with_context(|| format!("reading inputs {}", cli.inputs.display()))?;

    let learning = resolve_learning(cli, &config, &bundle)?;

    let model = RunInputs {
        eofs: bundle.model.eofs,
        secondary: bundle.model.secondary,
        days: bundle.model.days,
    };
    let control = bundle.control.map(|run| RunInputs {
        eofs: run.eofs,
        secondary: run.secondary,
        days: run.days,
    });

    let output = downscale(
        &config,
        &model,
        control.as_ref(),
        &learning,
        bundle.secondary_mask.as_deref(),
    )?;

    let mut emitter = JsonEmitter::default();
    stream_records(&output.merged, &output.axis, &mut emitter)?;
    info!(records = emitter.records.len(), "downscaling finished");

    match &cli.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating output {}", path.display()))?;
            serde_json::to_writer(BufWriter::new(file), &emitter.records)?;
        }
        None => {
            serde_json::to_writer(std::io::stdout().lock(), &emitter.records)?;
        }
    }
    Ok(())
}

/// Load the learning record from cache when provided, otherwise assemble it
/// from the raw inputs in the bundle.
fn resolve_learning(
    cli: &Cli,
    config: &Config,
    bundle: &InputBundle,
) -> anyhow::Result<LearningRecord> {
    if let Some(path) = &cli.learning_cache {
        return Ok(load_cache(path, config)?);
    }
    let data = bundle.learning.as_ref().ok_or_else(|| {
        anyhow::Error::from(DownscaleError::Config(
            "no learning cache and no raw learning inputs provided".to_string(),
        ))
    })?;
    let inputs = LearningInputs {
        rea_eofs: &data.rea_eofs,
        rea_days: &data.rea_days,
        obs_eofs: &data.obs_eofs,
        obs_days: &data.obs_days,
        precip: &data.precip,
        precip_grid: &data.precip_grid,
        secondary: &data.secondary,
        secondary_mask: bundle.secondary_mask.as_deref(),
        learning_mask: data.learning_mask.as_deref(),
    };
    let seed = config.seed.unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);
    let record = assemble(config, &inputs, &mut rng)?;
    if let Some(path) = &cli.save_cache {
        save_cache(&record, path)?;
    }
    Ok(record)
}

fn configure_threads(spec: &str) {
    if spec.eq_ignore_ascii_case("auto") {
        return;
    }
    if let Ok(count) = spec.parse::<usize>() {
        let _ = ThreadPoolBuilder::new().num_threads(count).build_global();
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
