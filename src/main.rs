use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use piecewise_bleed::cli::{Args, Command};
use piecewise_bleed::config::RunConfig;
use piecewise_bleed::data::{loader, writer};
use piecewise_bleed::{CancelToken, FittedModel, engine};

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Estimate { config, model_out } => {
            let model = estimate_from(&config)?;
            model.save(&model_out)?;
            info!("model written to {}", model_out.display());
        }
        Command::Apply {
            model,
            input,
            output,
            channels,
            report,
        } => {
            let model = FittedModel::load(&model)?;
            let report_json = correct_file(&model, &input, &output, &channels)?;
            if let Some(path) = report {
                std::fs::write(&path, report_json)
                    .with_context(|| format!("writing report {}", path.display()))?;
            }
        }
        Command::Run {
            config,
            input,
            output,
            channels,
        } => {
            let model = estimate_from(&config)?;
            correct_file(&model, &input, &output, &channels)?;
        }
        Command::Diagnostics { model, output } => {
            let model = FittedModel::load(&model)?;
            let diag = engine::diagnostics(&model);
            match output {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    serde_json::to_writer_pretty(BufWriter::new(file), &diag)
                        .context("writing diagnostics")?;
                }
                None => {
                    let mut out = io::stdout().lock();
                    serde_json::to_writer_pretty(&mut out, &diag)
                        .context("writing diagnostics")?;
                    writeln!(out)?;
                }
            }
        }
    }
    Ok(())
}

fn estimate_from(config: &Path) -> Result<FittedModel> {
    let cfg = RunConfig::load(config)?;
    let controls = cfg.load_controls()?;
    engine::estimate(&controls, &cfg.metadata(), &cfg.params(), &CancelToken::new())
        .context("estimating bleedthrough")
}

/// Load, correct and write one event file. Returns the report as JSON.
fn correct_file(
    model: &FittedModel,
    input: &Path,
    output: &Path,
    channels: &[String],
) -> Result<String> {
    let table = loader::load_file(input)?;
    let (corrected, report) =
        engine::apply(model, &table, channels).context("applying correction")?;
    writer::write_file(&corrected, output)?;
    serde_json::to_string_pretty(&report).context("encoding report")
}
