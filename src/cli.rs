use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fit splines from single-color controls and precompute the mesh
    Estimate {
        /// Path to the run TOML
        #[arg(long, default_value = "run.toml")]
        config: PathBuf,

        /// Where to write the fitted model (JSON)
        #[arg(long, default_value = "model.json")]
        model_out: PathBuf,
    },

    /// Correct an event table with a saved model
    Apply {
        /// Model written by `estimate`
        #[arg(long)]
        model: PathBuf,

        /// Events to correct (.csv, .json or .parquet)
        #[arg(long)]
        input: PathBuf,

        /// Corrected events; format follows the extension
        #[arg(long)]
        output: PathBuf,

        /// Channel to correct; repeatable, all model channels when omitted
        #[arg(long = "channel", value_name = "NAME")]
        channels: Vec<String>,

        /// Also write the row accounting as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Estimate and apply in one go, without saving the model
    Run {
        #[arg(long, default_value = "run.toml")]
        config: PathBuf,

        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output: PathBuf,

        #[arg(long = "channel", value_name = "NAME")]
        channels: Vec<String>,
    },

    /// Dump fitted splines and the corrected mesh for plotting
    Diagnostics {
        #[arg(long)]
        model: PathBuf,

        /// Output JSON; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_channel_flags_collect() {
        let args = Args::try_parse_from([
            "piecewise-bleed",
            "apply",
            "--model",
            "m.json",
            "--input",
            "in.csv",
            "--output",
            "out.parquet",
            "--channel",
            "FITC-A",
            "--channel",
            "PE-A",
        ])
        .unwrap();
        match args.command {
            Command::Apply {
                channels, report, ..
            } => {
                assert_eq!(channels, ["FITC-A", "PE-A"]);
                assert!(report.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn estimate_has_defaults() {
        let args = Args::try_parse_from(["piecewise-bleed", "estimate"]).unwrap();
        match args.command {
            Command::Estimate { config, model_out } => {
                assert_eq!(config, PathBuf::from("run.toml"));
                assert_eq!(model_out, PathBuf::from("model.json"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
