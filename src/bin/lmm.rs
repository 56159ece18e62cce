//! lmm - random-intercept linear mixed models by maximum likelihood
//!
//! Command-line interface for fitting `y ~ x + (1 | group)` models from TSV tables.

use clap::{Parser, Subcommand, ValueEnum};
use lmm_mle::data::{ModelFrame, Table};
use lmm_mle::error::Result;
use lmm_mle::model::{log_likelihood, LmmConfig, LmmEstimator, Theta};
use lmm_mle::optim::OptimizerKind;
use lmm_mle::test::{test_paired_from_table, test_random_intercept, test_wald_all};
use std::path::{Path, PathBuf};

/// CLI-friendly optimizer choice
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliOptimizer {
    /// L-BFGS with projected bounds
    Lbfgs,
    /// Derivative-free Nelder-Mead simplex
    NelderMead,
}

impl From<CliOptimizer> for OptimizerKind {
    fn from(kind: CliOptimizer) -> Self {
        match kind {
            CliOptimizer::Lbfgs => OptimizerKind::Lbfgs,
            CliOptimizer::NelderMead => OptimizerKind::NelderMead,
        }
    }
}

/// Output format of `fit`
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Yaml,
}

/// Random-intercept linear mixed models (ML)
#[derive(Parser)]
#[command(name = "lmm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model such as "y ~ treat + (1 | ind)"
    Fit {
        /// Path to data TSV
        #[arg(short, long)]
        data: PathBuf,

        /// Model formula with one random intercept
        #[arg(short, long)]
        formula: String,

        /// Optional YAML configuration (bounds, initial guess, tolerances)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the optimizer from the configuration
        #[arg(long, value_enum)]
        optimizer: Option<CliOptimizer>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Also test the random intercept against OLS
        #[arg(long)]
        lrt: bool,
    },

    /// Evaluate the log-likelihood at a given parameter vector
    Loglik {
        /// Path to data TSV
        #[arg(short, long)]
        data: PathBuf,

        /// Model formula with one random intercept
        #[arg(short, long)]
        formula: String,

        /// Parameters sigma,sigma_s,beta0,...
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        theta: Vec<f64>,
    },

    /// Paired t-test between two conditions within groups
    Paired {
        /// Path to data TSV
        #[arg(short, long)]
        data: PathBuf,

        /// Response column
        #[arg(short, long)]
        response: String,

        /// Condition column with exactly two levels
        #[arg(short, long)]
        condition: String,

        /// Grouping column (one pair per group)
        #[arg(short, long)]
        group: String,
    },

    /// Write an example configuration file
    ExampleConfig {
        /// Output path for YAML
        #[arg(short, long, default_value = "lmm.yaml")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit {
            data,
            formula,
            config,
            optimizer,
            format,
            lrt,
        } => cmd_fit(&data, &formula, config.as_deref(), optimizer, format, lrt),

        Commands::Loglik {
            data,
            formula,
            theta,
        } => cmd_loglik(&data, &formula, &theta),

        Commands::Paired {
            data,
            response,
            condition,
            group,
        } => cmd_paired(&data, &response, &condition, &group),

        Commands::ExampleConfig { output } => cmd_example_config(&output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if let Some(fit) = e.last_iterate() {
            eprintln!();
            eprintln!("Last iterate:");
            eprintln!("{}", fit);
        }
        std::process::exit(1);
    }
}

/// Fit the model and report estimates
fn cmd_fit(
    data_path: &Path,
    formula: &str,
    config_path: Option<&Path>,
    optimizer: Option<CliOptimizer>,
    format: OutputFormat,
    lrt: bool,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => {
            eprintln!("Loading configuration from {:?}...", path);
            LmmConfig::from_yaml(&std::fs::read_to_string(path)?)?
        }
        None => LmmConfig::default(),
    };
    if let Some(kind) = optimizer {
        config.optimizer = kind.into();
    }

    eprintln!("Loading data...");
    let table = Table::from_tsv(data_path)?;
    let ModelFrame {
        response: y,
        design,
        groups,
        ..
    } = ModelFrame::from_formula(&table, formula)?;
    eprintln!(
        "  {} observations, {} groups, {} fixed effects",
        y.len(),
        groups.n_groups(),
        design.n_coefficients()
    );

    eprintln!("Fitting {} ({})...", formula, config.optimizer);
    let fit = LmmEstimator::new(config).fit_design(&y, &design, &groups)?;
    let wald = test_wald_all(&fit)?;
    let lrt = if lrt {
        Some(test_random_intercept(&fit, &y, design.matrix())?)
    } else {
        None
    };

    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({ "fit": fit, "wald": wald, "lrt": lrt });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Yaml => {
            let out = serde_json::json!({ "fit": fit, "wald": wald, "lrt": lrt });
            println!("{}", serde_yaml::to_string(&out)?);
        }
        OutputFormat::Text => {
            println!("{}", fit);
            println!();
            println!(
                "{:<20} {:>14} {:>12} {:>10} {:>12}",
                "coefficient", "estimate", "std.error", "z", "p"
            );
            for w in &wald {
                println!(
                    "{:<20} {:>14.6} {:>12.6} {:>10.4} {:>12.4e}",
                    w.coefficient, w.estimate, w.std_error, w.statistic, w.p_value
                );
            }
            let boundary = fit.on_boundary();
            if !boundary.is_empty() {
                println!();
                println!("At lower bound: {}", boundary.join(", "));
            }
            if let Some(lrt) = &lrt {
                println!();
                println!(
                    "LRT sigma_s^2 = 0: statistic = {:.4}, p = {:.4e} (boundary corrected), {:.4e} (naive)",
                    lrt.statistic, lrt.p_value, lrt.p_value_naive
                );
            }
        }
    }

    Ok(())
}

/// Evaluate the log-likelihood at a parameter vector
fn cmd_loglik(data_path: &Path, formula: &str, theta: &[f64]) -> Result<()> {
    let table = Table::from_tsv(data_path)?;
    let frame = ModelFrame::from_formula(&table, formula)?;
    let theta = Theta::from_slice(theta, frame.design.n_coefficients())?;

    let ll = log_likelihood(&frame.response, frame.design.matrix(), &frame.groups, &theta)?;
    println!("{:.10}", ll);
    Ok(())
}

/// Run a paired t-test
fn cmd_paired(data_path: &Path, response: &str, condition: &str, group: &str) -> Result<()> {
    let table = Table::from_tsv(data_path)?;
    let result = test_paired_from_table(&table, response, condition, group)?;

    println!(
        "Paired t-test: {} - {} over {} pairs",
        result.comparison_level, result.reference_level, result.n_pairs
    );
    println!("  mean difference = {:.6}", result.mean_difference);
    println!("  std. error      = {:.6}", result.std_error);
    println!(
        "  t = {:.4}, df = {}, p = {:.4e}",
        result.statistic, result.df, result.p_value
    );
    println!(
        "  95% CI: [{:.6}, {:.6}]",
        result.ci_lower, result.ci_upper
    );
    Ok(())
}

/// Write an example configuration
fn cmd_example_config(output_path: &Path) -> Result<()> {
    let yaml = LmmConfig::default().to_yaml()?;

    std::fs::write(output_path, &yaml)?;
    eprintln!("Wrote example configuration to {:?}", output_path);
    eprintln!();
    eprintln!("Contents:");
    println!("{}", yaml);

    Ok(())
}
