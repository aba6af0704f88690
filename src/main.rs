//! dictlearn-rs CLI: fit a Semi-NMF dictionary on an activation matrix

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::Parser;
use dictlearn_rs::{relative_avg_l2_loss, sparsity_eps, SemiNmf, SemiNmfConfig, Solver};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "dictlearn-rs")]
#[command(about = "Semi-NMF dictionary learning for activation matrices")]
#[command(version)]
struct Cli {
    /// Number of dictionary components
    #[arg(short = 'k', long, default_value_t = 5)]
    components: usize,

    /// Update rule: mu or pgd
    #[arg(short, long, default_value = "mu")]
    solver: String,

    /// Maximum number of alternating iterations
    #[arg(long, default_value_t = 500)]
    max_iter: usize,

    /// L1 sparsity penalty on the codes
    #[arg(long, default_value_t = 0.0)]
    l1_penalty: f64,

    /// Path to a CSV activation matrix (rows = samples); random data if omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Number of random samples when no input file is given
    #[arg(long, default_value_t = 50)]
    samples: usize,

    /// Random-sample dimensionality when no input file is given
    #[arg(long, default_value_t = 10)]
    dims: usize,

    /// Output directory for the fit report
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Parse a headerless CSV of f32 values into an (n, dims) tensor
fn load_csv(path: &PathBuf, device: &Device) -> Result<Tensor> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut rows: Vec<Vec<f32>> = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: Vec<f32> = line
            .split(',')
            .map(|cell| {
                cell.trim()
                    .parse::<f32>()
                    .with_context(|| format!("Bad value '{cell}' on line {}", line_no + 1))
            })
            .collect::<Result<_>>()?;
        if let Some(first) = rows.first() {
            anyhow::ensure!(
                row.len() == first.len(),
                "Line {} has {} columns, expected {}",
                line_no + 1,
                row.len(),
                first.len()
            );
        }
        rows.push(row);
    }
    anyhow::ensure!(!rows.is_empty(), "Input file is empty");

    let n = rows.len();
    let dims = rows[0].len();
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (n, dims), device)?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let device = Device::Cpu;
    let solver: Solver = cli.solver.parse()?;

    let x = match &cli.input {
        Some(path) => {
            info!("Loading activation matrix from {}", path.display());
            load_csv(path, &device)?
        }
        None => {
            info!(
                "No input file, generating a random {}x{} matrix (seed {})",
                cli.samples, cli.dims, cli.seed
            );
            let mut rng = StdRng::seed_from_u64(cli.seed);
            let data: Vec<f32> = (0..cli.samples * cli.dims)
                .map(|_| rng.gen_range(0.0..1.0))
                .collect();
            Tensor::from_vec(data, (cli.samples, cli.dims), &device)?
        }
    };
    let (n, dims) = (x.dim(0)?, x.dim(1)?);

    println!("=== dictlearn-rs: Semi-NMF fit ===");
    println!("Data:       {n} samples x {dims} dims");
    println!("Components: {}", cli.components);
    println!("Solver:     {solver}");
    if cli.l1_penalty > 0.0 {
        println!("L1 penalty: {}", cli.l1_penalty);
    }

    let mut config = SemiNmfConfig::new(cli.components);
    config.solver = solver;
    config.max_iter = cli.max_iter;
    config.l1_penalty = cli.l1_penalty;
    config.seed = cli.seed;

    let mut model = SemiNmf::new(config, &device)?;
    let (z, d) = model.fit(&x)?;
    let report = model
        .report()
        .context("no fit report after a successful fit")?
        .clone();

    let x_hat = z.matmul(&d)?;
    let rel_error = relative_avg_l2_loss(&x, &x_hat)?;
    let code_sparsity = sparsity_eps(&z, 1e-6)?;

    println!("\n=== Results ===");
    println!("Iterations:     {}", report.iterations);
    println!("Converged:      {}", report.converged);
    println!("Final error:    {:.6}", report.final_error);
    println!("Relative error: {rel_error:.6}");
    println!("Code sparsity:  {:.1}%", code_sparsity * 100.0);

    std::fs::create_dir_all(&cli.output)?;
    let report_path = cli.output.join("semi_nmf_report.json");
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;
    info!("Report saved to {}", report_path.display());

    Ok(())
}
