//! End-to-end exploratory factor analysis of a personality trait table.
//!
//! ```text
//! cargo run --release --example personality_efa -- ratings.txt --factors 2
//! cargo run --release --example personality_efa -- https://host/ratings.txt --rotations varimax,oblimin
//! cargo run --release --example personality_efa            # simulated ratings
//! ```

use std::process;

use clap::Parser;
use efficient_fa::{
    very_simple_structure, CorrelationMatrix, Dataset, EigenDecomposition, EstimationMethod,
    FactorAnalysis, FactorAnalysisConfig, Rotation, SimulationModel, StandardizedDataset,
    VssConfig,
};
use ndarray::array;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[derive(Parser)]
#[command(name = "personality_efa")]
#[command(about = "Exploratory factor analysis of trait ratings", long_about = None)]
struct Cli {
    /// Path or http(s) URL of a whitespace-delimited table; simulated ratings when omitted
    source: Option<String>,

    /// Columns to leave out (e.g. ids or demographics)
    #[arg(long, value_delimiter = ',')]
    drop: Vec<String>,

    /// Number of factors to extract; defaults to the VSS complexity-1 peak
    #[arg(long)]
    factors: Option<usize>,

    /// Largest factor count tried by VSS
    #[arg(long, default_value = "6")]
    max_factors: usize,

    #[arg(long, default_value = "minres")]
    method: EstimationMethod,

    /// Rotations to compare
    #[arg(long, value_delimiter = ',', default_value = "none,varimax,oblimin")]
    rotations: Vec<Rotation>,

    /// Loadings below this magnitude are blanked in the tables
    #[arg(long, default_value = "0.3")]
    cutoff: f64,

    /// Seed for the simulated ratings
    #[arg(long, default_value = "42")]
    seed: u64,
}

/// Twelve adjective ratings driven by three correlated traits.
fn simulated_ratings(seed: u64) -> efficient_fa::Result<Dataset> {
    let loadings = array![
        [0.80, 0.00, 0.00],
        [0.75, 0.10, 0.00],
        [0.70, 0.00, 0.00],
        [0.60, 0.00, 0.15],
        [0.00, 0.80, 0.00],
        [0.00, 0.70, 0.00],
        [0.10, 0.65, 0.00],
        [0.00, 0.55, 0.00],
        [0.00, 0.00, 0.75],
        [0.00, 0.10, 0.70],
        [0.00, 0.00, 0.65],
        [0.15, 0.00, 0.50]
    ];
    let phi = array![[1.0, 0.3, 0.2], [0.3, 1.0, 0.1], [0.2, 0.1, 1.0]];
    let names = [
        "outgoing", "talkative", "lively", "bold", "organized", "tidy", "careful", "punctual",
        "anxious", "moody", "tense", "irritable",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    SimulationModel::new(loadings)?
        .with_names(names)?
        .with_phi(phi)?
        .sample(240, &mut rng)
}

fn load(cli: &Cli) -> efficient_fa::Result<Dataset> {
    let data = match cli.source.as_deref() {
        Some(src) if src.starts_with("http://") || src.starts_with("https://") => Dataset::fetch(src)?,
        Some(path) => Dataset::from_path(path)?,
        None => simulated_ratings(cli.seed)?,
    };
    if cli.drop.is_empty() {
        Ok(data)
    } else {
        data.drop_columns(&cli.drop)
    }
}

fn run(cli: Cli) -> efficient_fa::Result<()> {
    let data = load(&cli)?;
    println!(
        "Dataset: {} subjects x {} variables",
        data.n_subjects(),
        data.n_variables()
    );

    let standardized = StandardizedDataset::new(&data)?;
    let correlation = CorrelationMatrix::from_standardized(&standardized);
    let kmo = correlation.kmo()?;
    let sphericity = correlation.bartlett_sphericity()?;
    println!("KMO sampling adequacy: {:.3}", kmo.overall);
    println!(
        "Bartlett sphericity: chi-square {:.1} on {} dof",
        sphericity.chi_square, sphericity.dof
    );

    let eig = EigenDecomposition::new(&correlation)?;
    println!("\nScree (eigenvalue, cumulative proportion):");
    let cumulative = eig.cumulative_proportion();
    for (i, value) in eig.scree_points() {
        println!("{:>3} {:>8.3} {:>7.3}", i, value, cumulative[i - 1]);
    }
    println!("Eigenvalues above 1: {}", eig.kaiser_count());

    let p = correlation.dim();
    let max_factors = cli.max_factors.min(p.saturating_sub(1)).max(1);
    let max_factors = (1..=max_factors)
        .rev()
        .find(|&k| efficient_fa::degrees_of_freedom(p, k) >= 0)
        .unwrap_or(1);
    let vss = very_simple_structure(
        &correlation,
        &VssConfig {
            max_factors,
            method: cli.method,
            ..VssConfig::default()
        },
    )?;
    println!("\n{}", vss);

    let n_factors = cli
        .factors
        .or_else(|| vss.best_complexity1())
        .unwrap_or(1);
    for &rotation in &cli.rotations {
        let config = FactorAnalysisConfig {
            n_factors,
            method: cli.method,
            rotation,
            ..FactorAnalysisConfig::default()
        };
        let model = FactorAnalysis::new(config).fit(&correlation)?;
        println!("\n{}", model);
        println!("\nSorted loadings (|l| >= {}):", cli.cutoff);
        print!("{}", model.loading_table(cli.cutoff, true));
    }

    let model = FactorAnalysis::new(FactorAnalysisConfig {
        n_factors,
        method: cli.method,
        ..FactorAnalysisConfig::default()
    })
    .fit(&correlation)?;
    let heatmap = correlation.reordered(&model.sorted_variable_order())?;
    println!("\nHeatmap order: {}", heatmap.names().join(", "));
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
