//! # PhaseNet CLI
//!
//! Headless launcher for spiking network simulations.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use phasenet_core::{ActivityTrace, NetworkParams, Variant};
use phasenet_engine::{Model, Point};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{info, warn, Level};

/// Side of the square plane neurons are laid out on
const LAYOUT_SIZE: f64 = 500.0;

#[derive(Parser)]
#[command(name = "phasenet")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Discrete-time spiking neuron network simulator", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Network construction flags shared by `run` and `links`
#[derive(clap::Args)]
struct NetworkArgs {
    /// Model variant (binary, weighted, psychoactive, phase)
    #[arg(long, default_value = "phase", value_parser = parse_variant)]
    variant: Variant,

    /// JSON file with network parameters; flags override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of neurons
    #[arg(short, long)]
    neurons: Option<usize>,

    /// Transmission-loss coefficient
    #[arg(long)]
    beta: Option<f64>,

    /// Leak coefficient
    #[arg(long)]
    gamma: Option<f64>,

    /// Drug concentration in [-1, 1]
    #[arg(long, allow_hyphen_values = true)]
    ca: Option<f64>,

    /// Phase model time step (ms)
    #[arg(long)]
    delta_t: Option<f64>,

    /// Connection probability of the random policy
    #[arg(short, long)]
    probability: Option<f64>,

    /// Generator seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Lay neurons out on a 500x500 plane and link those within this radius
    #[arg(short, long)]
    radius: Option<f64>,

    /// Replace out-of-range beta, gamma and ca with defaults instead of failing
    #[arg(long)]
    lenient: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation
    Run {
        #[command(flatten)]
        network: NetworkArgs,

        /// Number of steps
        #[arg(short = 't', long, default_value_t = 1000)]
        steps: usize,

        /// Write the activity trace as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build a link matrix and print its summary
    Links {
        #[command(flatten)]
        network: NetworkArgs,
    },

    /// List model variants
    Variants,
}

fn parse_variant(s: &str) -> Result<Variant, String> {
    Variant::ALL
        .into_iter()
        .find(|v| v.name().eq_ignore_ascii_case(s))
        .ok_or_else(|| {
            let names: Vec<&str> = Variant::ALL.iter().map(|v| v.name()).collect();
            format!("unknown variant '{s}' (expected one of: {})", names.join(", "))
        })
}

impl NetworkArgs {
    fn params(&self) -> anyhow::Result<NetworkParams> {
        let mut params = match &self.config {
            Some(path) => NetworkParams::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => NetworkParams::default(),
        };

        if let Some(n) = self.neurons {
            params.neurons = n;
        }
        if let Some(beta) = self.beta {
            params.beta = beta;
        }
        if let Some(gamma) = self.gamma {
            params.gamma = gamma;
        }
        if let Some(ca) = self.ca {
            params.ca = ca;
        }
        if let Some(dt) = self.delta_t {
            params.delta_t = dt;
        }
        if let Some(p) = self.probability {
            params.connection_probability = p;
        }
        if self.seed.is_some() {
            params.seed = self.seed;
        }

        if self.lenient {
            let (sanitized, warnings) = params.sanitize();
            for warning in &warnings {
                warn!("{warning}");
            }
            params = sanitized;
        }

        Ok(params)
    }

    fn build(&self) -> anyhow::Result<Model> {
        let params = self.params()?;

        let model = match self.radius {
            Some(radius) => {
                let points = layout(params.neurons, params.seed);
                Model::with_layout(self.variant, params, &points, radius)?
            }
            None => Model::new(self.variant, params)?,
        };

        info!(
            variant = %model.variant(),
            neurons = model.len(),
            connections = model.links().connection_count(),
            "network built"
        );
        Ok(model)
    }
}

/// Uniform random positions on the layout plane
fn layout(neurons: usize, seed: Option<u64>) -> Vec<Point> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_entropy(),
    };
    (0..neurons)
        .map(|_| Point::new(rng.gen_range(0.0..LAYOUT_SIZE), rng.gen_range(0.0..LAYOUT_SIZE)))
        .collect()
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn run(network: &NetworkArgs, steps: usize, output: Option<PathBuf>) -> anyhow::Result<()> {
    let mut model = network.build()?;

    println!(
        "{} {} network, {} neurons, {} steps",
        "Running".green().bold(),
        model.variant().to_string().cyan(),
        model.len(),
        steps
    );

    let progress = ProgressBar::new(steps as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}")?
            .progress_chars("=> "),
    );

    let mut trace = ActivityTrace::new();
    for snapshot in model.simulation(steps) {
        trace.push(
            snapshot.generation,
            snapshot.active_count(),
            snapshot.mean_potential(),
            snapshot.routine.name(),
        );
        progress.set_message(format!("{} active", snapshot.active_count()));
        progress.inc(1);
    }
    progress.finish_and_clear();

    println!("{}", "Summary:".green().bold());
    println!("  Peak activity:  {}", trace.peak_active().to_string().yellow());
    if let Some(last) = trace.active.last() {
        println!("  Final activity: {last}");
    }
    println!("  Cold starts:    {}", trace.count_routine("cold_start"));
    println!("  Re-feeds:       {}", trace.count_routine("refeed"));

    if let Some(path) = output {
        std::fs::write(&path, trace.to_json()?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("  Trace written:  {}", path.display().to_string().cyan());
    }

    Ok(())
}

fn links(network: &NetworkArgs) -> anyhow::Result<()> {
    let model = network.build()?;
    let links = model.links();

    println!(
        "{} {} x {} ({} variant)",
        "Link matrix:".green().bold(),
        links.len(),
        links.len(),
        model.variant().to_string().cyan()
    );
    println!("  Connections: {}", links.connection_count());
    println!("  Self-leak:   {:.4}", model.config().self_leak());
    println!();
    println!("  {:>6} {:>8} {:>10}", "neuron", "targets", "|weights|");
    for col in 0..links.len() {
        println!(
            "  {:>6} {:>8} {:>10.4}",
            col,
            links.column_connections(col),
            links.column_abs_sum(col)
        );
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            network,
            steps,
            output,
        } => run(&network, steps, output)?,

        Commands::Links { network } => links(&network)?,

        Commands::Variants => {
            println!("{}", "Model Variants:".green().bold());
            println!();
            for variant in Variant::ALL {
                println!("  {:<13} - {}", variant.name().cyan(), variant.description());
            }
        }
    }

    Ok(())
}
