use std::fs;
use std::process::{exit, Command, ExitStatus};

use clap::{Parser, Subcommand, ValueEnum};

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the ride-dispatch workspace",
    long_about = "A unified CLI for running the dispatch API, seeding demo\n\
                  drivers, and CI checks in the ride-dispatch workspace."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the dispatch HTTP API
    Serve {
        /// Build with optimizations
        #[arg(long)]
        release: bool,
        /// Seed file handed to the server via DISPATCH_SEED_FILE
        #[arg(long)]
        seed_file: Option<String>,
    },
    /// Write a demo driver seed file (Berlin bounding box)
    Seed {
        /// Number of drivers to generate
        #[arg(long, default_value_t = 50)]
        count: usize,
        /// Output file path
        #[arg(long, default_value = "drivers_seed.json")]
        output: String,
    },
    /// Run CI checks (fmt, clippy, tests)
    Ci {
        /// Job to run
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// Formatting, clippy, and tests
    Check,
    /// Check plus the feature matrix (osrm on/off)
    All,
}

// ── helpers ────────────────────────────────────────────────────────

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn cargo(args: &[&str]) -> ExitStatus {
    eprintln!("+ cargo {}", args.join(" "));
    Command::new("cargo")
        .args(args)
        .status()
        .expect("failed to execute cargo")
}

fn cargo_env(args: &[&str], env: &[(&str, &str)]) -> ExitStatus {
    eprintln!("+ cargo {}", args.join(" "));
    Command::new("cargo")
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.to_string(), v.to_string())))
        .status()
        .expect("failed to execute cargo")
}

fn run_cargo(args: &[&str]) {
    let status = cargo(args);
    if !status.success() {
        exit(status.code().unwrap_or(1));
    }
}

// ── seed generation ────────────────────────────────────────────────

// Demo bounding box: Berlin, Germany (approx).
const LAT_MIN: f64 = 52.34;
const LAT_MAX: f64 = 52.68;
const LNG_MIN: f64 = 13.08;
const LNG_MAX: f64 = 13.76;

const VEHICLES: [&str; 3] = ["car", "motorcycle", "auto"];

/// Small deterministic generator so repeated seeds are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next_f64(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn write_seed_file(count: usize, output: &str) {
    let mut rng = Lcg(42);
    let mut drivers = Vec::with_capacity(count);
    for i in 0..count {
        let lat = LAT_MIN + rng.next_f64() * (LAT_MAX - LAT_MIN);
        let lon = LNG_MIN + rng.next_f64() * (LNG_MAX - LNG_MIN);
        let vehicle = VEHICLES[i % VEHICLES.len()];
        drivers.push(format!(
            "  {{\"id\": \"demo-{i}\", \"lat\": {lat:.6}, \"lon\": {lon:.6}, \
             \"vehicleType\": \"{vehicle}\", \"pushAddress\": \"push-demo-{i}\"}}"
        ));
    }
    let body = format!("[\n{}\n]\n", drivers.join(",\n"));
    fs::write(output, body).expect("failed to write seed file");
    eprintln!("wrote {count} demo drivers to {output}");
}

// ── entry point ────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { release, seed_file } => {
            let mut args = vec!["run", "-p", "dispatch_http"];
            if release {
                args.push("--release");
            }
            let env: Vec<(&str, &str)> = seed_file
                .as_deref()
                .map(|path| vec![("DISPATCH_SEED_FILE", path)])
                .unwrap_or_default();
            let status = cargo_env(&args, &env);
            if !status.success() {
                exit(status.code().unwrap_or(1));
            }
        }
        Commands::Seed { count, output } => {
            write_seed_file(count, &output);
        }
        Commands::Ci { job } => {
            step("fmt");
            run_cargo(&["fmt", "--all", "--check"]);
            step("clippy");
            run_cargo(&["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"]);
            step("test");
            run_cargo(&["test", "--workspace"]);
            if matches!(job, CiJob::All) {
                step("feature matrix");
                run_cargo(&["check", "-p", "dispatch_core", "--no-default-features"]);
                run_cargo(&["check", "-p", "dispatch_core", "--features", "osrm"]);
                run_cargo(&["check", "-p", "dispatch_http", "--features", "osrm"]);
            }
        }
    }
}
