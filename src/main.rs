use wakesim::{AnalysisMode, Scenario, ScenarioConfig};
use wakesim::{bench_induced_velocity, bench_search};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, default_value = "rect_wing.yaml")]
    file_name: String,

    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run the induced-velocity benchmarks instead of a scenario
    #[arg(long)]
    bench: bool,

    /// Write the final wake and grid state to this record file
    #[arg(long)]
    output: Option<PathBuf>,
}

// load here to keep main clean
fn load_scenario_from_yaml(file_name: &str) -> Result<ScenarioConfig> {
    let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios").join(file_name);
    let file = File::open(&config_path).with_context(|| format!("opening {}", config_path.display()))?;
    let reader = BufReader::new(file);
    let scenario_cfg: ScenarioConfig = serde_yaml::from_reader(reader)?;

    Ok(scenario_cfg)
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_level.as_str())).init();

    if args.bench {
        bench_induced_velocity();
        bench_search();
        return Ok(());
    }

    let scenario_cfg = load_scenario_from_yaml(&args.file_name)?;
    let scenario = Scenario::build_scenario(scenario_cfg)?;
    let num_steps = scenario.num_steps;
    let mut solver = scenario.into_solver();

    match solver.mode {
        AnalysisMode::Steady => {
            let report = solver.solve_steady();
            info!(
                "steady rollup: {} iterations, {} rollbacks, movement {:.3e}, converged {}",
                report.iterations, report.rollbacks, report.residual, report.converged
            );
        }
        AnalysisMode::TimeAccurate { .. } | AnalysisMode::Rotor { .. } => {
            for _ in 0..num_steps {
                let movement = solver.advance_time_step();
                info!("t = {:.4}, wake movement {:.3e}", solver.time, movement);
            }
        }
        AnalysisMode::Adjoint => {
            let (num_equations, residual) = solver.assemble_wake_residuals(0);
            info!("adjoint: {num_equations} wake equations, largest residual {residual:.3e}");
        }
    }

    // downwash on the trailing edge, one line per kutta node
    for (k, tv) in solver.vortices.iter().enumerate() {
        let te = solver.grid.kutta_node(k).trailing_edge;
        let q = solver.velocity_at(&te);
        println!(
            "kutta node {:3}  s/b = {:6.3}  gamma = {:9.5}  q = ({:9.5}, {:9.5}, {:9.5})",
            k,
            tv.s_over_b(),
            tv.gamma(),
            q.x,
            q.y,
            q.z
        );
    }

    if let Some(path) = args.output {
        let mut writer = BufWriter::new(File::create(&path)?);
        solver.grid.write_to_file(&mut writer)?;
        for tv in &solver.vortices {
            tv.write_to_file(&mut writer)?;
        }
        info!("wrote {} wake records to {}", solver.vortices.len(), path.display());
    }

    Ok(())
}
