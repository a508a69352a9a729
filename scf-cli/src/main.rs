use std::{fs::File, path::PathBuf, time::Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use scf_core::{
    checkpoint::{DirectoryStore, MemoryStore, Persistence},
    config::{DcftOptions, ScfOptions},
    dcft::run_dcft,
    globals::Globals,
    hf::{run_scf, SolverContext},
    report::{LogObserver, RecordingObserver, Tee},
    system::IntegralSystem,
    testing,
};
use serde::de::DeserializeOwned;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hartree-Fock on an integral system
    #[command(name = "scf")]
    Scf {
        #[command(flatten)]
        common: Common,
    },
    /// Density cumulant functional theory on top of a Hartree-Fock reference
    #[command(name = "dcft")]
    Dcft {
        #[command(flatten)]
        common: Common,
    },
    /// Writes a model integral system to a file
    #[command(name = "model")]
    Model {
        /// Functions per irrep
        #[arg(long, value_delimiter = ',', default_values_t = [4, 2])]
        nsopi: Vec<usize>,
        #[arg(long, default_value_t = 2)]
        nalpha: usize,
        #[arg(long, default_value_t = 1)]
        nbeta: usize,
        #[arg(long, short)]
        output: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct Common {
    /// A path to the integral system in json format
    #[arg(long, short)]
    system: PathBuf,
    /// Solver options in json format, missing keys take their defaults
    #[arg(long, short)]
    options: Option<PathBuf>,
    /// Directory for checkpoint files, kept in memory if not given
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Writes every iteration record to this file
    #[arg(long)]
    history: Option<PathBuf>,
}

fn load_options<T: DeserializeOwned + Default>(path: Option<&PathBuf>) -> anyhow::Result<T> {
    match path {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            Ok(serde_json::from_reader(file).with_context(|| format!("parsing {}", path.display()))?)
        }
        None => Ok(T::default()),
    }
}

/// Owns everything a solver reports to for one invocation.
struct Session {
    store: Box<dyn Persistence>,
    recorder: RecordingObserver,
    globals: Globals,
}

impl Session {
    fn new(common: &Common) -> anyhow::Result<Self> {
        let store: Box<dyn Persistence> = match &common.checkpoint {
            Some(dir) => Box::new(DirectoryStore::new(dir)?),
            None => Box::new(MemoryStore::new()),
        };
        Ok(Self {
            store,
            recorder: RecordingObserver::new(),
            globals: Globals::new(),
        })
    }

    fn run<T>(
        &mut self,
        solve: impl FnOnce(&mut SolverContext<'_>) -> scf_core::error::Result<T>,
    ) -> anyhow::Result<T> {
        let mut log = LogObserver;
        let mut observer = Tee(&mut log, &mut self.recorder);
        let mut ctx = SolverContext {
            store: self.store.as_mut(),
            observer: &mut observer,
            globals: &mut self.globals,
        };
        Ok(solve(&mut ctx)?)
    }

    fn finish(&self, history: Option<&PathBuf>) -> anyhow::Result<()> {
        if let Some(path) = history {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            serde_json::to_writer_pretty(file, &self.recorder.records)?;
        }
        for (key, value) in self.globals.iter() {
            println!("{key:>28} = {value:20.12}");
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let args: Args = Args::parse();

    match args.command {
        Command::Scf { common } => {
            let system = IntegralSystem::load(&common.system)?;
            let options: ScfOptions = load_options(common.options.as_ref())?;
            let mut session = Session::new(&common)?;

            let start = Instant::now();
            let output = session.run(|ctx| run_scf(&system, options, ctx))?;
            if !output.converged {
                bail!("SCF did not converge after {} iterations", output.iterations);
            }
            println!(
                "{:?} converged after {} iterations and {:0.2?}",
                output.reference,
                output.iterations,
                start.elapsed()
            );
            println!("electronic energy: {:.10}", output.electronic_energy());
            println!("nuclear repulsion energy: {:.10}", output.nuclear_repulsion);
            println!("total energy: {:.10}", output.total_energy);
            if let Some((s2, expected)) = output.spin_contamination {
                println!("<S^2> = {s2:.6}, expected {expected:.6}");
            }
            println!("orbital energies alpha: {:.4?}", output.orbitals.alpha.occupied_energies());
            println!("orbital energies beta:  {:.4?}", output.orbitals.beta.occupied_energies());
            session.finish(common.history.as_ref())?;
        }

        Command::Dcft { common } => {
            let system = IntegralSystem::load(&common.system)?;
            let options: DcftOptions = load_options(common.options.as_ref())?;
            let mut session = Session::new(&common)?;

            let start = Instant::now();
            let output = session.run(|ctx| run_dcft(&system, options, ctx))?;
            println!(
                "DCFT {} after {} macro iterations and {:0.2?}",
                if output.converged { "converged" } else { "stopped" },
                output.macro_iterations,
                start.elapsed()
            );
            println!("reference energy: {:.10}", output.reference.total_energy);
            println!("scf energy: {:.10}", output.scf_energy);
            println!("lambda energy: {:.10}", output.lambda_energy);
            println!("total energy: {:.10}", output.total_energy);
            if let Some(eigenvalues) = &output.stability {
                println!("jacobian eigenvalues: {eigenvalues:.6?}");
            }
            session.finish(common.history.as_ref())?;
        }

        Command::Model {
            nsopi,
            nalpha,
            nbeta,
            output,
        } => {
            let config = testing::model_config(&nsopi, nalpha, nbeta);
            testing::save(&config, &output).map_err(|e| anyhow::anyhow!("{e}"))?;
            log::info!("wrote a model system with {nsopi:?} functions to {}", output.display());
        }
    }

    Ok(())
}
