use clap::{Parser, Subcommand};
use colored::Colorize;
use crossbeam::channel::{unbounded, RecvTimeoutError};
use log::{error, info};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use neurolayer::config::{load_config, save_config, Config};
use neurolayer::local::process_file;
use neurolayer::local::simulator::{SimulatedRecorder, SimulatorSettings};
use neurolayer::session::{AcquisitionControl, Presentation};
use neurolayer::utils::log::{init_logger, log_csv, log_with_header};
use neurolayer::{Engine, Result};

#[derive(Parser)]
#[command(name = "neurolayer", about = "Event-triggered snapshots of a growing probe recording")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record from the built-in simulator and snapshot its TTL events live
    Simulate {
        #[arg(long)]
        folder: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 20)]
        seconds: u64,
        #[arg(long, default_value_t = 0.1)]
        event_probability: f64,
    },
    /// Snapshot the events listed in a csv against an existing recording
    Process {
        #[arg(long)]
        recording: PathBuf,
        #[arg(long)]
        events: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Write the default configuration
    Config {
        #[arg(long)]
        output: PathBuf,
    },
}

struct ConsolePresentation {
    log_dir: PathBuf,
    fs: f64,
    must_stop: AtomicBool,
}

impl Presentation for ConsolePresentation {
    fn on_sources_updated(&self, x_axis: &[f64], matrix: &Array2<f64>) {
        let peak = matrix.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        println!(
            "{} {} channels x {} samples ({:.0} to {:.0} ms), peak {:.1}",
            "view".cyan(),
            matrix.nrows(),
            matrix.ncols(),
            x_axis.first().copied().unwrap_or(0.0),
            x_axis.last().copied().unwrap_or(0.0),
            peak
        );
    }

    fn on_new_event_option(&self, label: &str) {
        println!("{} {}", "new option".green(), label);
        if let Ok(sample_number) = label.parse::<u64>() {
            let row = [
                sample_number.to_string(),
                format!("{:.4}", sample_number as f64 / self.fs),
            ];
            if let Err(e) = log_csv(&self.log_dir, "events.csv", &["sample_number", "seconds"], &row) {
                error!("Failed to write event log: {}", e);
            }
        }
    }

    fn on_acquisition_must_stop(&self) {
        println!("{}", "Event cap reached, stopping acquisition".red());
        self.must_stop.store(true, Ordering::SeqCst);
    }
}

fn read_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => Ok(Config::default()),
    }
}

fn simulate(config: Config, folder: &Path, seconds: u64, event_probability: f64) -> Result<()> {
    let (sender, receiver) = unbounded();
    let recorder = Arc::new(SimulatedRecorder::new(
        SimulatorSettings {
            geometry: config.stream.probe,
            sample_rate: config.stream.sample_rate,
            ttl_line: config.events.enabled_lines.first().copied().unwrap_or(0),
            event_probability,
        },
        sender,
    ));
    let presentation = Arc::new(ConsolePresentation {
        log_dir: folder.join("logs"),
        fs: config.stream.sample_rate,
        must_stop: AtomicBool::new(false),
    });

    let control: Arc<dyn AcquisitionControl> = recorder.clone();
    let engine = Engine::new(&config, presentation.clone(), Some(control))?;
    let session = engine.start_session(folder)?;
    println!(
        "{} {}",
        "Recording to".bold(),
        session.data_path().display()
    );
    log_with_header(
        &presentation.log_dir,
        "session.log",
        "Session",
        &format!("{}\n{:?}", session.data_path().display(), config.filter),
    )?;

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline && !presentation.must_stop.load(Ordering::SeqCst) {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(notification) => engine.handle_notification(&notification)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    engine.stop_session()?;
    engine.flush()?;
    info!(
        "Recorder is {}; {} events, {} snapshots",
        recorder.status()?,
        engine.events().len(),
        engine.snapshots().len()
    );
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Simulate {
            folder,
            config,
            seconds,
            event_probability,
        } => simulate(read_config(config.as_deref())?, &folder, seconds, event_probability),
        Command::Process {
            recording,
            events,
            output,
            config,
        } => {
            let config = read_config(config.as_deref())?;
            let summary = process_file::run(&config, &recording, &events, &output)?;
            println!(
                "{} {} events, {} snapshots, views: {}",
                "Processed".green(),
                summary.events,
                summary.snapshots,
                summary.views.join(", ")
            );
            Ok(())
        }
        Command::Config { output } => save_config(&Config::default(), &output),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);
    if let Err(e) = run(cli) {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
