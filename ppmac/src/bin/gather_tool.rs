//! Command-line gather tool for Power PMAC controllers.
//!
//! Subcommands:
//! - `gather`: capture a set of addresses for a duration or sample count
//! - `run`: run a motion program script and gather while it executes
//! - `settings`: show the gather configuration stored on the controller
//! - `tune`: run a tuning executable and fetch its gathered data
//!
//! Pass `--simulate` to talk to an in-memory controller instead of hardware.
//! Ctrl-C stops an acquisition cleanly; the data captured so far is still
//! retrieved. A second Ctrl-C exits immediately.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ppmac::comm::sim::SimulatedPmac;
use ppmac::comm::telnet::{
    ConnectOptions, TelnetPmac, DEFAULT_HOST, DEFAULT_PASSWORD, DEFAULT_PORT, DEFAULT_USER,
};
use ppmac::comm::PmacChannel;
use ppmac::gather::{
    read_device_settings, run_tune_program, tune_columns, Acquisition, AcquisitionController,
    CancelToken, GatherConfig, GatherPlan, ParsedDataset, ProgramRequest, ProgramRunner,
    ServoClock, SettingValue, TUNE_RESULT_PATH,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Power PMAC gather tool
#[derive(Parser, Debug)]
#[command(name = "gather_tool")]
#[command(about = "Gather data from a Delta Tau Power PMAC")]
#[command(version)]
struct Args {
    /// Controller hostname or IP address
    #[arg(long, global = true, env = "PPMAC_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Telnet port
    #[arg(long, global = true, env = "PPMAC_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Login user
    #[arg(long, global = true, env = "PPMAC_USER", default_value = DEFAULT_USER)]
    user: String,

    /// Login password
    #[arg(long, global = true, env = "PPMAC_PASS", default_value = DEFAULT_PASSWORD, hide_env_values = true)]
    password: String,

    /// Use a simulated controller instead of connecting
    #[arg(long, global = true)]
    simulate: bool,

    /// JSON file with gather paths and timing overrides
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Gather addresses for a fixed duration or sample count
    Gather {
        /// Addresses to gather, e.g. Sys.ServoCount.a Motor[3].Pos.a
        #[arg(required = true)]
        addresses: Vec<String>,

        /// Duration in seconds
        #[arg(short, long, default_value = "1.0", conflicts_with = "samples")]
        duration: f64,

        /// Sample count (overrides --duration)
        #[arg(short, long)]
        samples: Option<u64>,

        /// Servo cycles per sample
        #[arg(short, long, default_value = "1")]
        period: u32,

        /// Write the results to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Column delimiter for --output
        #[arg(long, default_value = "\t")]
        delimiter: String,
    },

    /// Run a motion program script and gather while it executes
    Run {
        /// Script file sent line by line to the controller
        script: PathBuf,

        /// Addresses to gather (the servo counter is always included)
        addresses: Vec<String>,

        /// Coordinate system
        #[arg(long, default_value = "0")]
        coord: u32,

        /// Program number
        #[arg(long, default_value = "999")]
        program: u32,

        /// Servo cycles per sample
        #[arg(short, long, default_value = "1")]
        period: u32,

        /// Buffer limit in samples
        #[arg(short, long)]
        samples: Option<u64>,

        /// Wait on Coord[n].ProgActive instead of gather.enable
        #[arg(long)]
        check_active: bool,

        /// Write the results to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the gather configuration stored on the controller
    Settings {
        /// Settings file on the controller (defaults to the configured path)
        #[arg(long)]
        path: Option<String>,
    },

    /// Run a tuning executable and fetch its gathered data
    Tune {
        /// Full command line of the tuning tool
        command: String,

        /// Controller file the tool's data is uploaded to
        #[arg(long, default_value = TUNE_RESULT_PATH)]
        result_path: String,

        /// Column names of the gathered data
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,

        /// Seconds to wait for the tool to finish
        #[arg(short, long, default_value = "50")]
        timeout: f64,

        /// Write the results to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => GatherConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => GatherConfig::default(),
    };

    let cancel = CancelToken::new();
    install_ctrl_c(cancel.clone())?;

    if args.simulate {
        info!("Using simulated controller");
        let mut pmac = SimulatedPmac::new();
        return dispatch(&mut pmac, args.command, &config, &cancel);
    }

    info!("Connecting to Power PMAC at {}:{}...", args.host, args.port);
    let mut pmac = TelnetPmac::connect(&ConnectOptions {
        host: args.host,
        port: args.port,
        user: args.user,
        password: args.password,
        ..ConnectOptions::default()
    })?;
    if let Command::Tune { timeout, .. } = &args.command {
        pmac.set_timeout(seconds(*timeout)?)?;
    }
    dispatch(&mut pmac, args.command, &config, &cancel)
}

/// Cancel `token` on the first Ctrl-C, exit on the second.
fn install_ctrl_c(token: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::spawn(move || {
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("Received Ctrl+C, stopping acquisition...");
            token.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received second Ctrl+C, exiting");
                std::process::exit(130);
            }
        });
    });
    Ok(())
}

fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid duration: {value}"))
}

fn dispatch<C: PmacChannel>(
    pmac: &mut C,
    command: Command,
    config: &GatherConfig,
    cancel: &CancelToken,
) -> Result<()> {
    match command {
        Command::Gather {
            addresses,
            duration,
            samples,
            period,
            output,
            delimiter,
        } => cmd_gather(
            pmac,
            config,
            cancel,
            addresses,
            duration,
            samples,
            period,
            output.as_deref().map(|p| (p, delimiter.as_str())),
        ),
        Command::Run {
            script,
            addresses,
            coord,
            program,
            period,
            samples,
            check_active,
            output,
        } => {
            let text = std::fs::read_to_string(&script)
                .with_context(|| format!("Failed to read script {}", script.display()))?;
            let mut request = ProgramRequest::new(&text, coord, program, addresses).period(period);
            if let Some(samples) = samples {
                request = request.samples(samples);
            }
            cmd_run(pmac, config, cancel, &request, check_active, output.as_deref())
        }
        Command::Settings { path } => {
            cmd_settings(pmac, path.as_deref().unwrap_or(&config.settings_path))
        }
        Command::Tune {
            command,
            result_path,
            columns,
            timeout,
            output,
        } => cmd_tune(
            pmac,
            config,
            &command,
            &result_path,
            columns.unwrap_or_else(tune_columns),
            seconds(timeout)?,
            output.as_deref(),
        ),
    }
}

// ==================== Gather Command ====================

#[allow(clippy::too_many_arguments)]
fn cmd_gather<C: PmacChannel>(
    pmac: &mut C,
    config: &GatherConfig,
    cancel: &CancelToken,
    addresses: Vec<String>,
    duration: f64,
    samples: Option<u64>,
    period: u32,
    output: Option<(&Path, &str)>,
) -> Result<()> {
    let clock = ServoClock::from_device(pmac)?;
    let plan = match samples {
        Some(samples) => GatherPlan::from_samples(&clock, addresses, period, samples)?,
        None => GatherPlan::from_duration(&clock, addresses, period, duration)?,
    };
    info!(
        "Gathering {} samples ({:.3} s) of {} addresses",
        plan.samples,
        plan.duration,
        plan.addresses.len()
    );

    let acquisition = AcquisitionController::new(pmac, clock, config.clone()).run(plan, cancel)?;
    report(&acquisition);

    match output {
        Some((path, delimiter)) => save(&acquisition.data, path, delimiter),
        None => {
            print_rows(&acquisition.data);
            Ok(())
        }
    }
}

// ==================== Run Command ====================

fn cmd_run<C: PmacChannel>(
    pmac: &mut C,
    config: &GatherConfig,
    cancel: &CancelToken,
    request: &ProgramRequest,
    check_active: bool,
    output: Option<&Path>,
) -> Result<()> {
    let clock = ServoClock::from_device(pmac)?;
    info!(
        "Running program {} in coordinate system {}",
        request.program, request.coord_sys
    );

    let acquisition = ProgramRunner::new(pmac, clock, config.clone())
        .check_active(check_active)
        .on_cancel(|reason| {
            warn!(
                "Stopped program {} after {} samples",
                reason.program, reason.samples
            )
        })
        .run(request, cancel)?;
    report(&acquisition);
    for line in &acquisition.device_errors {
        println!("{line}");
    }

    match output {
        Some(path) => save(&acquisition.data, path, "\t"),
        None => {
            print_rows(&acquisition.data);
            Ok(())
        }
    }
}

// ==================== Settings Command ====================

fn cmd_settings<C: PmacChannel>(pmac: &mut C, path: &str) -> Result<()> {
    let settings = read_device_settings(pmac, path)?;
    if settings.is_empty() {
        bail!("No gather settings found in {path}");
    }

    for (key, value) in settings.iter() {
        match value {
            SettingValue::Scalar(v) => println!("{key} = {v}"),
            SettingValue::Indexed(map) => {
                for (index, v) in map {
                    println!("{key}[{index}] = {v}");
                }
            }
            SettingValue::List(items) => {
                for (index, v) in items.iter().enumerate() {
                    println!("{key}[{index}] = {v}");
                }
            }
        }
    }
    Ok(())
}

// ==================== Tune Command ====================

fn cmd_tune<C: PmacChannel>(
    pmac: &mut C,
    config: &GatherConfig,
    command: &str,
    result_path: &str,
    columns: Vec<String>,
    timeout: Duration,
    output: Option<&Path>,
) -> Result<()> {
    let clock = ServoClock::from_device(pmac)?;
    let data = run_tune_program(pmac, command, result_path, &columns, timeout, config, &clock)?;
    info!("Tune gathered {} rows", data.len());

    match output {
        Some(path) => save(&data, path, "\t"),
        None => {
            print_rows(&data);
            Ok(())
        }
    }
}

// ==================== Output ====================

fn report(acquisition: &Acquisition) {
    if acquisition.truncated {
        warn!(
            "Plan truncated to {} samples ({:.3} s) to fit the gather buffer",
            acquisition.plan.samples, acquisition.plan.duration
        );
    }
    info!(
        "{}: {} rows, {} malformed rows skipped",
        acquisition.outcome,
        acquisition.data.len(),
        acquisition.data.skipped()
    );
}

fn save(data: &ParsedDataset, path: &Path, delimiter: &str) -> Result<()> {
    data.write_delimited(path, delimiter)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Saved {} rows to {}", data.len(), path.display());
    Ok(())
}

fn print_rows(data: &ParsedDataset) {
    println!("{}", data.columns().join("\t"));
    for row in data.rows() {
        let fields: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", fields.join("\t"));
    }
}
