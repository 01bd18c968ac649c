use alazar_reduce::{
    sweep::{call, do_experiment, measure, sweep, Dataset},
    Acquisition, AcquisitionController, AcquisitionData, Conf, ControllerKind, Digitizer,
    SimulatedDigitizer,
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{cell::RefCell, fs::File, path::PathBuf, rc::Rc};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Parser)]
#[command(
    name = "alazar-reduce",
    version,
    about = "Acquire and reduce digitizer buffers from a simulated card"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML configuration file
    #[arg(short, long, default_value = "acquisition.toml", global = true)]
    config: PathBuf,

    /// Controller variant, overrides the config file
    #[arg(long, global = true)]
    variant: Option<ControllerKind>,

    /// Also write the log to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run one acquisition and print a summary (default)
    Acquire,
    /// Step the demodulation frequency and record the mean IQ amplitude
    Sweep {
        /// Frequencies in Hz, overrides the config file
        #[arg(long, num_args = 1..)]
        demod_frqs: Vec<f64>,
    },
}

fn init_logging(verbose: u8, log_file: Option<&PathBuf>) -> Result<()> {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, config, file));
    }
    CombinedLogger::init(loggers).context("failed to install logger")
}

fn summarize(acq: &Acquisition) {
    info!("dims {:?}, shape {:?}", acq.dims, acq.shape());
    match &acq.data {
        AcquisitionData::Real(data) => {
            let mean = data.mean().unwrap_or(f64::NAN);
            let peak = data.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            info!("mean {mean:.6}, peak {peak:.6}");
        }
        AcquisitionData::Complex(data) => {
            info!("mean |IQ| {:.6}", mean_amplitude(acq));
            if let Some(first) = data.iter().next() {
                debug!("first IQ value {first}");
            }
        }
    }
    if let (Some(mean), Some(max)) = (acq.handling_times.mean(), acq.handling_times.max()) {
        info!(
            "{} buffers handled, {:?} mean, {:?} max",
            acq.buffers_received, mean, max
        );
    }
}

fn mean_amplitude(acq: &Acquisition) -> f64 {
    match &acq.data {
        AcquisitionData::Complex(data) if !data.is_empty() => {
            data.iter().map(|v| v.norm()).sum::<f64>() / data.len() as f64
        }
        _ => f64::NAN,
    }
}

fn run_sweep(
    conf: &Conf,
    controller: AcquisitionController,
    digitizer: SimulatedDigitizer,
    demod_frqs: Vec<f64>,
) -> Result<()> {
    if !controller.kind().demodulates() {
        return Err(anyhow!(
            "sweeping the demodulation frequency needs a demodulating controller, not {}",
            controller.kind()
        ));
    }
    let points = if demod_frqs.is_empty() {
        conf.sweep.demod_frqs.clone()
    } else {
        demod_frqs
    };
    if points.is_empty() {
        warn!("no demodulation frequencies to sweep");
        return Ok(());
    }

    let controller = Rc::new(RefCell::new(controller));
    let digitizer = Rc::new(RefCell::new(digitizer));
    let last: Rc<RefCell<Option<Acquisition>>> = Rc::new(RefCell::new(None));

    let set_controller = Rc::clone(&controller);
    let acquire_controller = Rc::clone(&controller);
    let acquire_digitizer = Rc::clone(&digitizer);
    let acquired = Rc::clone(&last);
    let measured = Rc::clone(&last);

    let mut experiment = sweep(
        "demod_frq",
        move |frq| {
            set_controller.borrow_mut().set_demod_frq(Some(frq));
            Ok(())
        },
        points,
    )
    .nest(vec![
        call(move || {
            let acq = acquire_controller
                .borrow_mut()
                .do_acquisition(&mut *acquire_digitizer.borrow_mut())?;
            *acquired.borrow_mut() = Some(acq);
            Ok(())
        }),
        measure("iq_amplitude", move || {
            measured
                .borrow()
                .as_ref()
                .map(mean_amplitude)
                .ok_or_else(|| anyhow!("no acquisition to measure"))
        }),
    ]);

    let tone = conf.tone();
    let dataset = do_experiment(
        &mut experiment,
        vec![Box::new(move || {
            info!(
                "sweeping against a {} Hz tone of amplitude {}",
                tone.frequency, tone.amplitude
            );
            Ok(())
        })],
        vec![],
        Dataset::new(),
    )?;

    let data = dataset.get("demod_frq,iq_amplitude")?;
    for (frq, amplitude) in data["demod_frq"].iter().zip(&data["iq_amplitude"]) {
        info!("{frq:>14.1} Hz  |IQ| {amplitude:.6}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_ref())?;

    let started = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("failed to format start time")?;
    info!("alazar-reduce {} started {started}", env!("CARGO_PKG_VERSION"));

    let mut conf = Conf::load(&cli.config)?;
    if let Some(variant) = cli.variant {
        conf.controller.variant = variant;
    }

    let mut digitizer = SimulatedDigitizer::new(conf.board_setup(), conf.tone())?;
    let device = digitizer.device_info();
    info!(
        "{} {} ({}-bit, {} S/s)",
        device.model,
        device.serial,
        device.bits_per_sample,
        digitizer.sample_rate()
    );

    let mut controller = conf.controller(device)?;
    controller.update_acquisition_kwargs(&digitizer, Default::default())?;
    info!(
        "{} controller, dims {:?}",
        controller.kind(),
        controller.data_dims()
    );

    match cli.command.unwrap_or(Command::Acquire) {
        Command::Acquire => {
            let acq = controller.do_acquisition(&mut digitizer)?;
            summarize(&acq);
        }
        Command::Sweep { demod_frqs } => run_sweep(&conf, controller, digitizer, demod_frqs)?,
    }
    Ok(())
}
