use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use rawscope::*;
use simplelog::{
    ColorChoice, CombinedLogger, Config as LogConfig, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{
    fs::File,
    io::{stdin, BufRead},
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use time::{macros::format_description, OffsetDateTime};

#[derive(Parser, Debug)]
#[command(version, about = "Record triggered waveforms into per-channel raw files")]
struct Args {
    /// TOML settings file; defaults apply when it is missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    /// Directory for the raw_CH<n>.bin files
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Stop after this many triggers
    #[arg(short = 'n', long)]
    max_triggers: Option<u64>,
    /// Plain log output instead of the status screen
    #[arg(long)]
    headless: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut conf = Conf::load(&args.config)?;
    if let Some(dir) = &args.output_dir {
        conf.run_settings.output_dir = dir.to_string_lossy().into_owned();
    }
    if args.max_triggers.is_some() {
        conf.run_settings.max_triggers = args.max_triggers;
    }

    let log_file = init_logging(&conf, args.headless)?;
    info!("logging to {}", log_file.display());
    for (key, value) in conf.describe() {
        info!("{key} = {value}");
    }

    let sim = conf.simulated_settings()?;
    let run_config = conf.run_config(sim.n_channels, sim.adc_bits)?;
    let source = SimulatedSource::new(sim);

    let summary = if args.headless {
        let handle = Pipeline::start(source, run_config, Arc::new(LogObserver))?;
        run_headless(handle)?
    } else {
        let (tx, rx) = crossbeam_channel::bounded(4096);
        let observer = Fanout::new()
            .with(LogObserver)
            .with(ChannelObserver::new(tx));
        let handle = Pipeline::start(source, run_config, Arc::new(observer))?;

        let mut status = Status::new(
            handle.output_dir().to_path_buf(),
            handle.source_parameters().to_vec(),
            conf.describe(),
        );
        let mut terminal = ratatui::init();
        let result = status.run(&mut terminal, &handle, &rx);
        ratatui::restore();
        match result {
            Ok(exit) => info!("status screen closed: {exit:?}"),
            Err(e) => warn!("status screen failed: {e:#}"),
        }
        handle.request_stop()?
    };

    println!(
        "Triggers: {}  Frames written: {}  Bytes written: {}  Dropped: {}  Trigger gaps: {}",
        summary.producer.triggers,
        summary.consumer.frames,
        summary.consumer.bytes,
        summary.producer.dropped,
        summary.producer.gaps,
    );
    if !summary.is_success() {
        bail!("run failed: {}", summary.errors().join("; "));
    }
    Ok(())
}

/// Log to a timestamped file, and to the terminal when no status screen owns it.
fn init_logging(conf: &Conf, headless: bool) -> Result<PathBuf> {
    let dir = PathBuf::from(&conf.run_settings.log_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;

    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]_[hour][minute][second]"))?;
    let path = dir.join(format!("rawscope_{stamp}.log"));
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![WriteLogger::new(
        LevelFilter::Debug,
        LogConfig::default(),
        file,
    )];
    if headless {
        loggers.push(TermLogger::new(
            LevelFilter::Info,
            LogConfig::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(path)
}

fn run_headless(handle: RunHandle) -> Result<RunSummary> {
    let stop = handle.stop_flag();
    let parameters = handle.source_parameters().to_vec();
    println!("Commands: [q] stop acquisition  [s] print source settings");
    // Reads block, so the listener is left behind once the run ends.
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in stdin().lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "q" => {
                        stop.set();
                        break;
                    }
                    "s" => {
                        for (key, value) in &parameters {
                            info!("{key}: {value}");
                        }
                    }
                    _ => {}
                }
            }
        })?;

    let mut last_report = Instant::now();
    while !handle.is_finished() && !handle.status().stop_requested {
        thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() >= Duration::from_secs(1) {
            let s = handle.status();
            info!(
                "triggers {} written {} queue {} dropped {}",
                s.triggers, s.frames_written, s.queue_len, s.dropped
            );
            last_report = Instant::now();
        }
    }
    Ok(handle.request_stop()?)
}
