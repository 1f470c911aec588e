use anyhow::{Context, Result};
use clap::Parser;
use rawscope::{summarize, DecodeError, RecordReader};
use std::io::{stdout, BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Dump records from raw_CH<n>.bin channel files")]
struct Args {
    /// Channel files to read
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Only print the per-file summary
    #[arg(short, long)]
    summary: bool,
    /// Also print up to this many samples of each record
    #[arg(long, default_value_t = 0)]
    samples: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut out = BufWriter::new(stdout().lock());

    for path in &args.files {
        writeln!(out, "== {}", path.display())?;
        if !args.summary {
            let reader = RecordReader::open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            for item in reader {
                match item {
                    Ok(record) => {
                        writeln!(
                            out,
                            "EventNumber: {}, Timestamp: {}, NumSamples: {}, TimeResolution: {}",
                            record.trigger_id,
                            record.timestamp,
                            record.sample_count(),
                            record.time_resolution
                        )?;
                        if args.samples > 0 {
                            let shown = &record.samples[..record.samples.len().min(args.samples)];
                            writeln!(out, "  {shown:?}")?;
                        }
                    }
                    Err(e @ DecodeError::Truncated { .. }) => {
                        out.flush()?;
                        eprintln!("warning: {}: {e}", path.display());
                    }
                    Err(e) => {
                        return Err(e).with_context(|| format!("reading {}", path.display()))
                    }
                }
            }
        }

        let summary =
            summarize(path).with_context(|| format!("reading {}", path.display()))?;
        writeln!(out, "Records: {}  Samples: {}", summary.records, summary.samples)?;
        if let (Some(first), Some(last)) = (summary.first_trigger, summary.last_trigger) {
            writeln!(out, "Triggers: {first}..={last}")?;
        }
        if let Some(secs) = summary.duration_secs() {
            writeln!(out, "Span: {secs:.6} s")?;
        }
        if let Some(offset) = summary.truncated_at {
            writeln!(out, "Incomplete trailing record at byte {offset}")?;
        }
    }
    out.flush()?;
    Ok(())
}
