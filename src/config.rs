use crate::{
    channel_enabled, parse_channel_mask, Calibration, OverflowPolicy, QueueConfig, RunConfig,
    SimulatedSettings,
};
use anyhow::{anyhow, Context, Result};
use confique::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub acq_settings: AcquisitionSettings,
    #[config(nested)]
    pub default_channel: ChannelSettings,
    /// Per-channel overrides keyed `CH<n>`; missing keys fall back to `default_channel`.
    pub channels: Option<HashMap<String, ChannelOverride>>,
    #[config(nested)]
    pub simulator: SimulatorSettings,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = "data")]
    pub output_dir: String,
    #[config(default = "logs")]
    pub log_dir: String,
    /// Maximum frames waiting between acquisition and storage; 0 = unbounded.
    #[config(default = 256)]
    pub queue_capacity: usize,
    /// `block` (default), `drop_oldest` or `fail`.
    pub overflow_policy: Option<OverflowPolicy>,
    #[config(default = 10)]
    pub flush_interval: u32,
    /// Device clock tick in nanoseconds.
    #[config(default = 8)]
    pub time_resolution_ns: u64,
    pub max_triggers: Option<u64>,
}

#[derive(Config, Debug, Clone)]
pub struct AcquisitionSettings {
    /// Record length in ns.
    #[config(default = 300000)]
    pub record_length: u64,
    /// Pre-trigger length in ns.
    #[config(default = 16336)]
    pub pretrigger: u64,
    #[config(default = "SwTrg")]
    pub acq_trigger_source: String,
    #[config(default = "Normal")]
    pub trigger_mode: String,
    #[config(default = "0x7")]
    pub selected_channels: String,
    #[config(default = "0x0")]
    pub trigger_mask: String,
}

#[derive(Config, Debug, Clone)]
pub struct ChannelSettings {
    /// Baseline position, percent of the ADC range.
    #[config(default = 50.0)]
    pub dc_offset: f64,
    #[config(default = 100)]
    pub threshold: i64,
    /// Full-scale input range in volts; unset maps the ADC range onto [-1, 1].
    pub input_range: Option<f64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ChannelOverride {
    pub dc_offset: Option<f64>,
    pub threshold: Option<i64>,
    pub input_range: Option<f64>,
}

#[derive(Config, Debug, Clone)]
pub struct SimulatorSettings {
    #[config(default = 4)]
    pub n_channels: usize,
    #[config(default = 14)]
    pub adc_bits: u32,
    #[config(default = 10)]
    pub trigger_period_ms: u64,
    #[config(default = 2000)]
    pub pulse_height: u16,
    #[config(default = 8)]
    pub noise: u16,
    #[config(default = 0)]
    pub seed: u64,
}

impl Conf {
    /// Load settings from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        Conf::builder()
            .file(path)
            .load()
            .with_context(|| format!("loading configuration from {}", path.display()))
    }

    /// Effective settings for one channel.
    pub fn channel_settings(&self, channel: usize) -> ChannelSettings {
        let mut settings = self.default_channel.clone();
        let key = format!("CH{channel}");
        if let Some(o) = self.channels.as_ref().and_then(|m| m.get(&key)) {
            if let Some(v) = o.dc_offset {
                settings.dc_offset = v;
            }
            if let Some(v) = o.threshold {
                settings.threshold = v;
            }
            if o.input_range.is_some() {
                settings.input_range = o.input_range;
            }
        }
        settings
    }

    pub fn channel_mask(&self) -> Result<u64> {
        parse_channel_mask(&self.acq_settings.selected_channels).with_context(|| {
            format!(
                "selected_channels '{}' is not a hex mask",
                self.acq_settings.selected_channels
            )
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        let policy = self.run_settings.overflow_policy.unwrap_or_default();
        match self.run_settings.queue_capacity {
            0 => QueueConfig::unbounded(),
            cap => QueueConfig::bounded(cap, policy),
        }
    }

    /// Samples per record, from the record length in ns and the tick size.
    pub fn record_samples(&self) -> usize {
        let tick = self.run_settings.time_resolution_ns.max(1);
        (self.acq_settings.record_length / tick) as usize
    }

    /// Settings for the software digitizer.
    pub fn simulated_settings(&self) -> Result<SimulatedSettings> {
        let sim = &self.simulator;
        let tick = self.run_settings.time_resolution_ns.max(1);
        let pretrigger = (self.acq_settings.pretrigger / tick) as usize;
        let record_len = self.record_samples();
        if pretrigger > record_len {
            return Err(anyhow!(
                "pretrigger ({} ns) is longer than the record ({} ns)",
                self.acq_settings.pretrigger,
                self.acq_settings.record_length
            ));
        }
        Ok(SimulatedSettings {
            n_channels: sim.n_channels,
            record_len,
            pretrigger,
            adc_bits: sim.adc_bits,
            channel_mask: self.channel_mask()?,
            dc_offsets: (0..sim.n_channels)
                .map(|ch| self.channel_settings(ch).dc_offset)
                .collect(),
            pulse_height: sim.pulse_height,
            noise: sim.noise,
            trigger_period: Duration::from_millis(sim.trigger_period_ms),
            // Ticks elapsed between software triggers.
            ticks_per_trigger: sim.trigger_period_ms * 1_000_000 / tick,
            max_triggers: self.run_settings.max_triggers,
            seed: sim.seed,
        })
    }

    /// Pipeline settings for a source with `n_channels` channels of `adc_bits` resolution.
    pub fn run_config(&self, n_channels: usize, adc_bits: u32) -> Result<RunConfig> {
        let calibrations = (0..n_channels)
            .map(|ch| match self.channel_settings(ch).input_range {
                Some(range) => Calibration::with_range(adc_bits, range),
                None => Calibration::from_bits(adc_bits),
            })
            .collect::<Result<Vec<_>, _>>()
            .context("building channel calibrations")?;
        Ok(RunConfig {
            output_dir: PathBuf::from(&self.run_settings.output_dir),
            channel_count: n_channels,
            calibrations,
            time_resolution_ns: self.run_settings.time_resolution_ns,
            queue: self.queue_config(),
            flush_interval: self.run_settings.flush_interval,
        })
    }

    /// Settings worth recording at the start of a run.
    pub fn describe(&self) -> Vec<(String, String)> {
        let a = &self.acq_settings;
        let mut out = vec![
            ("record_length".to_string(), a.record_length.to_string()),
            ("pretrigger".to_string(), a.pretrigger.to_string()),
            ("acq_trigger_source".to_string(), a.acq_trigger_source.clone()),
            ("trigger_mode".to_string(), a.trigger_mode.clone()),
            ("selected_channels".to_string(), a.selected_channels.clone()),
            ("trigger_mask".to_string(), a.trigger_mask.clone()),
        ];
        let mask = self.channel_mask().unwrap_or(0);
        for ch in 0..self.simulator.n_channels {
            let c = self.channel_settings(ch);
            out.push((
                format!("CH{ch}"),
                format!(
                    "dc_offset={} threshold={} enabled={}",
                    c.dc_offset,
                    c.threshold,
                    channel_enabled(mask, ch)
                ),
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(toml: &str) -> Conf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, toml).unwrap();
        Conf::load(&path).unwrap()
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let conf = Conf::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(conf.acq_settings.record_length, 300000);
        assert_eq!(conf.acq_settings.pretrigger, 16336);
        assert_eq!(conf.acq_settings.acq_trigger_source, "SwTrg");
        assert_eq!(conf.acq_settings.selected_channels, "0x7");
        assert_eq!(conf.default_channel.dc_offset, 50.0);
        assert_eq!(conf.default_channel.threshold, 100);
        assert_eq!(conf.run_settings.flush_interval, 10);
        assert_eq!(conf.run_settings.time_resolution_ns, 8);
        assert_eq!(conf.record_samples(), 37500);
    }

    #[test]
    fn channel_overrides_fall_back_per_key() {
        let conf = load(
            r#"
            [default_channel]
            threshold = 250

            [channels.CH1]
            dc_offset = 20.0
            input_range = 2.0
            "#,
        );
        let ch0 = conf.channel_settings(0);
        assert_eq!(ch0.dc_offset, 50.0);
        assert_eq!(ch0.threshold, 250);
        let ch1 = conf.channel_settings(1);
        assert_eq!(ch1.dc_offset, 20.0);
        assert_eq!(ch1.threshold, 250);
        assert_eq!(ch1.input_range, Some(2.0));
    }

    #[test]
    fn queue_settings() {
        let conf = load(
            r#"
            [run_settings]
            queue_capacity = 16
            overflow_policy = "drop_oldest"
            "#,
        );
        assert_eq!(
            conf.queue_config(),
            QueueConfig::bounded(16, OverflowPolicy::DropOldest)
        );

        let conf = load("[run_settings]\nqueue_capacity = 0\n");
        assert_eq!(conf.queue_config(), QueueConfig::unbounded());
    }

    #[test]
    fn run_config_uses_channel_ranges() {
        let conf = load(
            r#"
            [channels.CH1]
            input_range = 2000.0
            "#,
        );
        let run = conf.run_config(2, 12).unwrap();
        assert_eq!(run.channel_count, 2);
        assert_eq!(run.calibrations[0], Calibration::from_bits(12).unwrap());
        assert_eq!(run.calibrations[1].calibrate(0), -1000.0);
        assert!(conf.run_config(2, 20).is_err());
    }

    #[test]
    fn simulated_settings_follow_acquisition() {
        let conf = load(
            r#"
            [acq_settings]
            record_length = 8000
            pretrigger = 800
            selected_channels = "0x5"

            [simulator]
            n_channels = 3
            "#,
        );
        let sim = conf.simulated_settings().unwrap();
        assert_eq!(sim.record_len, 1000);
        assert_eq!(sim.pretrigger, 100);
        assert_eq!(sim.channel_mask, 0x5);
        assert_eq!(sim.dc_offsets, vec![50.0; 3]);
        assert_eq!(conf.describe().len(), 6 + 3);
    }

    #[test]
    fn bad_mask_is_reported() {
        let conf = load("[acq_settings]\nselected_channels = \"zz\"\n");
        assert!(conf.simulated_settings().is_err());
    }
}
