use crate::{channel_enabled, Frame, SourceError};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;

/// A triggered digitizer as seen by the acquisition producer.
///
/// The producer drives the lifecycle `arm -> start -> (trigger, next_frame)* -> disarm`.
/// `next_frame` returns `Ok(None)` when the source has nothing more to give.
pub trait FrameSource: Send {
    fn arm(&mut self) -> Result<(), SourceError>;

    fn start(&mut self) -> Result<(), SourceError>;

    /// Issue one software trigger.
    fn trigger(&mut self) -> Result<(), SourceError>;

    /// Block until the frame for the last trigger is read out.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    fn disarm(&mut self) -> Result<(), SourceError>;

    /// Number of channel waveforms carried by every frame.
    fn n_channels(&self) -> usize;

    /// Current parameter values, as `(name, value)` pairs, for operator display.
    fn parameters(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn arm(&mut self) -> Result<(), SourceError> {
        (**self).arm()
    }

    fn start(&mut self) -> Result<(), SourceError> {
        (**self).start()
    }

    fn trigger(&mut self) -> Result<(), SourceError> {
        (**self).trigger()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        (**self).next_frame()
    }

    fn disarm(&mut self) -> Result<(), SourceError> {
        (**self).disarm()
    }

    fn n_channels(&self) -> usize {
        (**self).n_channels()
    }

    fn parameters(&self) -> Vec<(String, String)> {
        (**self).parameters()
    }
}

/// Settings for [`SimulatedSource`].
#[derive(Debug, Clone)]
pub struct SimulatedSettings {
    pub n_channels: usize,
    pub record_len: usize,
    pub pretrigger: usize,
    pub adc_bits: u32,
    /// Bit `i` set enables channel `i`; disabled channels read out zero samples.
    pub channel_mask: u64,
    /// DC offset as a percentage of the ADC range, per channel.
    pub dc_offsets: Vec<f64>,
    /// Pulse amplitude in ADC counts.
    pub pulse_height: u16,
    pub noise: u16,
    /// Wall-clock delay between triggers.
    pub trigger_period: Duration,
    /// Device clock ticks between triggers.
    pub ticks_per_trigger: u64,
    /// End the stream after this many triggers.
    pub max_triggers: Option<u64>,
    pub seed: u64,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            n_channels: 4,
            record_len: 1024,
            pretrigger: 128,
            adc_bits: 14,
            channel_mask: 0x7,
            dc_offsets: Vec::new(),
            pulse_height: 2000,
            noise: 8,
            trigger_period: Duration::from_millis(10),
            ticks_per_trigger: 1_250_000,
            max_triggers: None,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimState {
    Idle,
    Armed,
    Running,
}

/// Software stand-in for a digitizer board.
///
/// Produces exponential-tail pulses on a noisy baseline, one frame per
/// software trigger, with increasing trigger ids and timestamps.
pub struct SimulatedSource {
    settings: SimulatedSettings,
    state: SimState,
    rng: StdRng,
    next_trigger_id: u32,
    clock: u64,
    pending: bool,
    issued: u64,
}

impl SimulatedSource {
    pub fn new(settings: SimulatedSettings) -> Self {
        let rng = StdRng::seed_from_u64(settings.seed);
        Self {
            settings,
            state: SimState::Idle,
            rng,
            next_trigger_id: 0,
            clock: 0,
            pending: false,
            issued: 0,
        }
    }

    pub fn settings(&self) -> &SimulatedSettings {
        &self.settings
    }

    fn baseline(&self, channel: usize) -> f64 {
        let max_raw = ((1u32 << self.settings.adc_bits.clamp(1, 16)) - 1) as f64;
        max_raw * self.baseline_pct(channel).clamp(0.0, 100.0) / 100.0
    }

    fn acquire(&mut self) -> Result<Frame, SourceError> {
        let n_channels = self.settings.n_channels;
        let len = self.settings.record_len;
        let max_raw = ((1u32 << self.settings.adc_bits.clamp(1, 16)) - 1) as f64;
        let mut frame = Frame::new(n_channels, len);
        frame.trigger_id = self.next_trigger_id;
        frame.timestamp = self.clock;

        let mut counts = vec![0u64; n_channels];
        {
            let mut waveforms = frame.waveforms_mut();
            for (ch, mut row) in waveforms.rows_mut().into_iter().enumerate() {
                if !self.is_enabled(ch) {
                    continue;
                }
                let baseline = self.baseline(ch);
                let height =
                    f64::from(self.settings.pulse_height) * self.rng.random_range(0.8..1.2);
                for (i, sample) in row.iter_mut().enumerate() {
                    let mut v = baseline;
                    if i >= self.settings.pretrigger {
                        let t = (i - self.settings.pretrigger) as f64;
                        v += height * (-t / 64.0).exp();
                    }
                    if self.settings.noise > 0 {
                        let n = f64::from(self.settings.noise);
                        v += self.rng.random_range(-n..=n);
                    }
                    *sample = v.round().clamp(0.0, max_raw) as u16;
                }
                counts[ch] = len as u64;
            }
        }
        frame.set_valid_counts(counts)?;

        self.next_trigger_id = self.next_trigger_id.wrapping_add(1);
        self.clock = self.clock.wrapping_add(self.settings.ticks_per_trigger);
        Ok(frame)
    }
}

impl FrameSource for SimulatedSource {
    fn arm(&mut self) -> Result<(), SourceError> {
        if self.settings.n_channels == 0 {
            return Err(SourceError::Connection("board reports zero channels".into()));
        }
        self.state = SimState::Armed;
        Ok(())
    }

    fn start(&mut self) -> Result<(), SourceError> {
        if self.state != SimState::Armed {
            return Err(SourceError::Command {
                command: "swstartacquisition".into(),
                reason: "acquisition not armed".into(),
            });
        }
        self.state = SimState::Running;
        Ok(())
    }

    fn trigger(&mut self) -> Result<(), SourceError> {
        if self.state != SimState::Running {
            return Err(SourceError::Command {
                command: "sendswtrigger".into(),
                reason: "acquisition not running".into(),
            });
        }
        self.pending = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if let Some(max) = self.settings.max_triggers {
            if self.issued >= max {
                return Ok(None);
            }
        }
        if !self.pending {
            return Err(SourceError::Timeout);
        }
        if !self.settings.trigger_period.is_zero() {
            std::thread::sleep(self.settings.trigger_period);
        }
        self.pending = false;
        self.issued += 1;
        self.acquire().map(Some)
    }

    fn disarm(&mut self) -> Result<(), SourceError> {
        self.state = SimState::Idle;
        Ok(())
    }

    fn n_channels(&self) -> usize {
        self.settings.n_channels
    }

    fn parameters(&self) -> Vec<(String, String)> {
        let s = &self.settings;
        let mut params = vec![
            ("NumCh".to_string(), s.n_channels.to_string()),
            ("ADC_Nbit".to_string(), s.adc_bits.to_string()),
            ("RecordLengthS".to_string(), s.record_len.to_string()),
            ("PreTriggerS".to_string(), s.pretrigger.to_string()),
            ("AcqTriggerSource".to_string(), "SwTrg".to_string()),
            ("ChannelMask".to_string(), format!("{:#x}", s.channel_mask)),
            ("TriggerCnt".to_string(), self.issued.to_string()),
        ];
        for ch in 0..s.n_channels {
            params.push((format!("DCOffset[{ch}]"), format!("{:.1}", self.baseline_pct(ch))));
            params.push((format!("ChEnable[{ch}]"), self.is_enabled(ch).to_string()));
        }
        params
    }
}

impl SimulatedSource {
    fn baseline_pct(&self, channel: usize) -> f64 {
        self.settings.dc_offsets.get(channel).copied().unwrap_or(50.0)
    }

    fn is_enabled(&self, channel: usize) -> bool {
        channel_enabled(self.settings.channel_mask, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(max: u64) -> SimulatedSource {
        SimulatedSource::new(SimulatedSettings {
            n_channels: 3,
            record_len: 64,
            pretrigger: 8,
            channel_mask: 0b101,
            trigger_period: Duration::ZERO,
            max_triggers: Some(max),
            ..Default::default()
        })
    }

    #[test]
    fn lifecycle_is_enforced() {
        let mut src = quick(1);
        assert!(src.trigger().is_err());
        assert!(src.start().is_err());
        src.arm().unwrap();
        src.start().unwrap();
        src.trigger().unwrap();
        assert!(src.next_frame().unwrap().is_some());
        src.disarm().unwrap();
        assert!(src.trigger().is_err());
    }

    #[test]
    fn frames_follow_trigger_sequence() {
        let mut src = quick(3);
        src.arm().unwrap();
        src.start().unwrap();
        let mut ids = Vec::new();
        let mut stamps = Vec::new();
        loop {
            src.trigger().unwrap();
            match src.next_frame().unwrap() {
                Some(frame) => {
                    ids.push(frame.trigger_id);
                    stamps.push(frame.timestamp);
                }
                None => break,
            }
        }
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn masked_channels_have_no_valid_samples() {
        let mut src = quick(1);
        src.arm().unwrap();
        src.start().unwrap();
        src.trigger().unwrap();
        let frame = src.next_frame().unwrap().unwrap();
        assert_eq!(frame.valid_counts(), &[64, 0, 64]);
        assert!(frame.valid_samples(0).iter().all(|&s| s < 1 << 14));
    }

    #[test]
    fn read_without_trigger_times_out() {
        let mut src = quick(5);
        src.arm().unwrap();
        src.start().unwrap();
        assert!(matches!(src.next_frame(), Err(SourceError::Timeout)));
    }

    #[test]
    fn parameters_list_channel_settings() {
        let src = quick(1);
        let params = src.parameters();
        assert!(params.iter().any(|(k, v)| k == "NumCh" && v == "3"));
        assert!(params.iter().any(|(k, v)| k == "ChEnable[1]" && v == "false"));
    }
}
