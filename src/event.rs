use crate::FrameError;
use ndarray::{Array2, ArrayView1, ArrayViewMut2};

/// One trigger's worth of data across every channel.
///
/// Waveforms are stored as a 2D contiguous array, one row per channel, sized
/// for the longest record the source can produce. Only the first
/// `valid_counts[ch]` samples of row `ch` are meaningful; the rest of the row
/// is scratch space left over from the readout.
///
/// A `Frame` is moved through the queue, never shared: the producer gives it
/// up on enqueue and the storage consumer drops it once written.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub trigger_id: u32,
    pub timestamp: u64,
    waveforms: Array2<u16>,
    valid_counts: Vec<u64>,
}

impl Frame {
    /// Create a zero-filled frame with `waveform_len` samples of room per channel.
    pub fn new(n_channels: usize, waveform_len: usize) -> Self {
        Self {
            trigger_id: 0,
            timestamp: 0,
            waveforms: Array2::<u16>::zeros((n_channels, waveform_len)),
            valid_counts: vec![0; n_channels],
        }
    }

    /// Assemble a frame from a readout, checking the valid-count invariant.
    pub fn from_parts(
        trigger_id: u32,
        timestamp: u64,
        waveforms: Array2<u16>,
        valid_counts: Vec<u64>,
    ) -> Result<Self, FrameError> {
        let (rows, len) = waveforms.dim();
        if rows != valid_counts.len() {
            return Err(FrameError::ChannelMismatch {
                rows,
                counts: valid_counts.len(),
            });
        }
        check_counts(&valid_counts, len)?;
        let waveforms = if waveforms.is_standard_layout() {
            waveforms
        } else {
            waveforms.as_standard_layout().into_owned()
        };
        Ok(Self {
            trigger_id,
            timestamp,
            waveforms,
            valid_counts,
        })
    }

    /// Build a frame from per-channel sample vectors; every sample is valid.
    /// Shorter channels are zero padded up to the longest one.
    pub fn from_channels(trigger_id: u32, timestamp: u64, channels: &[Vec<u16>]) -> Self {
        let len = channels.iter().map(Vec::len).max().unwrap_or(0);
        let mut waveforms = Array2::<u16>::zeros((channels.len(), len));
        for (mut row, samples) in waveforms.rows_mut().into_iter().zip(channels) {
            for (dst, &src) in row.iter_mut().zip(samples) {
                *dst = src;
            }
        }
        Self {
            trigger_id,
            timestamp,
            waveforms,
            valid_counts: channels.iter().map(|c| c.len() as u64).collect(),
        }
    }

    pub fn n_channels(&self) -> usize {
        self.waveforms.nrows()
    }

    /// Allocated samples per channel.
    pub fn waveform_len(&self) -> usize {
        self.waveforms.ncols()
    }

    pub fn valid_counts(&self) -> &[u64] {
        &self.valid_counts
    }

    pub fn valid_count(&self, channel: usize) -> u64 {
        self.valid_counts.get(channel).copied().unwrap_or(0)
    }

    /// Full raw row for a channel, including the undefined tail.
    pub fn raw_channel(&self, channel: usize) -> ArrayView1<'_, u16> {
        self.waveforms.row(channel)
    }

    /// The meaningful prefix of a channel's raw samples.
    ///
    /// Returns an empty slice for an unknown channel.
    pub fn valid_samples(&self, channel: usize) -> &[u16] {
        if channel >= self.n_channels() {
            return &[];
        }
        let valid = self.valid_counts[channel] as usize;
        let len = self.waveform_len();
        // Rows of a standard-layout array are contiguous.
        match self.waveforms.as_slice() {
            Some(all) => &all[channel * len..channel * len + valid],
            None => &[],
        }
    }

    /// Mutable access for sources that fill the buffers in place.
    pub fn waveforms_mut(&mut self) -> ArrayViewMut2<'_, u16> {
        self.waveforms.view_mut()
    }

    pub fn set_valid_counts(&mut self, counts: Vec<u64>) -> Result<(), FrameError> {
        if counts.len() != self.n_channels() {
            return Err(FrameError::ChannelMismatch {
                rows: self.n_channels(),
                counts: counts.len(),
            });
        }
        check_counts(&counts, self.waveform_len())?;
        self.valid_counts = counts;
        Ok(())
    }

    /// Bytes of meaningful raw data in this frame.
    pub fn payload_size(&self) -> usize {
        self.valid_counts.iter().map(|&c| c as usize).sum::<usize>() * std::mem::size_of::<u16>()
    }
}

fn check_counts(counts: &[u64], len: usize) -> Result<(), FrameError> {
    for (channel, &valid) in counts.iter().enumerate() {
        if valid > len as u64 {
            return Err(FrameError::ValidCountOverflow { channel, valid, len });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn valid_samples_ignores_tail() {
        let wf = array![[1u16, 2, 3, 99], [4, 5, 99, 99]];
        let frame = Frame::from_parts(3, 100, wf, vec![3, 2]).unwrap();
        assert_eq!(frame.valid_samples(0), &[1, 2, 3]);
        assert_eq!(frame.valid_samples(1), &[4, 5]);
        assert_eq!(frame.valid_samples(2), &[] as &[u16]);
        assert_eq!(frame.payload_size(), 10);
    }

    #[test]
    fn from_parts_rejects_overflowing_count() {
        let wf = Array2::<u16>::zeros((2, 4));
        let err = Frame::from_parts(0, 0, wf, vec![4, 5]).unwrap_err();
        assert_eq!(
            err,
            FrameError::ValidCountOverflow {
                channel: 1,
                valid: 5,
                len: 4
            }
        );
    }

    #[test]
    fn from_parts_rejects_row_mismatch() {
        let wf = Array2::<u16>::zeros((3, 4));
        assert!(matches!(
            Frame::from_parts(0, 0, wf, vec![1, 1]),
            Err(FrameError::ChannelMismatch { rows: 3, counts: 2 })
        ));
    }

    #[test]
    fn from_channels_pads_short_rows() {
        let frame = Frame::from_channels(1, 2, &[vec![1, 2, 3], vec![7]]);
        assert_eq!(frame.waveform_len(), 3);
        assert_eq!(frame.valid_counts(), &[3, 1]);
        assert_eq!(frame.valid_samples(1), &[7]);
        assert_eq!(frame.raw_channel(1).to_vec(), vec![7, 0, 0]);
    }

    #[test]
    fn set_valid_counts_checks_bounds() {
        let mut frame = Frame::new(2, 8);
        assert!(frame.set_valid_counts(vec![8, 9]).is_err());
        frame.set_valid_counts(vec![8, 0]).unwrap();
        assert_eq!(frame.valid_samples(0).len(), 8);
        assert!(frame.valid_samples(1).is_empty());
    }
}
