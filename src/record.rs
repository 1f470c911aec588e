use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Size in bytes of an encoded [`RecordHeader`].
pub const HEADER_LEN: usize = 4 + 8 + 4 + 8;

/// Size in bytes of one encoded calibrated sample.
pub const SAMPLE_LEN: usize = 4;

/// Fixed-width header written in front of every channel record.
///
/// Layout (little-endian):
///
/// ```text
/// offset  size  field
/// 0       4     trigger_id
/// 4       8     timestamp
/// 12      4     sample_count
/// 16      8     time_resolution
/// 24      4*N   samples (f32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub trigger_id: u32,
    pub timestamp: u64,
    pub sample_count: u32,
    pub time_resolution: u64,
}

impl RecordHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.trigger_id)?;
        w.write_u64::<LittleEndian>(self.timestamp)?;
        w.write_u32::<LittleEndian>(self.sample_count)?;
        w.write_u64::<LittleEndian>(self.time_resolution)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            trigger_id: r.read_u32::<LittleEndian>()?,
            timestamp: r.read_u64::<LittleEndian>()?,
            sample_count: r.read_u32::<LittleEndian>()?,
            time_resolution: r.read_u64::<LittleEndian>()?,
        })
    }

    /// Decode a header from exactly [`HEADER_LEN`] bytes.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            trigger_id: LittleEndian::read_u32(&buf[0..4]),
            timestamp: LittleEndian::read_u64(&buf[4..12]),
            sample_count: LittleEndian::read_u32(&buf[12..16]),
            time_resolution: LittleEndian::read_u64(&buf[16..24]),
        }
    }

    /// Number of bytes taken by the samples that follow this header.
    pub fn payload_len(&self) -> usize {
        self.sample_count as usize * SAMPLE_LEN
    }
}

/// One decoded channel record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub trigger_id: u32,
    pub timestamp: u64,
    pub time_resolution: u64,
    pub samples: Vec<f32>,
}

impl Record {
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn header(&self) -> RecordHeader {
        RecordHeader {
            trigger_id: self.trigger_id,
            timestamp: self.timestamp,
            sample_count: self.samples.len() as u32,
            time_resolution: self.time_resolution,
        }
    }

    /// Size of this record on disk.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.samples.len() * SAMPLE_LEN
    }
}

/// Write a header followed by its samples. Returns the number of bytes written.
///
/// `header.sample_count` must equal `samples.len()`.
pub fn write_record<W: Write>(
    w: &mut W,
    header: &RecordHeader,
    samples: &[f32],
) -> io::Result<usize> {
    if header.sample_count as usize != samples.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "header announces {} samples but {} were given",
                header.sample_count,
                samples.len()
            ),
        ));
    }
    header.write_to(w)?;
    for &v in samples {
        w.write_f32::<LittleEndian>(v)?;
    }
    Ok(HEADER_LEN + samples.len() * SAMPLE_LEN)
}

/// Decode little-endian f32 samples from `buf`.
pub fn samples_from_bytes(buf: &[u8]) -> Vec<f32> {
    buf.chunks_exact(SAMPLE_LEN)
        .map(LittleEndian::read_f32)
        .collect()
}
