use crate::record::{samples_from_bytes, Record, RecordHeader, HEADER_LEN};
use crate::DecodeError;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Streams records back out of a channel file.
///
/// Yields every complete record in file order. End of file on a record
/// boundary ends the stream; a file that stops partway through a record
/// yields one [`DecodeError::Truncated`] and then ends.
pub struct RecordReader<R> {
    inner: R,
    offset: u64,
    done: bool,
}

impl RecordReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read + Seek> RecordReader<R> {
    /// Start again from the first record.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(0))?;
        self.offset = 0;
        self.done = false;
        Ok(())
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            done: false,
        }
    }

    /// Byte offset of the next record to decode.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> Result<Option<Record>, DecodeError> {
        let mut raw = [0u8; HEADER_LEN];
        let got = read_full(&mut self.inner, &mut raw)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_LEN {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                needed: HEADER_LEN,
                got,
            });
        }
        let header = RecordHeader::from_bytes(&raw);

        // Grow with the data actually present rather than trusting the count.
        let want = header.payload_len();
        let mut payload = Vec::with_capacity(want.min(1 << 20));
        (&mut self.inner).take(want as u64).read_to_end(&mut payload)?;
        if payload.len() < want {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                needed: HEADER_LEN + want,
                got: HEADER_LEN + payload.len(),
            });
        }

        self.offset += (HEADER_LEN + want) as u64;
        Ok(Some(Record {
            trigger_id: header.trigger_id,
            timestamp: header.timestamp,
            time_resolution: header.time_resolution,
            samples: samples_from_bytes(&payload),
        }))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> std::iter::FusedIterator for RecordReader<R> {}

/// Fill `buf` as far as the reader allows. Returns the number of bytes read,
/// which is less than `buf.len()` only at end of file.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Overview of a channel file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileSummary {
    pub records: u64,
    pub samples: u64,
    pub first_trigger: Option<u32>,
    pub last_trigger: Option<u32>,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
    pub time_resolution: Option<u64>,
    /// Byte offset of an incomplete trailing record, if any.
    pub truncated_at: Option<u64>,
}

impl FileSummary {
    /// Span between the first and last trigger, in seconds.
    pub fn duration_secs(&self) -> Option<f64> {
        let (first, last, res) = (
            self.first_timestamp?,
            self.last_timestamp?,
            self.time_resolution?,
        );
        Some(last.saturating_sub(first) as f64 * res as f64 * 1e-9)
    }
}

/// Decode a whole channel file, keeping only counters.
pub fn summarize<P: AsRef<Path>>(path: P) -> Result<FileSummary, DecodeError> {
    let mut summary = FileSummary::default();
    for item in RecordReader::open(path)? {
        match item {
            Ok(record) => {
                summary.records += 1;
                summary.samples += record.samples.len() as u64;
                summary.first_trigger.get_or_insert(record.trigger_id);
                summary.first_timestamp.get_or_insert(record.timestamp);
                summary.last_trigger = Some(record.trigger_id);
                summary.last_timestamp = Some(record.timestamp);
                summary.time_resolution = Some(record.time_resolution);
            }
            Err(DecodeError::Truncated { offset, .. }) => summary.truncated_at = Some(offset),
            Err(e) => return Err(e),
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::write_record;
    use std::io::Cursor;

    fn encode(records: &[(u32, Vec<f32>)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (id, samples) in records {
            let header = RecordHeader {
                trigger_id: *id,
                timestamp: u64::from(*id) * 100,
                sample_count: samples.len() as u32,
                time_resolution: 8,
            };
            write_record(&mut buf, &header, samples).unwrap();
        }
        buf
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut reader = RecordReader::new(Cursor::new(Vec::new()));
        assert!(reader.next().is_none());
    }

    #[test]
    fn decodes_records_in_order() {
        let bytes = encode(&[(0, vec![0.5, -0.5]), (1, vec![]), (2, vec![1.0])]);
        let records: Vec<Record> = RecordReader::new(Cursor::new(bytes))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].samples, vec![0.5, -0.5]);
        assert_eq!(records[1].sample_count(), 0);
        assert_eq!(records[2].timestamp, 200);
        assert_eq!(records[2].time_resolution, 8);
    }

    #[test]
    fn truncated_payload_keeps_prior_records() {
        let mut bytes = encode(&[(0, vec![1.0; 4]), (1, vec![2.0; 4])]);
        let full = bytes.len();
        bytes.truncate(full - 3);

        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert_eq!(reader.next().unwrap().unwrap().trigger_id, 0);
        match reader.next() {
            Some(Err(DecodeError::Truncated { offset, needed, got })) => {
                assert_eq!(offset, (HEADER_LEN + 16) as u64);
                assert_eq!(needed, HEADER_LEN + 16);
                assert_eq!(got, HEADER_LEN + 13);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn truncated_header_is_reported() {
        let mut bytes = encode(&[(0, vec![1.0])]);
        bytes.extend_from_slice(&[1, 2, 3]);
        let items: Vec<_> = RecordReader::new(Cursor::new(bytes)).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(
            items[1],
            Err(DecodeError::Truncated { needed: HEADER_LEN, got: 3, .. })
        ));
    }

    #[test]
    fn huge_sample_count_does_not_preallocate() {
        let header = RecordHeader {
            trigger_id: 0,
            timestamp: 0,
            sample_count: u32::MAX,
            time_resolution: 8,
        };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert!(matches!(reader.next(), Some(Err(DecodeError::Truncated { .. }))));
    }

    #[test]
    fn rewind_restarts_stream() {
        let bytes = encode(&[(3, vec![0.0]), (4, vec![0.0])]);
        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert_eq!(reader.by_ref().count(), 2);
        reader.rewind().unwrap();
        assert_eq!(reader.offset(), 0);
        let ids: Vec<u32> = reader.map(|r| r.unwrap().trigger_id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn summary_reports_span_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw_CH0.bin");
        let mut bytes = encode(&[(0, vec![0.0; 2]), (5, vec![0.0; 2])]);
        bytes.push(0xff);
        std::fs::write(&path, bytes).unwrap();

        let summary = summarize(&path).unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.samples, 4);
        assert_eq!(summary.first_trigger, Some(0));
        assert_eq!(summary.last_trigger, Some(5));
        assert!(summary.truncated_at.is_some());
        let secs = summary.duration_secs().unwrap();
        assert!((secs - 500.0 * 8.0e-9).abs() < 1e-12);
    }
}
