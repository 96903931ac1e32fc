//! The raw-sample spool: a length-prefixed sequence of sample records on a
//! temporary file, written during the sampling rounds and streamed back by
//! the post-pass. Append-only and flushed per round, so a crash mid-run
//! leaves a readable prefix.
//!
//! Record layout, little-endian, after a `u32` byte-length prefix:
//! `pid:u32, tid:u64, name_len:u32 + utf8 (<= 256 bytes), time_sec:i64,
//! time_nsec:u32, flags:u32 (bit 0 = truncated), frame_count:u32,
//! frames: frame_count x {ip:u64, sp:u64}`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tempfile::NamedTempFile;

use crate::shared::types::{Sample, StackFrame};

const MAX_NAME_BYTES: usize = 256;
const FLAG_TRUNCATED: u32 = 1;

/// Refuse to believe a corrupt length field instead of allocating wildly.
const MAX_FRAMES_PER_RECORD: u32 = 1 << 20;

pub struct SpoolWriter {
    spool: NamedTempFile,
    writer: BufWriter<File>,
}

impl SpoolWriter {
    pub fn create() -> io::Result<SpoolWriter> {
        let spool = NamedTempFile::new()?;
        let writer = BufWriter::new(spool.reopen()?);
        Ok(SpoolWriter { spool, writer })
    }

    pub fn write_sample(&mut self, sample: &Sample) -> io::Result<()> {
        let mut name = sample.thread_name.as_bytes();
        if name.len() > MAX_NAME_BYTES {
            let mut end = MAX_NAME_BYTES;
            while end > 0 && !sample.thread_name.is_char_boundary(end) {
                end -= 1;
            }
            name = &name[..end];
        }

        let record_len = 4 + 8 + 4 + name.len() + 8 + 4 + 4 + 4 + sample.frames.len() * 16;
        let w = &mut self.writer;
        w.write_u32::<LittleEndian>(record_len as u32)?;
        w.write_u32::<LittleEndian>(sample.pid)?;
        w.write_u64::<LittleEndian>(sample.tid)?;
        w.write_u32::<LittleEndian>(name.len() as u32)?;
        w.write_all(name)?;
        w.write_i64::<LittleEndian>(sample.time_sec)?;
        w.write_u32::<LittleEndian>(sample.time_nsec)?;
        w.write_u32::<LittleEndian>(if sample.truncated { FLAG_TRUNCATED } else { 0 })?;
        w.write_u32::<LittleEndian>(sample.frames.len() as u32)?;
        for frame in &sample.frames {
            w.write_u64::<LittleEndian>(frame.instruction_pointer)?;
            w.write_u64::<LittleEndian>(frame.stack_pointer)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Flushes and reopens the spool for the post-pass. The temp file stays
    /// owned by the reader and is deleted when the reader is dropped.
    pub fn into_reader(mut self) -> io::Result<SpoolReader> {
        self.writer.flush()?;
        let file = self.spool.reopen()?;
        Ok(SpoolReader {
            _spool: Some(self.spool),
            reader: BufReader::new(file),
        })
    }

    /// Keeps the (partial) spool on disk for debugging and returns its path.
    pub fn persist_for_debugging(mut self) -> Option<PathBuf> {
        let _ = self.writer.flush();
        match self.spool.keep() {
            Ok((_file, path)) => Some(path),
            Err(_) => None,
        }
    }
}

pub struct SpoolReader {
    _spool: Option<NamedTempFile>,
    reader: BufReader<File>,
}

impl SpoolReader {
    /// Reads the next sample. A clean end of file and a torn trailing record
    /// (from a crashed writer) both end the stream.
    pub fn next_sample(&mut self) -> io::Result<Option<Sample>> {
        let record_len = match self.reader.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        };
        match self.read_record(record_len) {
            Ok(sample) => Ok(Some(sample)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn read_record(&mut self, record_len: u32) -> io::Result<Sample> {
        let r = &mut self.reader;
        let pid = r.read_u32::<LittleEndian>()?;
        let tid = r.read_u64::<LittleEndian>()?;
        let name_len = r.read_u32::<LittleEndian>()? as usize;
        if name_len > MAX_NAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("thread name of {name_len} bytes in spool record"),
            ));
        }
        let mut name_bytes = vec![0u8; name_len];
        r.read_exact(&mut name_bytes)?;
        let thread_name = String::from_utf8_lossy(&name_bytes).to_string();
        let time_sec = r.read_i64::<LittleEndian>()?;
        let time_nsec = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        let frame_count = r.read_u32::<LittleEndian>()?;
        if frame_count > MAX_FRAMES_PER_RECORD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{frame_count} frames in spool record"),
            ));
        }
        let expected_len = 4 + 8 + 4 + name_len + 8 + 4 + 4 + 4 + frame_count as usize * 16;
        if expected_len != record_len as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "spool record length mismatch",
            ));
        }
        let mut frames = Vec::with_capacity(frame_count as usize);
        for _ in 0..frame_count {
            let ip = r.read_u64::<LittleEndian>()?;
            let sp = r.read_u64::<LittleEndian>()?;
            frames.push(StackFrame::new(ip, sp));
        }
        Ok(Sample {
            pid,
            tid,
            thread_name,
            time_sec,
            time_nsec,
            truncated: flags & FLAG_TRUNCATED != 0,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tid: u64, frames: Vec<StackFrame>) -> Sample {
        Sample {
            pid: 4321,
            tid,
            thread_name: format!("worker-{tid}"),
            time_sec: 4,
            time_nsec: 987_654_321,
            truncated: tid == 2,
            frames,
        }
    }

    #[test]
    fn round_trips_samples_in_order() {
        let mut writer = SpoolWriter::create().unwrap();
        let first = sample(1, vec![StackFrame::new(0x1000, 0x2000)]);
        let second = sample(2, vec![]);
        let third = sample(
            3,
            vec![
                StackFrame::new(0xa, 0xb),
                StackFrame::new(u64::MAX, StackFrame::END_OF_UNWIND),
            ],
        );
        writer.write_sample(&first).unwrap();
        writer.write_sample(&second).unwrap();
        writer.write_sample(&third).unwrap();

        let mut reader = writer.into_reader().unwrap();
        assert_eq!(reader.next_sample().unwrap().unwrap(), first);
        assert_eq!(reader.next_sample().unwrap().unwrap(), second);
        assert_eq!(reader.next_sample().unwrap().unwrap(), third);
        assert!(reader.next_sample().unwrap().is_none());
    }

    #[test]
    fn long_thread_names_are_clipped() {
        let mut writer = SpoolWriter::create().unwrap();
        let mut long = sample(7, vec![]);
        long.thread_name = "x".repeat(400);
        writer.write_sample(&long).unwrap();

        let mut reader = writer.into_reader().unwrap();
        let read_back = reader.next_sample().unwrap().unwrap();
        assert_eq!(read_back.thread_name.len(), 256);
    }

    #[test]
    fn torn_trailing_record_is_ignored() {
        let mut writer = SpoolWriter::create().unwrap();
        writer
            .write_sample(&sample(1, vec![StackFrame::new(1, 2)]))
            .unwrap();
        writer.flush().unwrap();

        // Simulate a crash mid-append: a record length with no body behind it.
        let mut raw = writer.spool.reopen().unwrap();
        use std::io::Seek;
        raw.seek(std::io::SeekFrom::End(0)).unwrap();
        raw.write_all(&999u32.to_le_bytes()).unwrap();

        let mut reader = writer.into_reader().unwrap();
        assert!(reader.next_sample().unwrap().is_some());
        assert!(reader.next_sample().unwrap().is_none());
    }
}
