//! Byte sources for input nodes.
//!
//! A [`Recording`] is the ordered concatenation of one or more files,
//! readable forward only. The input node never reads it directly on its
//! event loop: a [`BlockPipeline`] owns the recording on a helper thread
//! and feeds fixed-size blocks through a bounded channel, which is the
//! backpressure ring between disk and the channel extractor.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::thread;

use crossbeam_channel::{bounded, Receiver};
use log::debug;

/// Block size of the reader pipeline.
const BLOCK_BYTES: usize = 1 << 20;

/// Depth of the backpressure ring: the reader stalls when the extractor
/// falls this many blocks behind.
const RING_DEPTH: usize = 8;

/// Anything an extractor can pull bytes from.
pub trait ByteSource {
    /// Fill as much of `buf` as possible. Short only at end of data.
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Discard the next `n` bytes. Short only at end of data.
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut scratch = [0u8; 4096];
        let mut remaining = n;
        while remaining > 0 {
            let want = scratch.len().min(remaining as usize);
            let got = self.read_into(&mut scratch[..want])?;
            if got == 0 {
                break;
            }
            remaining -= got as u64;
        }
        Ok(n - remaining)
    }

    /// Bytes handed out so far.
    fn bytes_read(&self) -> u64;
}

/// Strip a `file://` scheme from a recording URI.
pub fn uri_to_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

/// The ordered concatenation of recording files for one station datastream.
pub struct Recording {
    paths: Vec<PathBuf>,
    next_path: usize,
    current: Option<BufReader<File>>,
    bytes_read: u64,
}

impl Recording {
    /// A recording over the given URIs. Files are opened lazily, so a
    /// missing later file only surfaces when the read reaches it.
    pub fn new(sources: &[String]) -> Self {
        Self {
            paths: sources.iter().map(|s| uri_to_path(s)).collect(),
            next_path: 0,
            current: None,
            bytes_read: 0,
        }
    }

    fn ensure_open(&mut self) -> io::Result<bool> {
        while self.current.is_none() {
            if self.next_path >= self.paths.len() {
                return Ok(false);
            }
            let path = &self.paths[self.next_path];
            self.next_path += 1;
            debug!("opening recording segment {}", path.display());
            self.current = Some(BufReader::new(File::open(path)?));
        }
        Ok(true)
    }
}

impl ByteSource for Recording {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.ensure_open()? {
                break;
            }
            let reader = self.current.as_mut().unwrap();
            match reader.read(&mut buf[filled..])? {
                0 => self.current = None,
                n => filled += n,
            }
        }
        self.bytes_read += filled as u64;
        Ok(filled)
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut remaining = n;
        while remaining > 0 {
            if !self.ensure_open()? {
                break;
            }
            let reader = self.current.as_mut().unwrap();
            let len = reader.get_ref().metadata()?.len();
            let pos = reader.stream_position()?;
            let left_in_file = len - pos;
            if remaining < left_in_file {
                reader.seek(SeekFrom::Current(remaining as i64))?;
                remaining = 0;
            } else {
                remaining -= left_in_file;
                self.current = None;
            }
        }
        let skipped = n - remaining;
        self.bytes_read += skipped;
        Ok(skipped)
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// The consumer end of the reader pipeline.
pub struct BlockPipeline {
    rx: Receiver<io::Result<Vec<u8>>>,
    block: Vec<u8>,
    pos: usize,
    bytes_read: u64,
}

impl BlockPipeline {
    /// Move `source` to a helper thread and stream its blocks back.
    pub fn spawn<S: ByteSource + Send + 'static>(mut source: S) -> Self {
        let (tx, rx) = bounded(RING_DEPTH);
        thread::Builder::new()
            .name("recording-reader".to_string())
            .spawn(move || loop {
                let mut block = vec![0u8; BLOCK_BYTES];
                match source.read_into(&mut block) {
                    Ok(0) => return,
                    Ok(n) => {
                        block.truncate(n);
                        if tx.send(Ok(block)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            })
            .expect("spawn recording reader");
        Self {
            rx,
            block: Vec::new(),
            pos: 0,
            bytes_read: 0,
        }
    }

    fn refill(&mut self) -> io::Result<bool> {
        match self.rx.recv() {
            Ok(Ok(block)) => {
                self.block = block;
                self.pos = 0;
                Ok(true)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }
}

impl ByteSource for BlockPipeline {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pos == self.block.len() && !self.refill()? {
                break;
            }
            let take = (buf.len() - filled).min(self.block.len() - self.pos);
            buf[filled..filled + take].copy_from_slice(&self.block[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        self.bytes_read += filled as u64;
        Ok(filled)
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}
