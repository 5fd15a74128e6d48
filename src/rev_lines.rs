//! Reading a file one line at a time from the end.
//!
//! Solver logs can run to gigabytes, and everything the classifiers look for
//! (termination messages, the last convergence table, the last geometry)
//! sits near the tail. [RevLines] reads fixed-size blocks backwards from the
//! end of the file and yields complete lines newest first, so a scan that
//! stops early never touches the bulk of the file.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Iterator over the non-empty lines of a reader, last line first. Line
/// terminators (`\n` or `\r\n`) are stripped, and invalid UTF-8 is replaced
/// rather than rejected since solver output is not always clean.
pub struct RevLines<R> {
    reader: R,
    /// offset of the first byte of the file that has not been read yet
    pos: u64,
    block_size: usize,
    /// bytes read but not yet yielded. everything after the last newline in
    /// here is a complete line
    buf: Vec<u8>,
    done: bool,
}

impl RevLines<File> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek> RevLines<R> {
    pub fn new(reader: R) -> io::Result<Self> {
        Self::with_block_size(reader, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(mut reader: R, block_size: usize) -> io::Result<Self> {
        let pos = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            reader,
            pos,
            block_size: block_size.max(1),
            buf: Vec::new(),
            done: false,
        })
    }

    /// prepend the previous block of the file to `buf`
    fn read_block(&mut self) -> io::Result<()> {
        let len = (self.block_size as u64).min(self.pos);
        self.pos -= len;
        self.reader.seek(SeekFrom::Start(self.pos))?;
        let mut block = vec![0; len as usize];
        self.reader.read_exact(&mut block)?;
        block.append(&mut self.buf);
        self.buf = block;
        Ok(())
    }

    fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(idx) = self.buf.iter().rposition(|&b| b == b'\n') {
                let line = self.buf.split_off(idx + 1);
                self.buf.truncate(idx);
                if let Some(line) = decode(&line) {
                    return Ok(Some(line));
                }
            } else if self.pos > 0 {
                self.read_block()?;
            } else {
                let line = std::mem::take(&mut self.buf);
                return Ok(decode(&line));
            }
        }
    }
}

fn decode(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(line).into_owned())
}

impl<R: Read + Seek> Iterator for RevLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_line() {
            Ok(Some(line)) => Some(Ok(line)),
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
