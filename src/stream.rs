use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use symphonia::core::io::MediaSource;

/// How a [`Stream`] backs its reads.
///
/// With two or more decode workers contending on one disk, paying the RAM
/// cost of slurping each file once eliminates seek thrashing, so the engine
/// selects `Buffered` whenever the worker pool has at least two workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Operations go straight to the OS file.
    Direct,
    /// The whole file is read into memory at open; operations act on the
    /// buffer.
    Buffered,
}

/// Seek origin for [`Stream::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Start,
    Current,
    End,
}

#[derive(Debug)]
enum Backing {
    Direct(File),
    Buffered(Vec<u8>),
}

/// Read-only binary file stream with 64-bit seeks and an explicit EOF latch.
///
/// Reads past the end return the truncated count and set EOF; seeks outside
/// `[0, len]` fail without moving the position. `len()` reports the true
/// file size in either mode.
#[derive(Debug)]
pub struct Stream {
    backing: Backing,
    len: u64,
    pos: u64,
    eof: bool,
}

impl Stream {
    pub fn open(path: &Path, mode: OpenMode) -> io::Result<Self> {
        let native = extended_length_path(path);
        let mut file = File::open(&native)?;
        let len = file.metadata()?.len();
        let backing = match mode {
            OpenMode::Direct => Backing::Direct(file),
            OpenMode::Buffered => {
                let mut data = Vec::with_capacity(len as usize);
                file.read_to_end(&mut data)?;
                Backing::Buffered(data)
            }
        };
        Ok(Stream { backing, len, pos: 0, eof: false })
    }

    /// Reads up to `buf.len()` bytes. A read that would run past the end is
    /// truncated and latches the EOF flag.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        let wanted = buf.len();
        let take = wanted.min(remaining as usize);
        if (wanted as u64) > remaining {
            self.eof = true;
        }
        match &mut self.backing {
            Backing::Buffered(data) => {
                let start = self.pos as usize;
                buf[..take].copy_from_slice(&data[start..start + take]);
                self.pos += take as u64;
                Ok(take)
            }
            Backing::Direct(file) => {
                let mut filled = 0;
                while filled < take {
                    match file.read(&mut buf[filled..take]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                self.pos += filled as u64;
                if filled < wanted {
                    self.eof = true;
                }
                Ok(filled)
            }
        }
    }

    /// Moves the position. Targets outside `[0, len]` fail and leave the
    /// position untouched; a successful seek clears the EOF latch.
    pub fn seek(&mut self, offset: i64, origin: Origin) -> io::Result<()> {
        let base = match origin {
            Origin::Start => 0i128,
            Origin::Current => self.pos as i128,
            Origin::End => self.len as i128,
        };
        let target = base + i128::from(offset);
        if target < 0 || target > self.len as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek target outside the stream",
            ));
        }
        let target = target as u64;
        if let Backing::Direct(file) = &mut self.backing {
            file.seek(SeekFrom::Start(target))?;
        }
        self.pos = target;
        self.eof = false;
        Ok(())
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn at_eof(&self) -> bool {
        self.eof
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf)
    }
}

impl Seek for Stream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, origin) = match pos {
            SeekFrom::Start(n) => (n as i64, Origin::Start),
            SeekFrom::Current(n) => (n, Origin::Current),
            SeekFrom::End(n) => (n, Origin::End),
        };
        Stream::seek(self, offset, origin)?;
        Ok(self.pos)
    }
}

impl MediaSource for Stream {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// Applies the Windows extended-length prefix to paths crossing the legacy
/// limit, so every caller above the stream layer works in plain paths. UNC
/// paths get the UNC-specific form.
#[cfg(windows)]
pub fn extended_length_path(path: &Path) -> PathBuf {
    const LEGACY_MAX_PATH: usize = 260;

    let raw = path.as_os_str().to_string_lossy();
    if raw.len() < LEGACY_MAX_PATH || raw.starts_with(r"\\?\") {
        return path.to_path_buf();
    }
    if let Some(rest) = raw.strip_prefix(r"\\") {
        PathBuf::from(format!(r"\\?\UNC\{rest}"))
    } else {
        PathBuf::from(format!(r"\\?\{raw}"))
    }
}

#[cfg(not(windows))]
pub fn extended_length_path(path: &Path) -> PathBuf {
    path.to_path_buf()
}

/// Strips any extended-length prefix for display, the inverse of
/// [`extended_length_path`]. Reports and progress lines always show plain
/// paths.
pub fn display_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if let Some(rest) = raw.strip_prefix(r"\\?\UNC\") {
        format!(r"\\{rest}")
    } else if let Some(rest) = raw.strip_prefix(r"\\?\") {
        rest.to_string()
    } else {
        raw.into_owned()
    }
}
