use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct TailerOptions {
    /// Skip to end-of-file on first open (ignored when constructed from an
    /// already-open handle).
    pub open_tail: bool,
    /// Backoff floor for empty reads; `None` means "yield NoData instead of
    /// sleeping", letting the caller decide.
    pub read_interval_min: Option<Duration>,
    pub read_interval_max: Duration,
    pub read_interval_mul: f64,
    pub rotation_check_interval: Duration,
}

impl Default for TailerOptions {
    fn default() -> Self {
        Self {
            open_tail: true,
            read_interval_min: Some(Duration::from_millis(100)),
            read_interval_max: Duration::from_secs(20),
            read_interval_mul: 1.1,
            rotation_check_interval: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TailEvent {
    Line(String),
    /// No complete line is available right now (only produced when
    /// `read_interval_min` is `None`).
    NoData,
    Stopped,
}

/// Rotation/truncation-aware follower of a growing text file. See spec
/// §4.3; reimplemented as an explicit poll() state machine rather than a
/// generator with a sentinel-based cancellation protocol.
pub struct Tailer {
    path: PathBuf,
    file: Option<File>,
    identity: Option<(u64, u64)>,
    next_rotation_check: Instant,
    pending: Vec<u8>,
    read_chk: Option<Duration>,
    opts: TailerOptions,
    pending_open_tail: bool,
    stopped: bool,
    generation: u64,
}

impl Tailer {
    pub fn open(path: impl Into<PathBuf>, opts: TailerOptions) -> Self {
        let pending_open_tail = opts.open_tail;
        let read_chk = opts.read_interval_min;
        Self {
            path: path.into(),
            file: None,
            identity: None,
            next_rotation_check: Instant::now(),
            pending: Vec::new(),
            read_chk,
            opts,
            pending_open_tail,
            stopped: false,
            generation: 0,
        }
    }

    /// Start from an already-open handle; `open_tail` is ignored since the
    /// handle's current position is used as-is.
    pub fn from_handle(file: File, path: impl Into<PathBuf>, opts: TailerOptions) -> io::Result<Self> {
        let identity = file_identity(&file)?;
        let read_chk = opts.read_interval_min;
        Ok(Self {
            path: path.into(),
            file: Some(file),
            identity: Some(identity),
            next_rotation_check: Instant::now() + opts.rotation_check_interval,
            pending: Vec::new(),
            read_chk,
            opts,
            pending_open_tail: false,
            stopped: false,
            generation: 1,
        })
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.file = None;
    }

    /// Bumped every time the underlying handle is replaced (rotation or
    /// first open); lets a wrapper (the durable tailer) detect when it must
    /// rebind its xattr handle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn current_file_mut(&mut self) -> Option<&mut File> {
        self.file.as_mut()
    }

    pub fn current_offset(&mut self) -> io::Result<u64> {
        match self.file.as_mut() {
            Some(f) => f.stream_position(),
            None => Ok(0),
        }
    }

    pub fn poll(&mut self) -> io::Result<TailEvent> {
        loop {
            if self.stopped {
                return Ok(TailEvent::Stopped);
            }
            if self.file.is_none() {
                self.reopen()?;
            }
            self.rotation_check()?;

            let mut buf = [0u8; READ_CHUNK];
            let n = self.file.as_mut().unwrap().read(&mut buf)?;

            if n == 0 {
                match self.read_chk {
                    None => return Ok(TailEvent::NoData),
                    Some(chk) => {
                        std::thread::sleep(chk);
                        let next = chk.mul_f64(self.opts.read_interval_mul);
                        self.read_chk = Some(next.min(self.opts.read_interval_max));
                        continue;
                    }
                }
            }

            if let Some(idx) = buf[..n].iter().position(|&b| b == b'\n') {
                self.pending.extend_from_slice(&buf[..=idx]);
                let extra = n - (idx + 1);
                if extra > 0 {
                    self.file
                        .as_mut()
                        .unwrap()
                        .seek(SeekFrom::Current(-(extra as i64)))?;
                }
                self.read_chk = self.opts.read_interval_min;
                let line = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return Ok(TailEvent::Line(line));
            } else {
                self.pending.extend_from_slice(&buf[..n]);
                self.read_chk = self.opts.read_interval_min;
            }
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let mut file = File::open(&self.path)?;
        if self.pending_open_tail {
            file.seek(SeekFrom::End(0))?;
            self.pending_open_tail = false;
        }
        self.identity = Some(file_identity(&file)?);
        self.next_rotation_check = Instant::now() + self.opts.rotation_check_interval;
        self.file = Some(file);
        self.generation += 1;
        self.pending.clear();
        Ok(())
    }

    fn rotation_check(&mut self) -> io::Result<()> {
        if Instant::now() < self.next_rotation_check {
            return Ok(());
        }
        self.next_rotation_check = Instant::now() + self.opts.rotation_check_interval;

        let stat = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return Ok(()), // stat errors: treat as "no rotation" this tick
        };
        let path_identity = (stat.ino(), stat.dev());
        if Some(path_identity) != self.identity {
            self.file = None;
            self.pending.clear();
            self.identity = None;
            return Ok(());
        }

        if let Some(file) = self.file.as_mut() {
            let len = file.metadata()?.len();
            let pos = file.stream_position()?;
            if len < pos {
                file.seek(SeekFrom::Start(0))?;
                self.pending.clear();
            }
        }
        Ok(())
    }
}

fn file_identity(file: &File) -> io::Result<(u64, u64)> {
    let meta = file.metadata()?;
    Ok((meta.ino(), meta.dev()))
}
