use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};
use xattr::FileExt;

use crate::tail::{TailEvent, Tailer, TailerOptions};

/// A [`Tailer`] that persists its read position in a filesystem extended
/// attribute, so a restart resumes from where it left off instead of
/// re-reading (or skipping) the log. See spec §4.4 / §3 TailCheckpoint.
///
/// The checkpoint is a packed 32-byte record: an 8-byte big-endian `pos`,
/// a 4-byte big-endian `hashed_len` (the byte length of the last line
/// consumed), and the raw 20-byte SHA-1 digest of those bytes ending at
/// `pos`. On reopen the bytes at `pos - hashed_len .. pos` are re-read and
/// re-hashed; any mismatch resets to offset 0.
pub struct DurableTailer {
    tailer: Tailer,
    xattr_name: String,
    min_dump_interval: Duration,
    last_dump: Instant,
    /// Set on an empty yield; forces the next line's checkpoint write to
    /// bypass `min_dump_interval` instead of waiting out the throttle.
    force_flush: bool,
}

const CHECKPOINT_LEN: usize = 8 + 4 + 20;

fn encode_checkpoint(pos: u64, hashed_len: u32, hash: &[u8]) -> [u8; CHECKPOINT_LEN] {
    let mut buf = [0u8; CHECKPOINT_LEN];
    buf[0..8].copy_from_slice(&pos.to_be_bytes());
    buf[8..12].copy_from_slice(&hashed_len.to_be_bytes());
    buf[12..32].copy_from_slice(hash);
    buf
}

fn decode_checkpoint(raw: &[u8]) -> Option<(u64, u32, &[u8])> {
    if raw.len() != CHECKPOINT_LEN {
        return None;
    }
    let pos = u64::from_be_bytes(raw[0..8].try_into().ok()?);
    let hashed_len = u32::from_be_bytes(raw[8..12].try_into().ok()?);
    Some((pos, hashed_len, &raw[12..32]))
}

impl DurableTailer {
    pub fn open(
        path: impl Into<PathBuf>,
        xattr_name: impl Into<String>,
        tail_opts: TailerOptions,
        min_dump_interval: Duration,
    ) -> io::Result<Self> {
        let path = path.into();
        let xattr_name = xattr_name.into();
        let mut file = File::open(&path)?;

        let start_offset = read_checkpoint(&mut file, &xattr_name)?.unwrap_or(0);
        file.seek(SeekFrom::Start(start_offset))?;

        let mut opts = tail_opts;
        opts.open_tail = false;
        let tailer = Tailer::from_handle(file, path, opts)?;

        Ok(Self {
            tailer,
            xattr_name,
            min_dump_interval,
            last_dump: Instant::now(),
            force_flush: false,
        })
    }

    pub fn stop(&mut self) {
        self.tailer.stop();
    }

    pub fn poll(&mut self) -> io::Result<TailEvent> {
        let event = self.tailer.poll()?;
        match &event {
            TailEvent::Line(line) => {
                if self.force_flush || self.last_dump.elapsed() >= self.min_dump_interval {
                    self.write_checkpoint(line);
                    self.last_dump = Instant::now();
                    self.force_flush = false;
                }
            }
            TailEvent::NoData => self.force_flush = true,
            TailEvent::Stopped => {}
        }
        Ok(event)
    }

    /// Best-effort: a filesystem without xattr support (or a mount without
    /// `user_xattr`) just loses the resume-on-restart property, not data.
    /// Written against whatever handle the tailer currently holds, so a
    /// checkpoint taken right after rotation targets the new file.
    fn write_checkpoint(&mut self, line: &str) {
        let offset = match self.tailer.current_offset() {
            Ok(o) => o,
            Err(_) => return,
        };
        let hashed_len = line.len() as u32;
        let hash = Sha1::digest(line.as_bytes());
        let value = encode_checkpoint(offset, hashed_len, &hash);
        if let Some(file) = self.tailer.current_file_mut() {
            if let Err(err) = file.set_xattr(&self.xattr_name, &value) {
                log::debug!("failed to persist tail checkpoint on {}: {err}", self.xattr_name);
            }
        }
    }
}

fn read_checkpoint(file: &mut File, xattr_name: &str) -> io::Result<Option<u64>> {
    let raw = match file.get_xattr(xattr_name) {
        Ok(Some(v)) => v,
        Ok(None) => return Ok(None),
        Err(_) => return Ok(None),
    };
    let Some((pos, hashed_len, stored_hash)) = decode_checkpoint(&raw) else {
        return Ok(None);
    };
    let hashed_len = hashed_len as u64;
    if hashed_len > pos {
        return Ok(None);
    }
    let file_len = file.metadata()?.len();
    if pos > file_len {
        return Ok(None); // file shrank since the checkpoint: treat as stale
    }

    let start = pos - hashed_len;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; hashed_len as usize];
    if file.read_exact(&mut buf).is_err() {
        return Ok(None);
    }
    let actual_hash = Sha1::digest(&buf);
    if actual_hash.as_slice() == stored_hash {
        Ok(Some(pos))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn opts() -> TailerOptions {
        TailerOptions {
            open_tail: false,
            read_interval_min: None,
            ..Default::default()
        }
    }

    /// Some sandboxed /tmp mounts don't support user xattrs at all; skip
    /// resume-specific assertions there instead of failing spuriously.
    fn xattr_usable(path: &std::path::Path) -> bool {
        let f = match File::open(path) {
            Ok(f) => f,
            Err(_) => return false,
        };
        f.set_xattr("user.harvestd.probe", b"1").is_ok()
    }

    #[test]
    fn resumes_from_persisted_checkpoint() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "first").unwrap();
        writeln!(f, "second").unwrap();
        if !xattr_usable(f.path()) {
            return;
        }

        let mut tailer = DurableTailer::open(
            f.path(),
            "user.harvestd.test.pos",
            opts(),
            Duration::from_secs(0),
        )
        .unwrap();
        assert_eq!(tailer.poll().unwrap(), TailEvent::Line("first\n".to_string()));
        drop(tailer);

        let mut resumed = DurableTailer::open(
            f.path(),
            "user.harvestd.test.pos",
            opts(),
            Duration::from_secs(0),
        )
        .unwrap();
        assert_eq!(resumed.poll().unwrap(), TailEvent::Line("second\n".to_string()));
    }

    #[test]
    fn mismatched_hash_falls_back_to_start() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "first").unwrap();
        writeln!(f, "second").unwrap();
        if !xattr_usable(f.path()) {
            return;
        }

        let file = File::open(f.path()).unwrap();
        let bogus_hash = [0xdeu8; 20];
        file.set_xattr("user.harvestd.test.pos2", &encode_checkpoint(6, 6, &bogus_hash))
            .unwrap();

        let mut tailer = DurableTailer::open(
            f.path(),
            "user.harvestd.test.pos2",
            opts(),
            Duration::from_secs(0),
        )
        .unwrap();
        assert_eq!(tailer.poll().unwrap(), TailEvent::Line("first\n".to_string()));
    }

    #[test]
    fn single_byte_corruption_invalidates_checkpoint() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "0123456789").unwrap();
        if !xattr_usable(f.path()) {
            return;
        }
        let file = File::open(f.path()).unwrap();
        let good_hash = Sha1::digest(b"0123456789\n");
        file.set_xattr("user.harvestd.test.pos3", &encode_checkpoint(11, 11, &good_hash))
            .unwrap();

        // flip one byte before the checkpointed region
        {
            let mut rw = std::fs::OpenOptions::new().write(true).open(f.path()).unwrap();
            rw.seek(SeekFrom::Start(0)).unwrap();
            rw.write_all(b"9").unwrap();
        }

        let mut tailer = DurableTailer::open(
            f.path(),
            "user.harvestd.test.pos3",
            opts(),
            Duration::from_secs(0),
        )
        .unwrap();
        // checkpoint invalidated: resumes from 0, re-reading the (now corrupted) line
        assert_eq!(
            tailer.poll().unwrap(),
            TailEvent::Line("9123456789\n".to_string())
        );
    }

    #[test]
    fn checkpoint_round_trips_through_encode_decode() {
        let hash = Sha1::digest(b"hello");
        let buf = encode_checkpoint(1234, 5, &hash);
        let (pos, len, stored) = decode_checkpoint(&buf).unwrap();
        assert_eq!(pos, 1234);
        assert_eq!(len, 5);
        assert_eq!(stored, hash.as_slice());
    }

    #[test]
    fn empty_yield_forces_an_immediate_checkpoint_on_the_next_line() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "first").unwrap();
        if !xattr_usable(f.path()) {
            return;
        }

        let long_interval = Duration::from_secs(3600);
        let mut tailer =
            DurableTailer::open(f.path(), "user.harvestd.test.flush", opts(), long_interval).unwrap();

        assert_eq!(tailer.poll().unwrap(), TailEvent::Line("first\n".to_string()));
        // throttled: the dump interval hasn't elapsed yet
        assert!(File::open(f.path())
            .unwrap()
            .get_xattr("user.harvestd.test.flush")
            .unwrap()
            .is_none());

        assert_eq!(tailer.poll().unwrap(), TailEvent::NoData);
        writeln!(f, "second").unwrap();
        assert_eq!(tailer.poll().unwrap(), TailEvent::Line("second\n".to_string()));
        // the empty yield forced the throttle open for this line
        assert!(File::open(f.path())
            .unwrap()
            .get_xattr("user.harvestd.test.flush")
            .unwrap()
            .is_some());
    }
}
