use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Upper bound on a single encoded event; larger length prefixes are treated as corruption.
const MAX_EVENT_LEN: usize = 16 * 1024 * 1024;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely, or report `false` if the file ends first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next intact event and the number of bytes its record occupies.
/// `None` marks the end of the usable log: clean EOF, a truncated tail, a CRC
/// mismatch or an undecodable payload.
fn read_event(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_EVENT_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }

    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, (len + 8) as u64)))
}

/// Events recovered from a log, and the length of its intact prefix.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    pub valid_len: u64,
}

/// Append-only booking journal.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is cut off by `recover` before the
///   log is reopened for appends.
/// - A batch that fails to commit is rolled back to the last fsynced length.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    committed_len: u64,
    committed_appends: u64,
    /// Set when a rollback could not restore the file. Appends are refused
    /// until `compact` rewrites the log.
    poisoned: bool,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            committed_len,
            committed_appends: 0,
            poisoned: false,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Append and fsync a single event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL needs compaction after a failed rollback"));
        }
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(io::Error::other("injected fsync failure"));
        }
        self.writer.get_ref().sync_all()?;
        self.committed_len = self.writer.get_ref().metadata()?.len();
        self.committed_appends = self.appends_since_compact;
        Ok(())
    }

    /// Drop everything written since the last successful `flush_sync`: the
    /// buffered bytes and any that already reached the file.
    ///
    /// If the file cannot be cut back the log is poisoned and every later
    /// append fails until `compact` succeeds.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.appends_since_compact = self.committed_appends;
        let restored = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .and_then(|file| {
                file.set_len(self.committed_len)?;
                file.sync_all()?;
                Ok(file)
            });
        match restored {
            Ok(file) => {
                let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
                // into_parts hands back the unflushed buffer instead of writing it on drop.
                let _ = stale.into_parts();
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_next_sync(&mut self) {
        self.fail_next_sync = true;
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write a temp file, fsync, rename over the WAL, reopen.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        // The old writer may hold bytes from a failed batch; they must not
        // reach the fresh log.
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = stale.into_parts();
        self.appends_since_compact = 0;
        self.committed_appends = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Replay the WAL from disk without modifying it. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        while let Some((event, record_len)) = read_event(&mut reader)? {
            replay.events.push(event);
            replay.valid_len += record_len;
        }
        Ok(replay)
    }

    /// Replay the WAL and cut the file back to its intact prefix, so records
    /// appended afterwards are not stranded behind a torn or corrupt one.
    pub fn recover(path: &Path) -> io::Result<Replay> {
        let replay = Self::replay(path)?;
        let on_disk = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(replay),
            Err(e) => return Err(e),
        };
        if on_disk > replay.valid_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = on_disk - replay.valid_len,
                kept_events = replay.events.len(),
                "truncated damaged WAL tail"
            );
        }
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Booking, BookingStatus, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(resource_id: Ulid, start: i64, end: i64) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                requester_id: Ulid::new(),
                resource_id,
                span: Span::new(start, end),
                status: BookingStatus::Pending,
                created_at: 1,
                updated_at: 1,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let rid = Ulid::new();
        let first = created(rid, 1000, 2000);
        let Event::BookingCreated { booking } = &first else {
            unreachable!()
        };
        let events = vec![
            first.clone(),
            Event::StatusChanged {
                id: booking.id,
                resource_id: rid,
                status: BookingStatus::Cancelled,
                updated_at: 2,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap().events, events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_truncated_tail() {
        let path = tmp_path("truncation.wal");
        let event = created(Ulid::new(), 0, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap(); // length says 9, only 2 bytes follow
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![event]);
        assert_eq!(replay.valid_len + 6, fs::metadata(&path).unwrap().len());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_damaged_tail_so_appends_stay_readable() {
        let path = tmp_path("recover.wal");
        let first = created(Ulid::new(), 0, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xFF, 0x00, 0x00]).unwrap();
        }

        let recovered = Wal::recover(&path).unwrap();
        assert_eq!(recovered.events, vec![first.clone()]);
        assert_eq!(recovered.valid_len, intact);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        let second = created(Ulid::new(), 10, 20);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_leaves_clean_log_alone() {
        let path = tmp_path("recover_clean.wal");
        assert!(Wal::recover(&path).unwrap().events.is_empty());
        assert!(!path.exists());

        let event = created(Ulid::new(), 0, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        assert_eq!(Wal::recover(&path).unwrap().valid_len, len);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_buffered_and_written_bytes() {
        let path = tmp_path("rollback.wal");
        let kept = created(Ulid::new(), 0, 10);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();

        // Still in the buffer.
        wal.append_buffered(&created(Ulid::new(), 10, 20)).unwrap();
        wal.rollback().unwrap();
        assert_eq!(wal.appends_since_compact(), 1);

        // Reached the file, but the fsync failed.
        wal.append_buffered(&created(Ulid::new(), 20, 30)).unwrap();
        wal.fail_next_sync();
        assert!(wal.flush_sync().is_err());
        wal.rollback().unwrap();

        let next = created(Ulid::new(), 30, 40);
        wal.append(&next).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap().events, vec![kept, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().events.is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let good = created(Ulid::new(), 0, 10);
        let bad = created(Ulid::new(), 10, 20);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().events, vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let rid = Ulid::new();
        let keep = created(rid, 0, 100);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&keep).unwrap();
        for i in 0..20 {
            wal.append(&created(rid, 1000 + i * 10, 1005 + i * 10)).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let next = created(rid, 500, 600);
        wal.append(&next).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap().events, vec![keep, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_count_and_flush() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|i| created(Ulid::new(), i, i + 1)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
        let _ = fs::remove_file(&path);
    }
}
