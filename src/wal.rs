use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Change;

/// One engine operation's changes. Written and replayed as a single unit.
pub type Commit = Vec<Change>;

/// Length prefix plus trailing checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Larger length prefixes are read as damage, not allocated.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Write one commit as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn write_frame(out: &mut impl Write, commit: &[Change]) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit too large for WAL"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

enum Frame {
    Commit(Commit, u64),
    End,
    Damaged(&'static str),
}

/// Read as much of `buf` as the input holds. Returns the byte count.
fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_frame(input: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match fill(input, &mut len_buf)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Damaged("torn length prefix")),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Damaged("implausible length"));
    }

    let mut payload = vec![0u8; len];
    if fill(input, &mut payload)? < len {
        return Ok(Frame::Damaged("torn payload"));
    }
    let mut crc_buf = [0u8; 4];
    if fill(input, &mut crc_buf)? < 4 {
        return Ok(Frame::Damaged("torn checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged("checksum mismatch"));
    }
    match bincode::deserialize::<Commit>(&payload) {
        Ok(commit) => Ok(Frame::Commit(commit, len as u64 + FRAME_OVERHEAD)),
        Err(_) => Ok(Frame::Damaged("undecodable payload")),
    }
}

/// Append-only log of commits, one frame per commit.
///
/// A commit is replayed whole or not at all: the first damaged frame ends
/// replay and everything after it is ignored.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Fail the append that would be number `n` since compaction, after
    /// writing a torn frame.
    #[cfg(test)]
    pub(crate) fail_at_append: Option<u64>,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            #[cfg(test)]
            fail_at_append: None,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn staging_path(&self) -> PathBuf {
        self.path.with_extension("wal.compacting")
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Buffer a commit. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, commit: &[Change]) -> io::Result<()> {
        #[cfg(test)]
        if self.fail_at_append == Some(self.appends_since_compact + 1) {
            self.writer.write_all(&[0xAB; 3])?;
            return Err(io::Error::other("injected append failure"));
        }
        write_frame(&mut self.writer, commit)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Append and sync a group of commits as one unit. If any part fails the
    /// file is cut back to its length before the group, so none of the
    /// group's commits replay.
    pub fn append_batch<'a>(
        &mut self,
        commits: impl IntoIterator<Item = &'a [Change]>,
    ) -> io::Result<()> {
        self.writer.flush()?;
        let start_len = self.writer.get_ref().metadata()?.len();
        let start_appends = self.appends_since_compact;
        let result = commits
            .into_iter()
            .try_for_each(|commit| self.append_buffered(commit))
            .and_then(|()| self.flush_sync());
        if let Err(e) = result {
            self.appends_since_compact = start_appends;
            if let Err(undo) = self.truncate_to(start_len) {
                warn!(
                    "{}: could not roll back failed append: {undo}",
                    self.path.display()
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Drop buffered bytes unwritten and cut the file to `len`.
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        let fresh = BufWriter::new(Self::open_append(&self.path)?);
        let (file, _unwritten) = std::mem::replace(&mut self.writer, fresh).into_parts();
        file.set_len(len)?;
        file.sync_all()
    }

    #[cfg(test)]
    pub fn append(&mut self, commit: &[Change]) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Replace the log with `snapshot` written as a single commit.
    ///
    /// The snapshot is synced to a staging file first and renamed over the
    /// log, so a crash leaves either the old log or the new one.
    pub fn compact(&mut self, snapshot: &[Change]) -> io::Result<()> {
        self.flush_sync()?;
        let staging = self.staging_path();
        {
            let mut out = BufWriter::new(File::create(&staging)?);
            if !snapshot.is_empty() {
                write_frame(&mut out, snapshot)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Every intact commit in the log at `path`. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay the log, cut off any damaged tail and open it for appending.
    /// Commits written afterwards land right behind the last intact one.
    pub fn open_recovered(path: &Path) -> io::Result<(Self, Vec<Commit>)> {
        let (commits, damaged_at) = Self::scan(path)?;
        if let Some(offset) = damaged_at {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, commits))
    }

    /// Intact commits, plus the byte offset where damage begins if any.
    fn scan(path: &Path) -> io::Result<(Vec<Commit>, Option<u64>)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
            Err(e) => return Err(e),
        };
        let mut input = BufReader::new(file);
        let mut commits = Vec::new();
        let mut offset = 0u64;
        loop {
            match read_frame(&mut input)? {
                Frame::Commit(commit, size) => {
                    commits.push(commit);
                    offset += size;
                }
                Frame::End => return Ok((commits, None)),
                Frame::Damaged(why) => {
                    warn!(
                        "{}: discarding WAL tail at byte {offset} ({why})",
                        path.display()
                    );
                    return Ok((commits, Some(offset)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("loadout_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn truck(name: &str) -> Change {
        Change::TruckUpserted(Truck {
            id: Ulid::new(),
            name: name.into(),
        })
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn commits_replay_in_order() {
        let path = tmp_path("replay_order.wal");
        let commits = vec![
            vec![truck("TRK1")],
            vec![
                Change::ReservationUpserted(Reservation {
                    id: Ulid::new(),
                    asset_id: Ulid::new(),
                    event_id: Ulid::new(),
                    span: Span::new(DAY, 2 * DAY),
                    status: ReservationStatus::Pending,
                }),
                Change::QuoteLineRemoved { id: Ulid::new() },
            ],
        ];

        let mut wal = Wal::open(&path).unwrap();
        for c in &commits {
            wal.append(c).unwrap();
        }
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), commits);
    }

    #[test]
    fn torn_commit_is_dropped_whole() {
        let path = tmp_path("torn.wal");
        let first = vec![truck("TRK1")];
        Wal::open(&path).unwrap().append(&first).unwrap();

        // Two-change commit cut off halfway through its payload
        let payload = bincode::serialize(&vec![truck("A"), truck("B")]).unwrap();
        append_raw(&path, &(payload.len() as u32).to_le_bytes());
        append_raw(&path, &payload[..payload.len() / 2]);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn torn_length_prefix_is_ignored() {
        let path = tmp_path("torn_len.wal");
        let first = vec![truck("TRK1")];
        Wal::open(&path).unwrap().append(&first).unwrap();
        append_raw(&path, &[7, 0]);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn recovery_truncates_damage_before_new_appends() {
        let path = tmp_path("recover.wal");
        let first = vec![truck("TRK1")];
        Wal::open(&path).unwrap().append(&first).unwrap();
        let intact = fs::metadata(&path).unwrap().len();
        append_raw(&path, &[9, 9, 9]);

        let (mut wal, commits) = Wal::open_recovered(&path).unwrap();
        assert_eq!(commits, vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        let second = vec![truck("TRK2")];
        wal.append(&second).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let payload = bincode::serialize(&vec![truck("TRK1")]).unwrap();
        append_raw(&path, &(payload.len() as u32).to_le_bytes());
        append_raw(&path, &payload);
        append_raw(&path, &0xDEAD_BEEFu32.to_le_bytes());
        // An intact commit after the damage is not trusted either
        Wal::open(&path).unwrap().append(&[truck("LATER")]).unwrap();

        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compaction_shrinks_log_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let snapshot = vec![truck("KEEP1"), truck("KEEP2")];
        let after = vec![truck("NEW")];

        let mut wal = Wal::open(&path).unwrap();
        for i in 0..20 {
            wal.append(&[truck(&format!("T{i}"))]).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 20);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);
        assert!(!wal.staging_path().exists());

        wal.append(&after).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot, after]);
    }

    #[test]
    fn empty_snapshot_leaves_empty_log() {
        let path = tmp_path("compact_empty.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&[truck("GONE")]).unwrap();
        wal.compact(&[]).unwrap();
        drop(wal);

        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn failed_batch_leaves_no_trace() {
        let path = tmp_path("failed_batch.wal");
        let first = vec![truck("TRK1")];
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&first).unwrap();
        let intact = fs::metadata(&path).unwrap().len();

        // Third commit of the group fails after two frames were buffered
        wal.fail_at_append = Some(4);
        let group: Vec<Commit> = (0..3).map(|i| vec![truck(&format!("G{i}"))]).collect();
        assert!(wal.append_batch(group.iter().map(Vec::as_slice)).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
        assert_eq!(wal.appends_since_compact(), 1);

        wal.fail_at_append = None;
        let later = vec![truck("LATER")];
        wal.append_batch([later.as_slice()]).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let commits: Vec<Commit> = (0..5).map(|i| vec![truck(&format!("T{i}"))]).collect();

        let mut wal = Wal::open(&path).unwrap();
        for c in &commits {
            wal.append_buffered(c).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);
        wal.flush_sync().unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), commits);
    }
}
