use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const LEN_BYTES: usize = 4;
const CRC_BYTES: usize = 4;

/// Refuse to allocate for frames claiming to be larger than this.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "journal frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Why reading a frame stopped.
enum FrameRead {
    Event(Box<Event>),
    End,
    /// Torn write or corruption: everything from here on is dropped.
    BadTail(&'static str),
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<FrameRead> {
    let mut len_buf = [0u8; LEN_BYTES];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(FrameRead::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(FrameRead::BadTail("oversized frame"));
    }

    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(FrameRead::BadTail("truncated payload"));
    }
    let mut crc_buf = [0u8; CRC_BYTES];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(FrameRead::BadTail("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(FrameRead::BadTail("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(FrameRead::Event(Box::new(event))),
        Err(_) => Ok(FrameRead::BadTail("undecodable record")),
    }
}

/// Records recovered from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Set when a torn or corrupt tail was discarded.
    pub discarded_tail: Option<&'static str>,
}

/// Append-only journal of engine events.
///
/// Frame layout: `[u32 le: payload len][bincode Event][u32 le: crc32(payload)]`.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Append and fsync a single record.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.compact")
    }

    /// Write the compacted record set next to the journal. Slow; done before the swap.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the journal and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact record. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        loop {
            match read_frame(&mut reader)? {
                FrameRead::Event(event) => replay.events.push(*event),
                FrameRead::End => break,
                FrameRead::BadTail(why) => {
                    replay.discarded_tail = Some(why);
                    break;
                }
            }
        }
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Profile;
    use std::io::Seek;
    use ulid::Ulid;

    fn test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lessond_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn profile_event(name: &str) -> Event {
        Event::ProfileUpserted(Profile {
            id: Ulid::new(),
            display_name: Some(name.into()),
            full_name: None,
            avatar_url: None,
        })
    }

    #[test]
    fn append_then_replay() {
        let path = test_path("append_replay.wal");
        let events = vec![profile_event("a"), profile_event("b")];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 2);
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert!(replay.discarded_tail.is_none());
    }

    #[test]
    fn missing_file_is_empty() {
        let path = test_path("never_written.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
    }

    #[test]
    fn torn_tail_is_discarded() {
        let path = test_path("torn.wal");
        let first = profile_event("kept");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&profile_event("torn")).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first]);
        assert_eq!(replay.discarded_tail, Some("truncated checksum"));
    }

    #[test]
    fn flipped_byte_stops_replay() {
        let path = test_path("corrupt.wal");
        let first = profile_event("kept");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&profile_event("corrupted")).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(io::SeekFrom::Start(len - 6)).unwrap();
        file.write_all(&[0xff]).unwrap();

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first]);
        assert_eq!(replay.discarded_tail, Some("checksum mismatch"));
    }

    #[test]
    fn compaction_replaces_contents() {
        let path = test_path("compact.wal");
        let mut wal = Wal::open(&path).unwrap();
        for i in 0..5 {
            wal.append(&profile_event(&format!("p{i}"))).unwrap();
        }
        let survivor = profile_event("survivor");
        Wal::write_compact_file(&path, std::slice::from_ref(&survivor)).unwrap();
        wal.swap_compact_file().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after = profile_event("after");
        wal.append(&after).unwrap();
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![survivor, after]);
    }
}
