use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const LEN_BYTES: usize = 4;
const CRC_BYTES: usize = 4;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut frame = Vec::with_capacity(LEN_BYTES + payload.len() + CRC_BYTES);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    writer.write_all(&frame)
}

enum Frame {
    Entry { event: Event, size: usize },
    End,
    Damaged(String),
}

/// Decode the frame at the front of `buf`.
fn decode_frame(buf: &[u8]) -> Frame {
    if buf.is_empty() {
        return Frame::End;
    }
    let Some((len, rest)) = buf.split_first_chunk::<LEN_BYTES>() else {
        return Frame::Damaged("short length prefix".into());
    };
    let len = u32::from_le_bytes(*len) as usize;
    if rest.len() < len + CRC_BYTES {
        return Frame::Damaged(format!("{len}-byte entry runs past end of file"));
    }
    let (payload, rest) = rest.split_at(len);
    let Some((crc, _)) = rest.split_first_chunk::<CRC_BYTES>() else {
        return Frame::Damaged("missing checksum".into());
    };
    if crc32fast::hash(payload) != u32::from_le_bytes(*crc) {
        return Frame::Damaged("crc mismatch".into());
    }
    match bincode::deserialize(payload) {
        Ok(event) => Frame::Entry {
            event,
            size: LEN_BYTES + len + CRC_BYTES,
        },
        Err(e) => Frame::Damaged(format!("undecodable entry ({e})")),
    }
}

/// What a replay recovered from the log.
#[derive(Debug)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Length of the intact prefix. Bytes past it belong to a torn or corrupt tail.
    pub intact_len: u64,
    pub file_len: u64,
}

impl Replay {
    pub fn damaged_bytes(&self) -> u64 {
        self.file_len - self.intact_len
    }
}

/// Append-only log of document saves.
///
/// New entries always follow the last intact one: `recover` cuts a damaged
/// tail off before the log is reopened for appending.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path`, truncate it to its intact prefix and open
    /// it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        if replay.damaged_bytes() > 0 {
            tracing::warn!(
                "wal {}: truncating {} damaged bytes after {} events",
                path.display(),
                replay.damaged_bytes(),
                replay.events.len()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.intact_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, replay.events))
    }

    fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn staged_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First compaction phase: write `events` to a sibling file and fsync it.
    /// The live log is untouched until `install_snapshot`.
    pub fn stage_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::staged_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Second compaction phase: rename the staged snapshot over the log.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        fs::rename(Self::staged_path(&self.path), &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::stage_snapshot(&self.path, events)?;
        self.install_snapshot()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Decode every intact event. Decoding stops at the first torn or corrupt
    /// entry; the file itself is left as it is.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        let mut offset = 0;
        loop {
            match decode_frame(&bytes[offset..]) {
                Frame::Entry { event, size } => {
                    events.push(event);
                    offset += size;
                }
                Frame::End => break,
                Frame::Damaged(reason) => {
                    tracing::warn!("wal {}: {reason} at byte {offset}", path.display());
                    break;
                }
            }
        }
        Ok(Replay {
            events,
            intact_len: offset as u64,
            file_len: bytes.len() as u64,
        })
    }
}
