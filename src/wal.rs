use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::{Event, ReservationStatus};

/// File header: magic plus format version. Entries follow.
const MAGIC: [u8; 4] = *b"TSYN";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())
}

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Records that frame correctly but could never have been committed.
fn check_record(event: &Event) -> Result<(), &'static str> {
    let window = match event {
        Event::AllocationCreated { window, .. } | Event::ReservationCreated { window, .. } => *window,
        Event::AllocationRestored(a) => {
            if !a.is_consistent() {
                return Err("allocation status disagrees with its return date");
            }
            a.window
        }
        Event::ReservationRestored(r) => {
            if r.allocation_id.is_some() && r.status != ReservationStatus::Completed {
                return Err("allocation linked to an unfulfilled reservation");
            }
            r.window
        }
        _ => return Ok(()),
    };
    if window.end < window.start {
        return Err("window ends before it starts");
    }
    Ok(())
}

enum Record {
    Event(Event),
    End,
    Torn(&'static str),
}

/// `Ok(false)` when the reader runs out before `buf` is full.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    if !fill(reader, &mut len_buf)? {
        return Ok(Record::End);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !fill(reader, &mut payload)? {
        return Ok(Record::Torn("truncated payload"));
    }
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut crc_buf)? {
        return Ok(Record::Torn("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Torn("checksum mismatch"));
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Record::Event(event),
        Err(_) => Record::Torn("undecodable event"),
    })
}

/// Append-only log of committed inventory events.
///
/// Layout: an 8-byte header (`TSYN`, u32 format version), then entries of
/// `[u32: len][bincode: Event][u32: crc32]`. A torn last entry is dropped on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`. A new or torn-header file gets a fresh header.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        if writer.get_ref().metadata()?.len() < HEADER_LEN {
            writer.get_ref().set_len(0)?;
            write_header(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event.
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

    /// Snapshot phase of compaction: header plus `events` into `<path>.wal.tmp`, fsynced.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(path.with_extension("wal.tmp"))?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Swap phase: the snapshot replaces the live log, which is reopened for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read back every committed event.
    ///
    /// A missing file or torn header is an empty log. A foreign header, an unknown
    /// version, or a record failing `check_record` is `InvalidData`.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN as usize];
        if !fill(&mut reader, &mut header)? {
            tracing::warn!(path = %path.display(), "WAL header incomplete, starting empty");
            return Ok(Vec::new());
        }
        if header[..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a toolsync WAL", path.display()),
            ));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported WAL format version {version}"),
            ));
        }

        let mut events = Vec::new();
        loop {
            match read_record(&mut reader)? {
                Record::Event(event) => {
                    if let Err(reason) = check_record(&event) {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("WAL record {} ({}): {reason}", events.len(), event.kind()),
                        ));
                    }
                    events.push(event);
                }
                Record::End => break,
                Record::Torn(reason) => {
                    tracing::warn!(
                        path = %path.display(),
                        kept = events.len(),
                        reason,
                        "discarding WAL tail"
                    );
                    break;
                }
            }
        }
        Ok(events)
    }
}
