//! Backing file of a workspace.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Header (64 bytes): magic, version, D, record size, footer offset │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Event region, addressed in events as (offset, count) slabs       │
//! │   record: [coords: f32; D][signal: f32][error_squared: f32]      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Footer: dimensions, experiment infos, controller config,         │
//! │         one row per node id, free-space blocks                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All values are little endian. The footer sits right after the event region and is rewritten
//! on every structural save; growing the event region overwrites it.

use crate::{
    controller::BoxControllerConfig,
    error::{Error, Result},
    tree::BoundingBox,
    workspace::{Dimension, ExperimentInfo},
    Event,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

/// Magic bytes at the start of every backing file.
pub const MAGIC: [u8; 8] = *b"MDEVTREE";

/// Current format version.
pub const VERSION: u32 = 1;

/// Fixed size of the header in bytes.
pub const HEADER_SIZE: u64 = 64;

/// A contiguous run of events in the event region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FileSlot {
    /// Position of the first event, in events.
    pub offset: u64,
    /// Number of events.
    pub count: u64,
}

impl FileSlot {
    /// Creates a new [`FileSlot`].
    #[inline]
    pub const fn new(offset: u64, count: u64) -> Self {
        Self { offset, count }
    }

    /// Returns the position right after the slot.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.offset + self.count
    }
}

/// Kind of a persisted node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    /// A leaf box holding events.
    Leaf = 0,
    /// A grid box holding children.
    Grid = 1,
}

impl TryFrom<u8> for NodeKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::Leaf),
            1 => Ok(Self::Grid),
            other => Err(other),
        }
    }
}

/// One row of the box-structure table.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRow<const D: usize> {
    /// Id of the node.
    pub id: u64,
    /// Leaf or grid.
    pub kind: NodeKind,
    /// Distance from the root.
    pub depth: u32,
    /// Events of a leaf, empty for grids and leaves without events.
    pub events: FileSlot,
    /// Cached signal.
    pub signal: f64,
    /// Cached squared error.
    pub error_squared: f64,
    /// Cached number of events.
    pub n_points: u64,
    /// `1 / volume` of the node.
    pub inverse_volume: f64,
    /// Extents of the node.
    pub extents: BoundingBox<[f32; D]>,
    /// First child id and number of children of a grid.
    pub children: (u64, u64),
}

/// Everything stored in the footer.
#[derive(Clone, Debug)]
pub struct Footer<const D: usize> {
    /// Descriptors of the dimensions.
    pub dimensions: Vec<Dimension>,
    /// Metadata attached to the workspace.
    pub experiment_infos: Vec<ExperimentInfo>,
    /// Configuration of the controller.
    pub config: BoxControllerConfig,
    /// Next id the controller hands out.
    pub next_id: u64,
    /// One row per node, sorted by id.
    pub rows: Vec<NodeRow<D>>,
    /// Reclaimed blocks of the event region.
    pub free: Vec<FileSlot>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    /// Length of the event region, in events.
    end: u64,
    /// Reclaimed blocks, keyed by offset.
    free: BTreeMap<u64, u64>,
}

/// Backing file of a workspace and its free-space bookkeeping.
///
/// The file handle and the free list sit behind one lock: slab reads and writes, allocation and
/// structural saves are serialised on it.
#[derive(Debug)]
pub struct DiskBuffer<const D: usize> {
    path: PathBuf,
    state: Mutex<FileState>,
    loaded: AtomicU64,
}

impl<const D: usize> DiskBuffer<D> {
    /// Size of one event record in bytes.
    pub const RECORD_SIZE: u64 = 4 * (D as u64 + 2);

    /// Creates a new, empty backing file, truncating any existing file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(Error::io("creating backing file", &path))?;

        let buffer = Self {
            path,
            state: Mutex::new(FileState {
                file,
                end: 0,
                free: BTreeMap::new(),
            }),
            loaded: AtomicU64::new(0),
        };

        {
            let mut state = buffer.state.lock();
            buffer.write_header(&mut state, 0, 0)?;
        }

        Ok(buffer)
    }

    /// Opens an existing backing file and reads its footer.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Footer<D>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(Error::io("opening backing file", &path))?;

        let format = |reason: &str| Error::Format {
            path: path.clone(),
            reason: reason.to_owned(),
        };

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)
            .map_err(|_| format("file is shorter than its header"))?;

        let mut cursor = Cursor::new(&header[..]);
        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic).map_err(Error::io("reading header", &path))?;
        if magic != MAGIC {
            return Err(format("bad magic number"));
        }

        let read = |r: io::Result<u64>| r.map_err(Error::io("reading header", &path));
        let version = read(cursor.read_u32::<LittleEndian>().map(u64::from))?;
        let dims = read(cursor.read_u32::<LittleEndian>().map(u64::from))?;
        let record_size = read(cursor.read_u32::<LittleEndian>().map(u64::from))?;
        let _reserved = read(cursor.read_u32::<LittleEndian>().map(u64::from))?;
        let footer_offset = read(cursor.read_u64::<LittleEndian>())?;
        let footer_len = read(cursor.read_u64::<LittleEndian>())?;
        let end = read(cursor.read_u64::<LittleEndian>())?;

        if version != u64::from(VERSION) {
            return Err(format("unsupported format version"));
        }
        Error::check_len(D, dims as usize, "backing file")?;
        if record_size != Self::RECORD_SIZE {
            return Err(format("unexpected event record size"));
        }
        let region = end
            .checked_mul(Self::RECORD_SIZE)
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE));
        if region != Some(footer_offset) {
            return Err(format("footer does not follow the event region"));
        }

        let file_len = file
            .metadata()
            .map_err(Error::io("reading header", &path))?
            .len();
        if footer_offset.checked_add(footer_len).map_or(true, |end| end > file_len) {
            return Err(format("footer runs past the end of the file"));
        }

        let mut bytes = vec![0u8; footer_len as usize];
        file.seek(SeekFrom::Start(footer_offset))
            .and_then(|_| file.read_exact(&mut bytes))
            .map_err(|_| format("truncated footer"))?;

        let footer = decode_footer::<D>(&bytes).map_err(|e| format(&e.to_string()))?;

        let mut free = BTreeMap::new();
        for slot in &footer.free {
            free.insert(slot.offset, slot.count);
        }

        let buffer = Self {
            path,
            state: Mutex::new(FileState { file, end, free }),
            loaded: AtomicU64::new(0),
        };

        Ok((buffer, footer))
    }

    /// Returns the path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the length of the event region and the number of free blocks.
    pub fn usage(&self) -> (u64, usize) {
        let state = self.state.lock();
        (state.end, state.free.len())
    }

    /// Returns the reclaimed blocks, sorted by offset.
    pub fn free_blocks(&self) -> Vec<FileSlot> {
        let state = self.state.lock();
        state
            .free
            .iter()
            .map(|(&offset, &count)| FileSlot::new(offset, count))
            .collect()
    }

    /// Reserves room for `count` events, reusing a reclaimed block when one is large enough.
    pub fn allocate(&self, count: u64) -> FileSlot {
        let mut state = self.state.lock();

        let fit = state
            .free
            .iter()
            .find(|(_, &len)| len >= count)
            .map(|(&offset, &len)| (offset, len));

        match fit {
            Some((offset, len)) => {
                state.free.remove(&offset);
                if len > count {
                    state.free.insert(offset + count, len - count);
                }
                FileSlot::new(offset, count)
            }
            None => {
                let slot = FileSlot::new(state.end, count);
                state.end += count;
                slot
            }
        }
    }

    /// Gives a slot back, merging it with neighbouring free blocks.
    pub fn free(&self, slot: FileSlot) {
        if slot.count == 0 {
            return;
        }

        let mut state = self.state.lock();
        let mut offset = slot.offset;
        let mut count = slot.count;

        let before = state
            .free
            .range(..offset)
            .next_back()
            .map(|(&o, &c)| (o, c));
        if let Some((o, c)) = before {
            if o + c == offset {
                state.free.remove(&o);
                offset = o;
                count += c;
            }
        }

        if let Some(c) = state.free.remove(&(offset + count)) {
            count += c;
        }

        if offset + count == state.end {
            state.end = offset;
        } else {
            state.free.insert(offset, count);
        }
    }

    /// Writes events to a slot previously returned by [`allocate`](Self::allocate).
    pub fn write_events(&self, slot: FileSlot, events: &[Event<D>]) -> Result<()> {
        debug_assert_eq!(slot.count, events.len() as u64, "slot does not fit the events");

        let mut bytes = Vec::with_capacity(events.len() * Self::RECORD_SIZE as usize);
        for event in events {
            encode_event(&mut bytes, event).map_err(Error::io("encoding events", &self.path))?;
        }

        let mut state = self.state.lock();
        state
            .file
            .seek(SeekFrom::Start(Self::byte_offset(slot.offset)))
            .and_then(|_| state.file.write_all(&bytes))
            .map_err(Error::io("writing events", &self.path))
    }

    /// Reads the events of a slot, appending them to `out`.
    pub fn read_events(&self, slot: FileSlot, out: &mut Vec<Event<D>>) -> Result<()> {
        let mut bytes;
        {
            let mut state = self.state.lock();
            if slot.offset.checked_add(slot.count).map_or(true, |end| end > state.end) {
                return Err(Error::Format {
                    path: self.path.clone(),
                    reason: format!("slot {slot:?} lies outside the event region"),
                });
            }

            bytes = vec![0u8; (slot.count * Self::RECORD_SIZE) as usize];
            state
                .file
                .seek(SeekFrom::Start(Self::byte_offset(slot.offset)))
                .and_then(|_| state.file.read_exact(&mut bytes))
                .map_err(Error::io("reading events", &self.path))?;
        }

        out.reserve(slot.count as usize);
        let mut cursor = Cursor::new(&bytes[..]);
        for _ in 0..slot.count {
            out.push(decode_event(&mut cursor).map_err(Error::io("decoding events", &self.path))?);
        }

        Ok(())
    }

    /// Writes the footer after the event region and points the header at it.
    pub fn write_footer(&self, footer: &Footer<D>) -> Result<()> {
        let mut state = self.state.lock();

        let mut footer = footer.clone();
        footer.free = state
            .free
            .iter()
            .map(|(&offset, &count)| FileSlot::new(offset, count))
            .collect();

        let mut bytes = Vec::new();
        encode_footer(&mut bytes, &footer).map_err(Error::io("encoding footer", &self.path))?;

        let offset = Self::byte_offset(state.end);
        state
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| state.file.write_all(&bytes))
            .and_then(|_| state.file.set_len(offset + bytes.len() as u64))
            .map_err(Error::io("writing footer", &self.path))?;

        let end = state.end;
        self.write_header(&mut state, bytes.len() as u64, end)
    }

    /// Forces everything written so far to the storage device.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        state
            .file
            .flush()
            .and_then(|_| state.file.sync_data())
            .map_err(Error::io("flushing backing file", &self.path))
    }

    /// Returns the number of events currently held in memory by file-backed leaves.
    #[inline]
    pub fn loaded_events(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn note_loaded(&self, count: u64) {
        self.loaded.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn note_released(&self, count: u64) {
        // Saturating: leaves created before the file was attached were never counted.
        let _ = self
            .loaded
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |loaded| {
                Some(loaded.saturating_sub(count))
            });
    }

    #[inline]
    fn byte_offset(event: u64) -> u64 {
        HEADER_SIZE + event * Self::RECORD_SIZE
    }

    fn write_header(&self, state: &mut FileState, footer_len: u64, end: u64) -> Result<()> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE as usize);
        let io = Error::io("writing header", &self.path);

        let result = (|| -> io::Result<()> {
            bytes.write_all(&MAGIC)?;
            bytes.write_u32::<LittleEndian>(VERSION)?;
            bytes.write_u32::<LittleEndian>(D as u32)?;
            bytes.write_u32::<LittleEndian>(Self::RECORD_SIZE as u32)?;
            bytes.write_u32::<LittleEndian>(0)?;
            bytes.write_u64::<LittleEndian>(Self::byte_offset(end))?;
            bytes.write_u64::<LittleEndian>(footer_len)?;
            bytes.write_u64::<LittleEndian>(end)?;
            bytes.resize(HEADER_SIZE as usize, 0);

            state.file.seek(SeekFrom::Start(0))?;
            state.file.write_all(&bytes)
        })();

        result.map_err(io)
    }
}

fn encode_event<const D: usize>(w: &mut impl Write, event: &Event<D>) -> io::Result<()> {
    for c in event.center {
        w.write_f32::<LittleEndian>(c)?;
    }
    w.write_f32::<LittleEndian>(event.signal)?;
    w.write_f32::<LittleEndian>(event.error_squared)
}

fn decode_event<const D: usize>(r: &mut impl Read) -> io::Result<Event<D>> {
    let mut center = [0.0; D];
    for c in &mut center {
        *c = r.read_f32::<LittleEndian>()?;
    }
    let signal = r.read_f32::<LittleEndian>()?;
    let error_squared = r.read_f32::<LittleEndian>()?;

    Ok(Event::new(signal, error_squared, center))
}

fn write_string(w: &mut impl Write, s: &str) -> io::Result<()> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_string(r: &mut impl Read) -> io::Result<String> {
    let len = r.read_u32::<LittleEndian>()?;
    let mut bytes = Vec::new();
    r.take(u64::from(len)).read_to_end(&mut bytes)?;
    if bytes.len() != len as usize {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_usizes(w: &mut impl Write, values: &[usize]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(values.len() as u32)?;
    values
        .iter()
        .try_for_each(|&v| w.write_u64::<LittleEndian>(v as u64))
}

fn read_usizes(r: &mut impl Read) -> io::Result<Vec<usize>> {
    let len = r.read_u32::<LittleEndian>()?;
    (0..len)
        .map(|_| r.read_u64::<LittleEndian>().map(|v| v as usize))
        .collect()
}

fn encode_footer<const D: usize>(w: &mut impl Write, footer: &Footer<D>) -> io::Result<()> {
    w.write_u32::<LittleEndian>(footer.dimensions.len() as u32)?;
    for dim in &footer.dimensions {
        write_string(w, &dim.name)?;
        write_string(w, &dim.units)?;
        w.write_f32::<LittleEndian>(dim.min)?;
        w.write_f32::<LittleEndian>(dim.max)?;
    }

    w.write_u32::<LittleEndian>(footer.experiment_infos.len() as u32)?;
    for info in &footer.experiment_infos {
        write_string(w, &info.name)?;
        w.write_u64::<LittleEndian>(info.run_number)?;
        w.write_u32::<LittleEndian>(info.logs.len() as u32)?;
        for (key, value) in &info.logs {
            write_string(w, key)?;
            write_string(w, value)?;
        }
    }

    let config = &footer.config;
    write_usizes(w, &config.split_into)?;
    match &config.split_top_into {
        Some(top) => {
            w.write_u8(1)?;
            write_usizes(w, top)?;
        }
        None => w.write_u8(0)?,
    }
    w.write_u64::<LittleEndian>(config.split_threshold as u64)?;
    w.write_u64::<LittleEndian>(config.max_depth as u64)?;
    w.write_u64::<LittleEndian>(config.events_per_task as u64)?;
    w.write_u64::<LittleEndian>(config.tasks_per_block as u64)?;
    w.write_u64::<LittleEndian>(config.task_min_points)?;
    w.write_u64::<LittleEndian>(config.memory_limit_events)?;
    w.write_u64::<LittleEndian>(footer.next_id)?;

    w.write_u64::<LittleEndian>(footer.rows.len() as u64)?;
    for row in &footer.rows {
        w.write_u64::<LittleEndian>(row.id)?;
        w.write_u8(row.kind as u8)?;
        w.write_u32::<LittleEndian>(row.depth)?;
        w.write_u64::<LittleEndian>(row.events.offset)?;
        w.write_u64::<LittleEndian>(row.events.count)?;
        w.write_f64::<LittleEndian>(row.signal)?;
        w.write_f64::<LittleEndian>(row.error_squared)?;
        w.write_u64::<LittleEndian>(row.n_points)?;
        w.write_f64::<LittleEndian>(row.inverse_volume)?;
        for i in 0..D {
            w.write_f32::<LittleEndian>(row.extents.min[i])?;
            w.write_f32::<LittleEndian>(row.extents.max[i])?;
        }
        w.write_u64::<LittleEndian>(row.children.0)?;
        w.write_u64::<LittleEndian>(row.children.1)?;
    }

    w.write_u64::<LittleEndian>(footer.free.len() as u64)?;
    for slot in &footer.free {
        w.write_u64::<LittleEndian>(slot.offset)?;
        w.write_u64::<LittleEndian>(slot.count)?;
    }

    Ok(())
}

fn decode_footer<const D: usize>(bytes: &[u8]) -> io::Result<Footer<D>> {
    let r = &mut Cursor::new(bytes);
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_owned());

    let n_dims = r.read_u32::<LittleEndian>()?;
    let dimensions = (0..n_dims)
        .map(|_| {
            Ok(Dimension {
                name: read_string(r)?,
                units: read_string(r)?,
                min: r.read_f32::<LittleEndian>()?,
                max: r.read_f32::<LittleEndian>()?,
            })
        })
        .collect::<io::Result<Vec<_>>>()?;

    let n_infos = r.read_u32::<LittleEndian>()?;
    let mut experiment_infos = Vec::new();
    for _ in 0..n_infos {
        let mut info = ExperimentInfo::new(read_string(r)?, r.read_u64::<LittleEndian>()?);
        let n_logs = r.read_u32::<LittleEndian>()?;
        for _ in 0..n_logs {
            let key = read_string(r)?;
            let value = read_string(r)?;
            info.logs.insert(key, value);
        }
        experiment_infos.push(info);
    }

    let split_into = read_usizes(r)?;
    let split_top_into = match r.read_u8()? {
        0 => None,
        _ => Some(read_usizes(r)?),
    };
    let config = BoxControllerConfig {
        split_into,
        split_top_into,
        split_threshold: r.read_u64::<LittleEndian>()? as usize,
        max_depth: r.read_u64::<LittleEndian>()? as usize,
        events_per_task: r.read_u64::<LittleEndian>()? as usize,
        tasks_per_block: r.read_u64::<LittleEndian>()? as usize,
        task_min_points: r.read_u64::<LittleEndian>()?,
        memory_limit_events: r.read_u64::<LittleEndian>()?,
    };
    let next_id = r.read_u64::<LittleEndian>()?;

    let n_rows = r.read_u64::<LittleEndian>()?;
    let mut rows = Vec::new();
    for _ in 0..n_rows {
        let id = r.read_u64::<LittleEndian>()?;
        let kind = NodeKind::try_from(r.read_u8()?).map_err(|_| invalid("unknown node kind"))?;
        let depth = r.read_u32::<LittleEndian>()?;
        let events = FileSlot::new(r.read_u64::<LittleEndian>()?, r.read_u64::<LittleEndian>()?);
        let signal = r.read_f64::<LittleEndian>()?;
        let error_squared = r.read_f64::<LittleEndian>()?;
        let n_points = r.read_u64::<LittleEndian>()?;
        let inverse_volume = r.read_f64::<LittleEndian>()?;
        let mut extents = BoundingBox::new([0.0; D], [0.0; D]);
        for i in 0..D {
            extents.min[i] = r.read_f32::<LittleEndian>()?;
            extents.max[i] = r.read_f32::<LittleEndian>()?;
        }
        let children = (r.read_u64::<LittleEndian>()?, r.read_u64::<LittleEndian>()?);

        rows.push(NodeRow {
            id,
            kind,
            depth,
            events,
            signal,
            error_squared,
            n_points,
            inverse_volume,
            extents,
            children,
        });
    }

    let n_free = r.read_u64::<LittleEndian>()?;
    let free = (0..n_free)
        .map(|_| {
            Ok(FileSlot::new(
                r.read_u64::<LittleEndian>()?,
                r.read_u64::<LittleEndian>()?,
            ))
        })
        .collect::<io::Result<Vec<_>>>()?;

    Ok(Footer {
        dimensions,
        experiment_infos,
        config,
        next_id,
        rows,
        free,
    })
}
