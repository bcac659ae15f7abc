use crate::{
    binning::Bin,
    error::{Error, Result},
    event::{Event, Totals},
    storage::{DiskBuffer, FileSlot},
    tree::{BoundingBox, Centroid, Shape},
};
use parking_lot::{RwLock, RwLockReadGuard};

/// Where the events of a [`LeafBox`] currently live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Residency {
    /// Only in memory, the leaf has no slot in a backing file.
    #[default]
    InMemory,
    /// In the backing file. Events added since it was written wait in memory.
    OnDisk,
    /// In the backing file, with a copy loaded in memory.
    Both,
}

#[derive(Debug, Default)]
pub(crate) struct LeafData<const D: usize> {
    /// All the events for `InMemory` and `Both`, the pending additions for `OnDisk`.
    pub(crate) events: Vec<Event<D>>,
    totals: Totals,
    residency: Residency,
    slot: Option<FileSlot>,
    dirty: bool,
    /// Events this leaf counts in the loaded total of the backing file.
    accounted: u64,
}

impl<const D: usize> LeafData<D> {
    fn push(&mut self, event: Event<D>) {
        self.totals.push(&event);
        self.events.push(event);
        self.dirty = true;
    }

    fn account(&mut self, disk: &DiskBuffer<D>) {
        let now = match self.residency {
            Residency::Both => self.events.len() as u64,
            _ => 0,
        };
        match now >= self.accounted {
            true => disk.note_loaded(now - self.accounted),
            false => disk.note_released(self.accounted - now),
        }
        self.accounted = now;
    }

    fn on_disk_slot(&self) -> Option<FileSlot> {
        self.slot.filter(|_| self.residency == Residency::OnDisk)
    }

    fn load(&mut self, disk: &DiskBuffer<D>) -> Result<bool> {
        let Some(slot) = self.on_disk_slot() else {
            return Ok(false);
        };

        let mut events = Vec::new();
        disk.read_events(slot, &mut events)?;
        events.append(&mut self.events);
        self.events = events;
        self.residency = Residency::Both;
        self.account(disk);

        Ok(true)
    }

    fn save(&mut self, disk: &DiskBuffer<D>) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.load(disk)?;

        let count = self.events.len() as u64;
        let slot = match self.slot.take() {
            Some(slot) if slot.count == count => Some(slot),
            previous => {
                if let Some(previous) = previous {
                    disk.free(previous);
                }
                (count > 0).then(|| disk.allocate(count))
            }
        };

        match slot {
            Some(slot) => {
                self.slot = Some(slot);
                disk.write_events(slot, &self.events)?;
                self.residency = Residency::Both;
            }
            None => self.residency = Residency::InMemory,
        }
        self.dirty = false;
        self.account(disk);

        Ok(())
    }

    fn release(&mut self, disk: &DiskBuffer<D>) -> Result<()> {
        if self.residency == Residency::OnDisk {
            return Ok(());
        }
        self.save(disk)?;

        if self.slot.is_some() {
            self.events = Vec::new();
            self.residency = Residency::OnDisk;
        }
        self.account(disk);

        Ok(())
    }
}

/// A leaf of the tree, holding an unordered collection of events inside its extents.
///
/// The events live behind a lock so that concurrent tasks can add events to different leaves
/// through shared references, and so that loading from the backing file doesn't need exclusive
/// access to the tree. Operations changing the shape of the tree take `&mut self`.
#[derive(Debug)]
pub struct LeafBox<const D: usize> {
    id: u64,
    depth: usize,
    extents: BoundingBox<[f32; D]>,
    data: RwLock<LeafData<D>>,
}

impl<const D: usize> LeafBox<D> {
    /// Creates a new empty [`LeafBox`].
    #[inline]
    pub fn new(id: u64, depth: usize, extents: BoundingBox<[f32; D]>) -> Self {
        Self {
            id,
            depth,
            extents,
            data: RwLock::default(),
        }
    }

    /// Creates a new in-memory [`LeafBox`] holding the given events.
    pub fn from_events(
        id: u64,
        depth: usize,
        extents: BoundingBox<[f32; D]>,
        events: Vec<Event<D>>,
    ) -> Self {
        let data = LeafData {
            totals: Totals::of(&events),
            dirty: !events.is_empty(),
            events,
            ..Default::default()
        };

        Self {
            id,
            depth,
            extents,
            data: RwLock::new(data),
        }
    }

    /// Creates a leaf whose events are in a slot of the backing file.
    pub(crate) fn on_disk(
        id: u64,
        depth: usize,
        extents: BoundingBox<[f32; D]>,
        totals: Totals,
        slot: FileSlot,
    ) -> Self {
        let data = match slot.count {
            0 => LeafData::default(),
            _ => LeafData {
                totals,
                residency: Residency::OnDisk,
                slot: Some(slot),
                ..Default::default()
            },
        };

        Self {
            id,
            depth,
            extents,
            data: RwLock::new(data),
        }
    }

    /// Returns the id of the box.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the depth of the box, 0 for the root.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns the extents of the box.
    #[inline]
    pub fn extents(&self) -> &BoundingBox<[f32; D]> {
        &self.extents
    }

    /// Returns the totals of the events of the box, whether loaded or not.
    #[inline]
    pub fn totals(&self) -> Totals {
        self.data.read().totals
    }

    /// Returns the number of events in the box.
    #[inline]
    pub fn n_points(&self) -> u64 {
        self.totals().n_points
    }

    /// Returns where the events of the box live.
    #[inline]
    pub fn residency(&self) -> Residency {
        self.data.read().residency
    }

    /// Returns the slot of the box in the backing file, if it has one.
    #[inline]
    pub fn file_slot(&self) -> Option<FileSlot> {
        self.data.read().slot
    }

    /// Returns `true` if the events in memory differ from the backing file.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.data.read().dirty
    }

    /// Adds an event. The caller is responsible for the event lying inside the extents.
    #[inline]
    pub fn add_event(&self, event: Event<D>) {
        self.data.write().push(event);
    }

    /// Adds events. The caller is responsible for the events lying inside the extents.
    pub fn add_events(&self, events: &[Event<D>]) {
        let mut data = self.data.write();
        data.events.reserve(events.len());
        for &event in events {
            data.push(event);
        }
    }

    /// Calls `f` with all the events of the box.
    ///
    /// Events of a box that is only on disk are read into a temporary buffer; the box itself is
    /// left unloaded.
    pub fn with_events<R>(
        &self,
        disk: Option<&DiskBuffer<D>>,
        f: impl FnOnce(&[Event<D>]) -> R,
    ) -> Result<R> {
        let data = self.data.read();
        let Some(slot) = data.on_disk_slot() else {
            return Ok(f(&data.events));
        };

        let disk = disk.ok_or(Error::NotFileBacked)?;
        let mut events = Vec::new();
        disk.read_events(slot, &mut events)?;
        events.extend_from_slice(&data.events);

        Ok(f(&events))
    }

    /// Returns a copy of all the events of the box.
    #[inline]
    pub fn events(&self, disk: Option<&DiskBuffer<D>>) -> Result<Vec<Event<D>>> {
        self.with_events(disk, <[Event<D>]>::to_vec)
    }

    /// Loads the events of the box from the backing file, returning `true` if they were only on
    /// disk before.
    pub fn load(&self, disk: &DiskBuffer<D>) -> Result<bool> {
        self.data.write().load(disk)
    }

    /// Writes the events of the box to the backing file if they changed since the last write.
    ///
    /// The box keeps its slot when the number of events is unchanged, otherwise the old slot is
    /// freed and a new one allocated.
    pub fn save(&self, disk: &DiskBuffer<D>) -> Result<()> {
        self.data.write().save(disk)
    }

    /// Saves the box and drops its events from memory.
    pub fn release(&self, disk: &DiskBuffer<D>) -> Result<()> {
        self.data.write().release(disk)
    }

    /// Drops the loaded events if they are identical to the backing file.
    pub(crate) fn evict_if_clean(&self, disk: &DiskBuffer<D>) -> bool {
        let mut data = self.data.write();
        match (data.residency, data.dirty) {
            (Residency::Both, false) => {
                data.events = Vec::new();
                data.residency = Residency::OnDisk;
                data.account(disk);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn read_data(&self) -> RwLockReadGuard<'_, LeafData<D>> {
        self.data.read()
    }

    /// Removes all the events from the box, freeing its slot in the backing file.
    pub(crate) fn take_events(&mut self, disk: Option<&DiskBuffer<D>>) -> Result<Vec<Event<D>>> {
        let data = self.data.get_mut();
        let Some(disk) = disk else {
            return match data.on_disk_slot() {
                Some(_) => Err(Error::NotFileBacked),
                None => Ok(std::mem::take(data).events),
            };
        };

        data.load(disk)?;
        if let Some(slot) = data.slot.take() {
            disk.free(slot);
        }
        let events = std::mem::take(&mut data.events);
        data.residency = Residency::InMemory;
        data.account(disk);
        *data = LeafData::default();

        Ok(events)
    }

    /// Recomputes the totals from the events in memory. Totals of boxes only on disk are kept
    /// up to date as events are added.
    pub(crate) fn refresh_cache(&mut self) {
        let data = self.data.get_mut();
        if data.residency != Residency::OnDisk {
            data.totals = Totals::of(&data.events);
        }
    }

    pub(crate) fn centerpoint_bin(
        &self,
        bin: &mut Bin<D>,
        disk: Option<&DiskBuffer<D>>,
    ) -> Result<()> {
        self.with_events(disk, |events| {
            for event in events.iter().filter(|e| bin.extents.contains(&e.center)) {
                bin.totals.push(event);
            }
        })
    }

    pub(crate) fn integrate(
        &self,
        shape: &impl Shape<D>,
        disk: Option<&DiskBuffer<D>>,
    ) -> Result<Totals> {
        self.with_events(disk, |events| {
            events
                .iter()
                .filter(|e| shape.contains(&e.center))
                .fold(Totals::default(), |mut totals, e| {
                    totals.push(e);
                    totals
                })
        })
    }

    pub(crate) fn centroid(
        &self,
        shape: &impl Shape<D>,
        disk: Option<&DiskBuffer<D>>,
        centroid: &mut Centroid<D>,
    ) -> Result<()> {
        self.with_events(disk, |events| {
            for event in events.iter().filter(|e| shape.contains(&e.center)) {
                centroid.push(event);
            }
        })
    }
}
