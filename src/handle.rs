//! Socket handle registry: stable integer identifiers mapped to live
//! records. Identifiers survive the record (a stale id simply fails to
//! resolve), which is what makes post-close queries safe.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex};

use crate::socket::Socket;

/// Opaque socket identifier: generation in the high 32 bits, 1-based map
/// row in the low 32. A recycled row gets a new generation, so ids from a
/// previous life of the row miss on lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(NonZeroU64);

impl SocketId {
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(SocketId)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0.get()
    }

    fn index(self) -> usize {
        ((self.0.get() & 0xffff_ffff) - 1) as usize
    }

    fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    fn compose(generation: u32, index: usize) -> Self {
        let raw = ((generation as u64) << 32) | (index as u64 + 1);
        SocketId(NonZeroU64::new(raw).unwrap())
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0.get())
    }
}

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

struct Row {
    generation: u32,
    value: Option<Arc<Socket>>,
}

struct Rows {
    entries: Vec<Row>,
    free: Vec<u32>,
}

/// Id-to-record map. Reservation, lookup and free are serialized
/// internally; record destruction is whoever drops the last guard.
pub(crate) struct HandleMap {
    rows: Mutex<Rows>,
}

impl HandleMap {
    pub(crate) fn new(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| Row {
                generation: 1,
                value: None,
            })
            .collect();
        let free = (0..capacity as u32).rev().collect();
        HandleMap {
            rows: Mutex::new(Rows { entries, free }),
        }
    }

    /// Claim a free row and return its id, or None on exhaustion.
    pub(crate) fn reserve(&self) -> Option<SocketId> {
        let mut rows = self.rows.lock().unwrap();
        let index = rows.free.pop()? as usize;
        Some(SocketId::compose(rows.entries[index].generation, index))
    }

    pub(crate) fn set(&self, id: SocketId, record: Arc<Socket>) {
        let mut rows = self.rows.lock().unwrap();
        let row = &mut rows.entries[id.index()];
        debug_assert_eq!(row.generation, id.generation());
        row.value = Some(record);
    }

    pub(crate) fn lookup(&self, id: SocketId) -> Option<Arc<Socket>> {
        let rows = self.rows.lock().unwrap();
        let row = rows.entries.get(id.index())?;
        if row.generation != id.generation() {
            return None;
        }
        row.value.clone()
    }

    /// Decouple the id from its record immediately; subsequent lookups
    /// return None. Returns the map's own guard so the caller controls
    /// where the potential last release happens.
    pub(crate) fn free(&self, id: SocketId) -> Option<Arc<Socket>> {
        let mut rows = self.rows.lock().unwrap();
        let index = id.index();
        let row = rows.entries.get_mut(index)?;
        if row.generation != id.generation() {
            return None;
        }
        let taken = row.value.take()?;
        row.generation = row.generation.wrapping_add(1);
        rows.free.push(index as u32);
        Some(taken)
    }

    /// Drop every record. Used by module shutdown to break the
    /// record-to-system reference cycle.
    pub(crate) fn clear(&self) {
        let mut rows = self.rows.lock().unwrap();
        let Rows { entries, free } = &mut *rows;
        for (index, row) in entries.iter_mut().enumerate() {
            if row.value.take().is_some() {
                row.generation = row.generation.wrapping_add(1);
                free.push(index as u32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_encoding() {
        let id = SocketId::compose(3, 7);
        assert_eq!(id.index(), 7);
        assert_eq!(id.generation(), 3);
        assert_eq!(SocketId::from_raw(id.raw()), Some(id));
        assert_eq!(SocketId::from_raw(0), None);
    }

    #[test]
    fn reserve_exhaustion() {
        let map = HandleMap::new(2);
        let a = map.reserve().unwrap();
        let b = map.reserve().unwrap();
        assert_ne!(a, b);
        assert!(map.reserve().is_none());
    }

    #[test]
    fn reserved_rows_do_not_resolve() {
        let map = HandleMap::new(2);
        let id = map.reserve().unwrap();
        // Reserved but never set: lookups and frees both miss.
        assert!(map.lookup(id).is_none());
        assert!(map.free(id).is_none());
    }
}
