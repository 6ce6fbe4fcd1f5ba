// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Recorded state of one track at one frame's capture time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackSnapshot {
    pub track_id: i32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub heading: f32,
    pub velocity: f32,
    pub identity: i32,
}

impl TrackSnapshot {
    #[must_use]
    pub fn identity_kind(&self) -> Option<TrackIdentity> {
        TrackIdentity::from_code(self.identity)
    }

    /// Identity name, or the raw code when it has none.
    #[must_use]
    pub fn identity_label(&self) -> String {
        self.identity_kind()
            .map_or_else(|| self.identity.to_string(), |id| id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TrackIdentity {
    Default = 0,
    Unknown = 1,
    Friend = 2,
    Hostile = 3,
}

impl fmt::Display for TrackIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Unknown => write!(f, "unknown"),
            Self::Friend => write!(f, "friend"),
            Self::Hostile => write!(f, "hostile"),
        }
    }
}

impl TrackIdentity {
    /// Converts a raw identity code, returning `None` for codes the live system
    /// never assigns. Such codes are still recorded and replayed unchanged.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Default),
            1 => Some(Self::Unknown),
            2 => Some(Self::Friend),
            3 => Some(Self::Hostile),
            _ => None,
        }
    }

    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Read side of the live track repository.
pub trait TrackSource {
    /// Returns the track set present at call time.
    fn list_current_tracks(&self) -> Vec<TrackSnapshot>;
}

impl<T: TrackSource + ?Sized> TrackSource for &T {
    fn list_current_tracks(&self) -> Vec<TrackSnapshot> {
        (**self).list_current_tracks()
    }
}

impl<T: TrackSource + ?Sized> TrackSource for Arc<T> {
    fn list_current_tracks(&self) -> Vec<TrackSnapshot> {
        (**self).list_current_tracks()
    }
}

/// Current track set keyed by track id, shared between a feed and the recorder.
#[derive(Clone, Default)]
pub struct TrackTable {
    tracks: Arc<Mutex<BTreeMap<i32, TrackSnapshot>>>,
}

impl TrackTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer leaves the map itself intact, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<i32, TrackSnapshot>> {
        self.tracks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert(&self, snapshot: TrackSnapshot) {
        self.lock().insert(snapshot.track_id, snapshot);
    }

    pub fn remove(&self, track_id: i32) -> bool {
        self.lock().remove(&track_id).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TrackSource for TrackTable {
    fn list_current_tracks(&self) -> Vec<TrackSnapshot> {
        self.lock().values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: i32, x: f32) -> TrackSnapshot {
        TrackSnapshot {
            track_id: id,
            x,
            identity: TrackIdentity::Friend.code(),
            ..TrackSnapshot::default()
        }
    }

    #[test]
    fn identity_codes() {
        assert_eq!(TrackIdentity::from_code(3), Some(TrackIdentity::Hostile));
        assert_eq!(TrackIdentity::from_code(0), Some(TrackIdentity::Default));
        assert_eq!(TrackIdentity::from_code(7), None);
        assert_eq!(TrackIdentity::Unknown.code(), 1);
        assert_eq!(TrackIdentity::Friend.to_string(), "friend");

        assert_eq!(track(1, 0.0).identity_label(), "friend");
        let odd = TrackSnapshot {
            identity: 42,
            ..track(1, 0.0)
        };
        assert_eq!(odd.identity_label(), "42");
    }

    #[test]
    fn table_upsert_replaces_by_id() {
        let table = TrackTable::new();
        table.upsert(track(5, 1.0));
        table.upsert(track(2, 2.0));
        table.upsert(track(5, 9.0));

        let tracks = table.list_current_tracks();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].track_id, 2);
        assert_eq!(tracks[1].track_id, 5);
        assert!((tracks[1].x - 9.0).abs() < f32::EPSILON);
    }

    #[test]
    fn table_remove_and_clear() {
        let table = TrackTable::new();
        table.upsert(track(1, 0.0));
        table.upsert(track(2, 0.0));

        assert!(table.remove(1));
        assert!(!table.remove(1));
        assert_eq!(table.len(), 1);

        table.clear();
        assert!(table.is_empty());
        assert!(table.list_current_tracks().is_empty());
    }

    #[test]
    fn clones_share_the_same_tracks() {
        let table = TrackTable::new();
        let view = table.clone();
        table.upsert(track(11, 3.5));
        assert_eq!(view.list_current_tracks().len(), 1);
        assert_eq!((&view).list_current_tracks()[0].track_id, 11);
    }

    #[test]
    fn poisoned_table_keeps_its_tracks() {
        let table = TrackTable::new();
        table.upsert(track(3, 1.0));
        table.upsert(track(8, 2.0));

        let shared = table.clone();
        let result = std::thread::spawn(move || {
            let _guard = shared.tracks.lock().unwrap();
            panic!("feed thread died while holding the lock");
        })
        .join();
        assert!(result.is_err());
        assert!(table.tracks.is_poisoned());

        let ids: Vec<_> = table
            .list_current_tracks()
            .iter()
            .map(|t| t.track_id)
            .collect();
        assert_eq!(ids, [3, 8]);

        table.upsert(track(9, 0.0));
        assert!(table.remove(3));
        assert_eq!(table.len(), 2);
    }
}
