use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::datastore::{DocumentStore, RawEntry, StoreError};
use crate::entry::{Day, Entry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Loading,
    Ready,
}

/// Every entry of one calendar year, keyed by day. Replaced wholesale on
/// refresh and never patched in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarSnapshot {
    year: i32,
    status: SnapshotStatus,
    entries: BTreeMap<Day, Entry>,
}

impl CalendarSnapshot {
    pub fn loading(year: i32) -> Self {
        Self {
            year,
            status: SnapshotStatus::Loading,
            entries: BTreeMap::new(),
        }
    }

    /// Builds a ready snapshot. Records for another year or with invalid
    /// fields are skipped, and a later record for the same day replaces an
    /// earlier one.
    pub fn from_records(year: i32, records: Vec<RawEntry>) -> Self {
        let mut entries = BTreeMap::new();
        for record in records {
            if record.year != year {
                warn!(id = %record.id, record_year = record.year, year, "skipping record for another year");
                continue;
            }
            match Entry::try_from(record) {
                Ok(entry) => {
                    if let Some(previous) = entries.insert(entry.day, entry) {
                        warn!(id = %previous.id, "duplicate record for day, keeping the last one");
                    }
                }
                Err(err) => warn!(error = %err, "skipping invalid record"),
            }
        }

        Self {
            year,
            status: SnapshotStatus::Ready,
            entries,
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn status(&self) -> SnapshotStatus {
        self.status
    }

    pub fn is_loading(&self) -> bool {
        self.status == SnapshotStatus::Loading
    }

    pub fn get(&self, day: u32) -> Option<&Entry> {
        Day::new(day).and_then(|day| self.entries.get(&day))
    }

    pub fn entry(&self, day: Day) -> Option<&Entry> {
        self.entries.get(&day)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to load calendar entries for {year}: {source}")]
pub struct RefreshError {
    pub year: i32,
    #[source]
    pub source: StoreError,
}

/// Sole owner and writer of the calendar snapshot. Readers either take the
/// latest published snapshot or subscribe to every replacement.
#[derive(Debug)]
pub struct CalendarStore<S> {
    store: S,
    published: watch::Sender<Arc<CalendarSnapshot>>,
}

impl<S: DocumentStore> CalendarStore<S> {
    pub fn new(store: S, year: i32) -> Self {
        let (published, _) = watch::channel(Arc::new(CalendarSnapshot::loading(year)));
        Self { store, published }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn snapshot(&self) -> Arc<CalendarSnapshot> {
        Arc::clone(&self.published.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<CalendarSnapshot>> {
        self.published.subscribe()
    }

    /// Reloads every entry of `year` and publishes the result. On failure the
    /// previous entries stay published and the status returns to ready.
    #[instrument(skip(self))]
    pub fn refresh(&self, year: i32) -> Result<Arc<CalendarSnapshot>, RefreshError> {
        self.published.send_if_modified(|snapshot| {
            if snapshot.is_loading() {
                return false;
            }
            Arc::make_mut(snapshot).status = SnapshotStatus::Loading;
            true
        });

        match self.store.query_by_year(year) {
            Ok(records) => {
                let fresh = Arc::new(CalendarSnapshot::from_records(year, records));
                info!(year, entries = fresh.len(), "published calendar snapshot");
                self.published.send_replace(Arc::clone(&fresh));
                Ok(fresh)
            }
            Err(source) => {
                warn!(year, error = %source, "calendar refresh failed, keeping previous snapshot");
                self.published.send_modify(|snapshot| {
                    Arc::make_mut(snapshot).status = SnapshotStatus::Ready;
                });
                Err(RefreshError { year, source })
            }
        }
    }
}
