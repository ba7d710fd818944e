use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::datastore::{Decision, DocumentStore, EntryWrite, Outcome, StoreError, WriteTimestamp};
use crate::entry::{ClaimPayload, Day, Entry, Identity, SlotKey};

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("sign in to register an entry")]
    Unauthenticated,
    #[error("{year}-12-{day} is not on this calendar (year {calendar_year}, days 1-25)")]
    OutOfRange {
        year: i32,
        day: u32,
        calendar_year: i32,
    },
    #[error("enter a valid http(s) URL, got: {0:?}")]
    InvalidUrl(String),
    #[error("the title must not be empty")]
    InvalidTitle,
    #[error("day {day} is already registered by {owner_name} ({title:?})")]
    SlotTaken {
        day: Day,
        owner_id: String,
        owner_name: String,
        title: String,
    },
    #[error("saving failed, please try again: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl ClaimError {
    /// Validation failures are raised before the store is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ClaimError::Unauthenticated
                | ClaimError::OutOfRange { .. }
                | ClaimError::InvalidUrl(_)
                | ClaimError::InvalidTitle
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ClaimError::StoreUnavailable(_))
    }
}

pub fn validate_url(raw: &str) -> Result<Url, ClaimError> {
    let parsed = Url::parse(raw.trim()).map_err(|_| ClaimError::InvalidUrl(raw.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ClaimError::InvalidUrl(raw.to_string()));
    }
    Ok(parsed)
}

pub fn validate_title(raw: &str) -> Result<String, ClaimError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ClaimError::InvalidTitle);
    }
    Ok(title.to_string())
}

fn normalize_comment(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|comment| !comment.is_empty())
        .map(str::to_string)
}

/// Creates or updates the entry of a single slot. The ownership check runs
/// inside the store transaction, so two claimants racing for the same day
/// cannot both commit.
#[derive(Debug)]
pub struct SlotClaimer<'a, S> {
    store: &'a S,
    calendar_year: i32,
}

impl<'a, S: DocumentStore> SlotClaimer<'a, S> {
    pub fn new(store: &'a S, calendar_year: i32) -> Self {
        Self {
            store,
            calendar_year,
        }
    }

    #[instrument(
        skip(self, identity, payload),
        fields(attempt = %Uuid::new_v4(), owner = identity.map(|i| i.id.as_str()))
    )]
    pub fn claim(
        &self,
        year: i32,
        day: u32,
        identity: Option<&Identity>,
        payload: &ClaimPayload,
    ) -> Result<Entry, ClaimError> {
        let identity = identity.ok_or(ClaimError::Unauthenticated)?;
        let day = Day::new(day)
            .filter(|_| year == self.calendar_year)
            .ok_or(ClaimError::OutOfRange {
                year,
                day,
                calendar_year: self.calendar_year,
            })?;
        let url = validate_url(&payload.url)?;
        let title = validate_title(&payload.title)?;
        let comment = normalize_comment(payload.comment.as_deref());

        let key = SlotKey::new(year, day);
        debug!(slot = %key, "payload validated, starting transaction");

        let outcome = self
            .store
            .run_atomic(&key, |current| match current {
                Some(existing) if existing.user_id != identity.id => Decision::Abort,
                existing => Decision::Write(EntryWrite {
                    user_id: identity.id.clone(),
                    user_name: identity.name_or_anonymous().to_string(),
                    user_photo_url: identity.avatar_url.clone(),
                    day: i64::from(day.get()),
                    year,
                    title: title.clone(),
                    url: url.to_string(),
                    comment: comment.clone(),
                    created_at: existing
                        .map(|record| WriteTimestamp::Preserve(record.created_at))
                        .unwrap_or(WriteTimestamp::ServerNow),
                }),
            })
            .map_err(|err| {
                warn!(slot = %key, error = %err, "claim transaction failed");
                ClaimError::StoreUnavailable(err)
            })?;

        match outcome {
            Outcome::Committed(record) => {
                info!(slot = %key, owner = %record.user_id, "entry saved");
                Ok(Entry {
                    id: key,
                    owner_id: record.user_id,
                    owner_display_name: record.user_name,
                    owner_avatar_url: record.user_photo_url,
                    day,
                    year,
                    title: record.title,
                    url,
                    comment: record.comment,
                    created_at: record.created_at,
                })
            }
            Outcome::Aborted(Some(existing)) => {
                info!(slot = %key, owner = %existing.user_id, "slot already taken");
                Err(ClaimError::SlotTaken {
                    day,
                    owner_id: existing.user_id,
                    owner_name: existing.user_name,
                    title: existing.title,
                })
            }
            Outcome::Aborted(None) => Err(ClaimError::StoreUnavailable(StoreError::Unavailable(
                format!("transaction on {key} aborted without a conflicting record"),
            ))),
        }
    }
}
