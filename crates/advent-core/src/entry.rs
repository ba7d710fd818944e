use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::datastore::RawEntry;

pub const FIRST_DAY: u32 = 1;
pub const LAST_DAY: u32 = 25;
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// A December day that can hold an entry, always within 1..=25.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Day(u8);

impl Day {
    pub fn new(day: u32) -> Option<Self> {
        if (FIRST_DAY..=LAST_DAY).contains(&day) {
            u8::try_from(day).ok().map(Self)
        } else {
            None
        }
    }

    pub fn get(self) -> u32 {
        u32::from(self.0)
    }

    pub fn all() -> impl Iterator<Item = Day> {
        (FIRST_DAY..=LAST_DAY).filter_map(Day::new)
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Day {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u32 = s
            .trim()
            .parse()
            .map_err(|_| format!("expected a day number, got: {s}"))?;
        Day::new(raw).ok_or_else(|| format!("day must be between {FIRST_DAY} and {LAST_DAY}, got: {raw}"))
    }
}

/// Storage key of a slot: `"{year}-{day}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey(String);

impl SlotKey {
    pub fn new(year: i32, day: Day) -> Self {
        Self(format!("{year}-{day}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
    Google,
    Github,
}

impl ProviderTag {
    pub const ALL: [ProviderTag; 2] = [ProviderTag::Google, ProviderTag::Github];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderTag::Google => "google",
            ProviderTag::Github => "github",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProviderTag::Google => "Google",
            ProviderTag::Github => "GitHub",
        }
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(ProviderTag::Google),
            "github" => Ok(ProviderTag::Github),
            other => Err(format!("unknown sign-in provider: {other} (expected google or github)")),
        }
    }
}

/// The signed-in user as reported by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "avatarURL")]
    pub avatar_url: Option<String>,
    pub provider: ProviderTag,
}

impl Identity {
    pub fn name_or_anonymous(&self) -> &str {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(ANONYMOUS_NAME)
    }
}

/// What the claim form submits for a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimPayload {
    pub title: String,
    pub url: String,
    pub comment: Option<String>,
}

/// A claimed day. `owner_display_name` and `owner_avatar_url` are copied from
/// the identity at the last write and are not kept in sync afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: SlotKey,
    pub owner_id: String,
    pub owner_display_name: String,
    pub owner_avatar_url: Option<String>,
    pub day: Day,
    pub year: i32,
    pub title: String,
    pub url: Url,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    pub fn is_owned_by(&self, identity: &Identity) -> bool {
        self.owner_id == identity.id
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidRecord {
    #[error("record {id} has day {day} outside 1..=25")]
    Day { id: String, day: i64 },
    #[error("record {id} has an unparseable url: {url}")]
    Url { id: String, url: String },
    #[error("record {id} is keyed differently from its slot {expected}")]
    Key { id: String, expected: String },
}

impl TryFrom<RawEntry> for Entry {
    type Error = InvalidRecord;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        let day = u32::try_from(raw.day)
            .ok()
            .and_then(Day::new)
            .ok_or_else(|| InvalidRecord::Day {
                id: raw.id.clone(),
                day: raw.day,
            })?;

        let id = SlotKey::new(raw.year, day);
        if id.as_str() != raw.id {
            return Err(InvalidRecord::Key {
                id: raw.id,
                expected: id.to_string(),
            });
        }

        let url = Url::parse(&raw.url).map_err(|_| InvalidRecord::Url {
            id: raw.id.clone(),
            url: raw.url.clone(),
        })?;

        Ok(Self {
            id,
            owner_id: raw.user_id,
            owner_display_name: raw.user_name,
            owner_avatar_url: raw.user_photo_url,
            day,
            year: raw.year,
            title: raw.title,
            url,
            comment: raw.comment,
            created_at: raw.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, day: i64, url: &str) -> RawEntry {
        RawEntry {
            id: id.to_string(),
            user_id: "u1".to_string(),
            user_name: "Mikan".to_string(),
            user_photo_url: None,
            day,
            year: 2025,
            title: "Rust tips".to_string(),
            url: url.to_string(),
            comment: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn day_bounds_are_one_through_twenty_five() {
        assert!(Day::new(0).is_none());
        assert!(Day::new(26).is_none());
        assert_eq!(Day::new(25).map(Day::get), Some(25));
        assert_eq!(Day::all().count(), 25);
        assert_eq!(Day::all().next().map(Day::get), Some(1));
    }

    #[test]
    fn day_parses_from_cli_text() {
        assert_eq!("7".parse::<Day>().map(Day::get), Ok(7));
        assert!("26".parse::<Day>().is_err());
        assert!("seven".parse::<Day>().is_err());
    }

    #[test]
    fn slot_key_is_year_dash_day() {
        let day = Day::new(3).expect("valid day");
        assert_eq!(SlotKey::new(2025, day).as_str(), "2025-3");
    }

    #[test]
    fn anonymous_name_fallback() {
        let mut identity = Identity {
            id: "u1".to_string(),
            display_name: Some("  ".to_string()),
            avatar_url: None,
            provider: ProviderTag::Github,
        };
        assert_eq!(identity.name_or_anonymous(), ANONYMOUS_NAME);
        identity.display_name = Some("Mikan".to_string());
        assert_eq!(identity.name_or_anonymous(), "Mikan");
    }

    #[test]
    fn raw_record_conversion_validates_day_key_and_url() {
        assert!(Entry::try_from(raw("2025-3", 3, "https://example.com/a")).is_ok());
        assert!(matches!(
            Entry::try_from(raw("2025-30", 30, "https://example.com/a")),
            Err(InvalidRecord::Day { day: 30, .. })
        ));
        assert!(matches!(
            Entry::try_from(raw("2025-4", 3, "https://example.com/a")),
            Err(InvalidRecord::Key { .. })
        ));
        assert!(matches!(
            Entry::try_from(raw("2025-3", 3, "nope")),
            Err(InvalidRecord::Url { .. })
        ));
    }
}
