use chrono::{Datelike, NaiveDate};
use tracing::debug;
use url::Url;

use crate::calendar::CalendarSnapshot;
use crate::entry::{Day, Entry};

const DECEMBER: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Locked,
    Open,
    Claimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickKind {
    OpenUrl,
    OpenClaimForm,
    Inert,
}

/// A claimed cell always opens its link, even for the owner. Editing goes
/// through the claim form for that day instead.
pub fn dispatch_click(has_entry: bool, is_locked: bool, is_authenticated: bool) -> ClickKind {
    if has_entry {
        ClickKind::OpenUrl
    } else if is_locked || !is_authenticated {
        ClickKind::Inert
    } else {
        ClickKind::OpenClaimForm
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickAction {
    OpenUrl(Url),
    OpenClaimForm(Day),
    Inert,
}

/// Gate that keeps days after `today` closed. Off by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DayLock {
    today: Option<NaiveDate>,
}

impl DayLock {
    pub fn disabled() -> Self {
        Self { today: None }
    }

    pub fn until(today: NaiveDate) -> Self {
        Self { today: Some(today) }
    }

    pub fn is_enabled(&self) -> bool {
        self.today.is_some()
    }

    pub fn is_locked(&self, year: i32, day: Day) -> bool {
        let Some(today) = self.today else {
            return false;
        };
        NaiveDate::from_ymd_opt(year, DECEMBER, day.get()).is_some_and(|date| date > today)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell<'a> {
    pub day: Day,
    pub state: CellState,
    pub entry: Option<&'a Entry>,
}

impl Cell<'_> {
    pub fn click(&self, is_authenticated: bool) -> ClickAction {
        let kind = dispatch_click(
            self.entry.is_some(),
            self.state == CellState::Locked,
            is_authenticated,
        );
        match (kind, self.entry) {
            (ClickKind::OpenUrl, Some(entry)) => ClickAction::OpenUrl(entry.url.clone()),
            (ClickKind::OpenClaimForm, _) => ClickAction::OpenClaimForm(self.day),
            _ => ClickAction::Inert,
        }
    }
}

/// The 25 cells of the configured December, as the viewer sees them.
#[derive(Debug, Clone)]
pub struct GridView<'a> {
    pub year: i32,
    pub authenticated: bool,
    /// Empty cells before December 1 in a Sunday-first week.
    pub leading_blanks: u32,
    pub cells: Vec<Cell<'a>>,
}

impl<'a> GridView<'a> {
    pub fn build(snapshot: &'a CalendarSnapshot, lock: &DayLock, authenticated: bool) -> Self {
        let year = snapshot.year();
        let cells: Vec<Cell<'a>> = Day::all()
            .map(|day| {
                let entry = snapshot.entry(day);
                let state = match entry {
                    Some(_) => CellState::Claimed,
                    None if lock.is_locked(year, day) => CellState::Locked,
                    None => CellState::Open,
                };
                Cell { day, state, entry }
            })
            .collect();

        debug!(
            year,
            authenticated,
            claimed = cells.iter().filter(|c| c.state == CellState::Claimed).count(),
            "built grid view"
        );

        Self {
            year,
            authenticated,
            leading_blanks: leading_blanks(year),
            cells,
        }
    }

    pub fn cell(&self, day: Day) -> Option<&Cell<'a>> {
        self.cells.iter().find(|cell| cell.day == day)
    }

    pub fn click(&self, day: Day) -> ClickAction {
        self.cell(day)
            .map(|cell| cell.click(self.authenticated))
            .unwrap_or(ClickAction::Inert)
    }
}

pub fn leading_blanks(year: i32) -> u32 {
    NaiveDate::from_ymd_opt(year, DECEMBER, 1)
        .map(|first| first.weekday().num_days_from_sunday())
        .unwrap_or(0)
}

/// Identifies one opening of the claim form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormTicket {
    pub day: Day,
    generation: u64,
}

/// Tracks which claim form is open, so a result that resolves after the form
/// was closed or replaced can be recognised and dropped.
#[derive(Debug, Default)]
pub struct ClaimFormTracker {
    generation: u64,
    open: Option<FormTicket>,
}

impl ClaimFormTracker {
    pub fn open(&mut self, day: Day) -> FormTicket {
        self.generation += 1;
        let ticket = FormTicket {
            day,
            generation: self.generation,
        };
        self.open = Some(ticket);
        ticket
    }

    pub fn close(&mut self) {
        self.open = None;
    }

    pub fn is_current(&self, ticket: FormTicket) -> bool {
        self.open == Some(ticket)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::datastore::RawEntry;

    fn day(n: u32) -> Day {
        Day::new(n).expect("valid day")
    }

    fn snapshot_with(days: &[i64]) -> CalendarSnapshot {
        let records = days
            .iter()
            .map(|&d| RawEntry {
                id: format!("2025-{d}"),
                user_id: "alice".to_string(),
                user_name: "Alice".to_string(),
                user_photo_url: None,
                day: d,
                year: 2025,
                title: format!("post {d}"),
                url: format!("https://example.com/{d}"),
                comment: None,
                created_at: Utc::now(),
            })
            .collect();
        CalendarSnapshot::from_records(2025, records)
    }

    #[test]
    fn click_dispatch_table() {
        for locked in [false, true] {
            for authed in [false, true] {
                assert_eq!(dispatch_click(true, locked, authed), ClickKind::OpenUrl);
            }
        }
        assert_eq!(dispatch_click(false, false, true), ClickKind::OpenClaimForm);
        assert_eq!(dispatch_click(false, false, false), ClickKind::Inert);
        assert_eq!(dispatch_click(false, true, true), ClickKind::Inert);
        assert_eq!(dispatch_click(false, true, false), ClickKind::Inert);
    }

    #[test]
    fn grid_always_has_twenty_five_cells() {
        let snapshot = snapshot_with(&[]);
        let view = GridView::build(&snapshot, &DayLock::disabled(), false);
        assert_eq!(view.cells.len(), 25);
        assert_eq!(view.cells.first().map(|c| c.day.get()), Some(1));
        assert_eq!(view.cells.last().map(|c| c.day.get()), Some(25));
        assert!(view.cells.iter().all(|c| c.state == CellState::Open));
    }

    #[test]
    fn claimed_cell_opens_url_for_anyone() {
        let snapshot = snapshot_with(&[5]);
        for authenticated in [false, true] {
            let view = GridView::build(&snapshot, &DayLock::disabled(), authenticated);
            match view.click(day(5)) {
                ClickAction::OpenUrl(url) => assert_eq!(url.as_str(), "https://example.com/5"),
                other => panic!("expected link, got {other:?}"),
            }
        }
    }

    #[test]
    fn open_cell_needs_authentication() {
        let snapshot = snapshot_with(&[]);
        let guest = GridView::build(&snapshot, &DayLock::disabled(), false);
        assert_eq!(guest.click(day(2)), ClickAction::Inert);

        let member = GridView::build(&snapshot, &DayLock::disabled(), true);
        assert_eq!(member.click(day(2)), ClickAction::OpenClaimForm(day(2)));
    }

    #[test]
    fn lock_gate_closes_future_days_but_not_claimed_ones() {
        let today = NaiveDate::from_ymd_opt(2025, 12, 10).expect("valid date");
        let snapshot = snapshot_with(&[20]);
        let view = GridView::build(&snapshot, &DayLock::until(today), true);

        assert_eq!(view.cell(day(10)).map(|c| c.state), Some(CellState::Open));
        assert_eq!(view.cell(day(11)).map(|c| c.state), Some(CellState::Locked));
        assert_eq!(view.cell(day(20)).map(|c| c.state), Some(CellState::Claimed));
        assert_eq!(view.click(day(11)), ClickAction::Inert);
    }

    #[test]
    fn december_first_offsets() {
        // 2025-12-01 is a Monday, 2024-12-01 a Sunday.
        assert_eq!(leading_blanks(2025), 1);
        assert_eq!(leading_blanks(2024), 0);
    }

    #[test]
    fn stale_form_results_are_recognised() {
        let mut tracker = ClaimFormTracker::default();
        let first = tracker.open(day(3));
        assert!(tracker.is_current(first));

        let second = tracker.open(day(3));
        assert!(!tracker.is_current(first));
        assert!(tracker.is_current(second));

        tracker.close();
        assert!(!tracker.is_current(second));
    }
}
