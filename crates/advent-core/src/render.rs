use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::Local;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::config::Config;
use crate::entry::{Entry, Identity};
use crate::grid::{CellState, GridView};
use crate::notify::{Notice, NoticeLevel, Notifier};

const CELL_WIDTH: usize = 16;
const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            color: color_setting(cfg)? && io::stdout().is_terminal(),
        })
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    #[tracing::instrument(skip_all, fields(year = view.year))]
    pub fn print_grid(&mut self, view: &GridView<'_>, viewer: Option<&Identity>) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_grid(&mut out, view, viewer)
    }

    pub fn write_grid<W: Write>(
        &self,
        mut out: W,
        view: &GridView<'_>,
        viewer: Option<&Identity>,
    ) -> anyhow::Result<()> {
        let title = format!("Advent Calendar {}", view.year);
        writeln!(out, "{}", self.paint(&title, "1;31"))?;
        match viewer {
            Some(identity) => writeln!(out, "signed in as {}", identity.name_or_anonymous())?,
            None => writeln!(out, "not signed in (advent login google|github)")?,
        }
        writeln!(out)?;

        for label in WEEKDAYS {
            write!(out, "{}", fit(label, CELL_WIDTH))?;
        }
        writeln!(out)?;

        let mut slots: Vec<Option<[String; 3]>> = Vec::new();
        slots.extend((0..view.leading_blanks).map(|_| None));
        for cell in &view.cells {
            let lines = match (cell.state, cell.entry) {
                (CellState::Claimed, Some(entry)) => {
                    let mine = viewer.is_some_and(|identity| entry.is_owned_by(identity));
                    let marker = if mine { " *" } else { "" };
                    [
                        format!("{}{marker}", cell.day),
                        entry.owner_display_name.clone(),
                        entry.title.clone(),
                    ]
                }
                (CellState::Locked, _) => {
                    [cell.day.to_string(), "Locked".to_string(), String::new()]
                }
                _ if view.authenticated => [
                    cell.day.to_string(),
                    "Click to register".to_string(),
                    String::new(),
                ],
                _ => [cell.day.to_string(), "Available".to_string(), String::new()],
            };
            slots.push(Some(lines));
        }

        for week in slots.chunks(WEEKDAYS.len()) {
            writeln!(out, "{}", "-".repeat(CELL_WIDTH * WEEKDAYS.len()))?;
            for line in 0..3 {
                for slot in week {
                    let text = slot.as_ref().map(|lines| lines[line].as_str()).unwrap_or("");
                    let padded = fit(text, CELL_WIDTH);
                    let painted = match (line, slot) {
                        (0, Some(_)) => self.paint(&padded, "33"),
                        (1, Some(lines)) if lines[2].is_empty() => self.paint(&padded, "2"),
                        _ => padded,
                    };
                    write!(out, "{painted}")?;
                }
                writeln!(out)?;
            }
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(slot = %entry.id))]
    pub fn print_entry_info(&mut self, entry: &Entry, viewer: Option<&Identity>) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_entry_info(&mut out, entry, viewer)
    }

    pub fn write_entry_info<W: Write>(
        &self,
        mut out: W,
        entry: &Entry,
        viewer: Option<&Identity>,
    ) -> anyhow::Result<()> {
        writeln!(out, "{}", self.paint(&format!("{}-12-{:02}", entry.year, entry.day.get()), "1"))?;
        writeln!(out, "title     {}", entry.title)?;
        writeln!(out, "url       {}", entry.url)?;
        if let Some(comment) = entry.comment.as_deref() {
            writeln!(out, "comment   {comment}")?;
        }
        writeln!(out, "author    {}", entry.owner_display_name)?;
        if let Some(avatar) = entry.owner_avatar_url.as_deref() {
            writeln!(out, "avatar    {avatar}")?;
        }
        writeln!(
            out,
            "created   {}",
            entry.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        )?;

        if viewer.is_some_and(|identity| entry.is_owned_by(identity)) {
            writeln!(
                out,
                "{}",
                self.paint(
                    &format!("this is your entry; edit it with: advent claim {}", entry.day),
                    "2"
                )
            )?;
        }

        Ok(())
    }

    pub fn print_identity(&mut self, identity: Option<&Identity>) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        match identity {
            Some(identity) => {
                writeln!(out, "{}", identity.name_or_anonymous())?;
                writeln!(out, "id        {}", identity.id)?;
                writeln!(out, "provider  {}", identity.provider.label())?;
                if let Some(avatar) = identity.avatar_url.as_deref() {
                    writeln!(out, "avatar    {avatar}")?;
                }
            }
            None => writeln!(out, "not signed in")?,
        }
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

/// Writes notices to stderr, the terminal stand-in for toasts.
#[derive(Debug, Clone)]
pub struct TerminalNotifier {
    color: bool,
}

impl TerminalNotifier {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            color: color_setting(cfg)? && io::stderr().is_terminal(),
        })
    }
}

impl Notifier for TerminalNotifier {
    fn notify(&self, notice: Notice) {
        let (tag, code) = match notice.level {
            NoticeLevel::Success => ("ok", "32"),
            NoticeLevel::Info => ("info", "36"),
            NoticeLevel::Error => ("error", "31"),
        };
        let tag = if self.color {
            format!("\x1b[{code}m{tag}\x1b[0m")
        } else {
            tag.to_string()
        };
        tracing::debug!(level = ?notice.level, message = %notice.message, "notice shown");
        let _ = writeln!(io::stderr().lock(), "{tag}: {}", notice.message);
    }
}

fn color_setting(cfg: &Config) -> anyhow::Result<bool> {
    let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
    match color_cfg.to_ascii_lowercase().as_str() {
        "on" | "yes" | "true" | "1" => Ok(true),
        "off" | "no" | "false" | "0" => Ok(false),
        other => Err(anyhow!("invalid color setting: {other}")),
    }
}

/// Truncates to `width` terminal columns (leaving a trailing gap) and pads
/// with spaces.
fn fit(text: &str, width: usize) -> String {
    let budget = width.saturating_sub(1);
    let mut out = String::with_capacity(width);
    let mut used = 0;

    if UnicodeWidthStr::width(text) > budget {
        for ch in text.chars() {
            let w = UnicodeWidthChar::width(ch).unwrap_or(0);
            if used + w + 1 > budget {
                break;
            }
            out.push(ch);
            used += w;
        }
        out.push('…');
        used += 1;
    } else {
        out.push_str(text);
        used = UnicodeWidthStr::width(text);
    }

    out.push_str(&" ".repeat(width.saturating_sub(used)));
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::calendar::CalendarSnapshot;
    use crate::datastore::RawEntry;
    use crate::entry::ProviderTag;
    use crate::grid::DayLock;

    fn snapshot() -> CalendarSnapshot {
        CalendarSnapshot::from_records(
            2025,
            vec![RawEntry {
                id: "2025-3".to_string(),
                user_id: "alice".to_string(),
                user_name: "Alice".to_string(),
                user_photo_url: None,
                day: 3,
                year: 2025,
                title: "Lifetimes without tears".to_string(),
                url: "https://example.com/lifetimes".to_string(),
                comment: Some("beginner friendly".to_string()),
                created_at: Utc::now(),
            }],
        )
    }

    #[test]
    fn fit_pads_and_truncates_by_display_width() {
        assert_eq!(fit("abc", 6), "abc   ");
        assert_eq!(UnicodeWidthStr::width(fit("アドベントカレンダー", 10).as_str()), 10);
        assert!(fit("a very long article title", 10).contains('…'));
    }

    #[test]
    fn grid_shows_owner_and_open_labels() {
        let snapshot = snapshot();
        let view = GridView::build(&snapshot, &DayLock::disabled(), false);
        let mut buf = Vec::new();
        Renderer::plain()
            .write_grid(&mut buf, &view, None)
            .expect("render");
        let text = String::from_utf8(buf).expect("utf8");

        assert!(text.contains("Advent Calendar 2025"));
        assert!(text.contains("Alice"));
        assert!(text.contains("Available"));
        assert!(!text.contains("Click to register"));
        // 2025-12-01 is a Monday, so one blank cell precedes it.
        let first_week = text
            .lines()
            .skip_while(|line| !line.starts_with('-'))
            .nth(1)
            .expect("first week row");
        assert!(first_week.starts_with(&" ".repeat(CELL_WIDTH)));
    }

    #[test]
    fn entry_info_marks_own_entry() {
        let snapshot = snapshot();
        let entry = snapshot.get(3).expect("entry");
        let alice = Identity {
            id: "alice".to_string(),
            display_name: Some("Alice".to_string()),
            avatar_url: None,
            provider: ProviderTag::Github,
        };

        let mut own = Vec::new();
        Renderer::plain()
            .write_entry_info(&mut own, entry, Some(&alice))
            .expect("render");
        let own = String::from_utf8(own).expect("utf8");
        assert!(own.contains("comment   beginner friendly"));
        assert!(own.contains("advent claim 3"));

        let mut other = Vec::new();
        Renderer::plain()
            .write_entry_info(&mut other, entry, None)
            .expect("render");
        assert!(!String::from_utf8(other).expect("utf8").contains("advent claim"));
    }
}
