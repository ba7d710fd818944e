use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::calendar::{CalendarSnapshot, CalendarStore};
use crate::claim::{ClaimError, SlotClaimer};
use crate::cli::{ClaimArgs, DayArgs, Invocation, LoginArgs, parse_command_args};
use crate::config::{CalendarZone, Config};
use crate::datastore::DocumentStore;
use crate::entry::{ClaimPayload, Day, Entry, FIRST_DAY, LAST_DAY};
use crate::grid::{Cell, CellState, ClaimFormTracker, ClickAction, DayLock, FormTicket, GridView};
use crate::identity::{IdentityProvider, IdentitySession};
use crate::notify::{Notice, Notifier};
use crate::render::Renderer;

const USAGE: &str = "\
usage: advent [-v|-q] [--yes] [--rc key=value] [--adventrc path] [--data dir] [command] [args]

commands:
  grid                      show the calendar (default)
  open <day>                open the linked article of a day
  claim <day> --title T --url U [--comment C]
                            register a day, or update your own entry
  info <day>                show the entry of a day (also: advent <day>)
  login <google|github>     sign in
  logout                    sign out
  whoami                    show the signed-in account";

pub fn known_command_names() -> Vec<&'static str> {
    vec![
        "grid", "open", "claim", "info", "login", "logout", "whoami", "help", "version",
    ]
}

pub fn expand_command_abbrev<'a>(token: &'a str, known: &[&'a str]) -> Option<&'a str> {
    if known.contains(&token) {
        return Some(token);
    }

    let mut matches = known.iter().copied().filter(|name| name.starts_with(token));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

pub type UrlOpener = Box<dyn Fn(&Url) -> anyhow::Result<()>>;

/// Everything a command needs: the calendar, the session and the way notices
/// and links leave the process.
pub struct App<S, P> {
    pub year: i32,
    pub calendar: CalendarStore<S>,
    pub session: IdentitySession<P>,
    pub notifier: Arc<dyn Notifier>,
    pub day_lock: DayLock,
    open_url: UrlOpener,
}

impl<S: DocumentStore, P: IdentityProvider> App<S, P> {
    pub fn new(year: i32, store: S, provider: P, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            year,
            calendar: CalendarStore::new(store, year),
            session: IdentitySession::new(provider, Arc::clone(&notifier)),
            notifier,
            day_lock: DayLock::disabled(),
            open_url: Box::new(open_in_browser),
        }
    }

    pub fn with_day_lock(mut self, day_lock: DayLock) -> Self {
        self.day_lock = day_lock;
        self
    }

    pub fn with_url_opener(mut self, opener: UrlOpener) -> Self {
        self.open_url = opener;
        self
    }

    /// Reloads the calendar. A failed load is reported as a notice and the
    /// last published snapshot is returned instead.
    pub fn refresh(&self) -> Arc<CalendarSnapshot> {
        match self.calendar.refresh(self.year) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "showing last known calendar");
                self.notifier.notify(Notice::error(
                    "Could not load the calendar. Showing the last known entries.",
                ));
                self.calendar.snapshot()
            }
        }
    }

    fn grid<'a>(&self, snapshot: &'a CalendarSnapshot) -> GridView<'a> {
        GridView::build(snapshot, &self.day_lock, self.session.is_authenticated())
    }
}

fn open_in_browser(url: &Url) -> anyhow::Result<()> {
    webbrowser::open(url.as_str()).with_context(|| format!("failed to open {url}"))
}

/// Builds the day gate from `calendar.lock_future_days` and
/// `calendar.timezone`.
pub fn resolve_day_lock(cfg: &Config, now: DateTime<Utc>) -> anyhow::Result<DayLock> {
    if !cfg.lock_future_days() {
        return Ok(DayLock::disabled());
    }
    let today = match cfg.calendar_zone()? {
        CalendarZone::Local => now.with_timezone(&Local).date_naive(),
        CalendarZone::Named(tz) => now.with_timezone(&tz).date_naive(),
    };
    debug!(%today, "future days are locked");
    Ok(DayLock::until(today))
}

fn parse_day(day: u32) -> anyhow::Result<Day> {
    Day::new(day).ok_or_else(|| anyhow!("day must be between {FIRST_DAY} and {LAST_DAY}, got {day}"))
}

#[instrument(skip(app, renderer, inv), fields(command = %inv.command))]
pub fn dispatch<S: DocumentStore, P: IdentityProvider>(
    app: &App<S, P>,
    renderer: &mut Renderer,
    inv: Invocation,
) -> anyhow::Result<()> {
    debug!(args = ?inv.command_args, "dispatching command");
    let args = inv.command_args.as_slice();

    match inv.command.as_str() {
        "grid" => cmd_grid(app, renderer),
        "open" => cmd_open(app, args),
        "claim" => cmd_claim(app, renderer, args),
        "info" => cmd_info(app, renderer, args),
        "login" => cmd_login(app, args),
        "logout" => cmd_logout(app),
        "whoami" => renderer.print_identity(app.session.current_identity().as_ref()),
        "help" => {
            println!("{USAGE}");
            Ok(())
        }
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => Err(anyhow!("unknown command: {other}")),
    }
}

fn cmd_grid<S: DocumentStore, P: IdentityProvider>(
    app: &App<S, P>,
    renderer: &mut Renderer,
) -> anyhow::Result<()> {
    info!("command grid");
    let snapshot = app.refresh();
    let view = app.grid(&snapshot);
    renderer.print_grid(&view, app.session.current_identity().as_ref())
}

fn cmd_open<S: DocumentStore, P: IdentityProvider>(
    app: &App<S, P>,
    args: &[String],
) -> anyhow::Result<()> {
    let Some(args) = parse_command_args::<DayArgs>("open", args)? else {
        return Ok(());
    };
    open_day(app, parse_day(args.day)?)?;
    Ok(())
}

/// Clicks a cell of the grid and carries out what the click resolves to.
#[instrument(skip(app))]
pub fn open_day<S: DocumentStore, P: IdentityProvider>(
    app: &App<S, P>,
    day: Day,
) -> anyhow::Result<ClickAction> {
    let snapshot = app.refresh();
    let view = app.grid(&snapshot);
    let action = view.click(day);

    match &action {
        ClickAction::OpenUrl(url) => {
            info!(%url, "opening entry link");
            (app.open_url)(url)?;
        }
        ClickAction::OpenClaimForm(day) => app.notifier.notify(Notice::info(format!(
            "Day {day} is open. Register it with: advent claim {day} --title <title> --url <url>"
        ))),
        ClickAction::Inert => {
            let message = match view.cell(day).map(|cell| cell.state) {
                Some(CellState::Locked) => format!("Day {day} opens on December {day}."),
                _ => "Sign in to register this day: advent login google|github".to_string(),
            };
            app.notifier.notify(Notice::info(message));
        }
    }

    Ok(action)
}

fn cmd_info<S: DocumentStore, P: IdentityProvider>(
    app: &App<S, P>,
    renderer: &mut Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    let Some(args) = parse_command_args::<DayArgs>("info", args)? else {
        return Ok(());
    };
    let day = parse_day(args.day)?;
    let snapshot = app.refresh();
    let view = app.grid(&snapshot);

    match view.cell(day) {
        Some(Cell {
            entry: Some(entry), ..
        }) => {
            renderer.print_entry_info(entry, app.session.current_identity().as_ref())?;
        }
        Some(cell) if cell.state == CellState::Locked => {
            println!("{}-12-{:02}: locked until December {day}", app.year, day.get());
        }
        _ => println!("{}-12-{:02}: available", app.year, day.get()),
    }
    Ok(())
}

#[instrument(skip(app, renderer, args))]
fn cmd_claim<S: DocumentStore, P: IdentityProvider>(
    app: &App<S, P>,
    renderer: &mut Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    let Some(args) = parse_command_args::<ClaimArgs>("claim", args)? else {
        return Ok(());
    };
    let day = parse_day(args.day)?;
    let snapshot = app.refresh();
    let identity = app.session.current_identity();

    let view = app.grid(&snapshot);
    if view.cell(day).is_some_and(|cell| cell.state == CellState::Locked) {
        bail!("day {day} is locked until December {day}");
    }

    let existing = snapshot.entry(day);
    if let Some(entry) = existing
        && !identity.as_ref().is_some_and(|viewer| entry.is_owned_by(viewer))
    {
        // Someone else's day is shown read-only.
        renderer.print_entry_info(entry, identity.as_ref())?;
        return Err(taken_by(entry).into());
    }

    let payload = prefill(existing, args);
    let mut tracker = ClaimFormTracker::default();
    let ticket = tracker.open(day);

    match submit_claim(app, &tracker, ticket, &payload, existing.is_some()) {
        Ok(Some(entry)) => {
            tracker.close();
            debug!(slot = %entry.id, "re-rendering after claim");
            let snapshot = app.calendar.snapshot();
            renderer.print_grid(&app.grid(&snapshot), identity.as_ref())
        }
        Ok(None) => Ok(()),
        Err(err @ ClaimError::SlotTaken { .. }) => {
            if let Some(winner) = app.calendar.snapshot().entry(day) {
                renderer.print_entry_info(winner, identity.as_ref())?;
            }
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

/// Fills the fields left out on the command line from the viewer's own
/// entry. A given `--comment ""` clears the comment.
fn prefill(own: Option<&Entry>, args: ClaimArgs) -> ClaimPayload {
    ClaimPayload {
        title: args
            .title
            .or_else(|| own.map(|entry| entry.title.clone()))
            .unwrap_or_default(),
        url: args
            .url
            .or_else(|| own.map(|entry| entry.url.to_string()))
            .unwrap_or_default(),
        comment: args
            .comment
            .or_else(|| own.and_then(|entry| entry.comment.clone())),
    }
}

fn taken_by(entry: &Entry) -> ClaimError {
    ClaimError::SlotTaken {
        day: entry.day,
        owner_id: entry.owner_id.clone(),
        owner_name: entry.owner_display_name.clone(),
        title: entry.title.clone(),
    }
}

/// Submits the claim form identified by `ticket`. A result for a form that
/// is no longer open is dropped and reported as `Ok(None)`. Both a commit
/// and a lost race reload the calendar.
///
/// `advent claim` submits right after opening its form, so its ticket is
/// always current. Callers that keep a form open while other forms come and
/// go rely on the stale check.
#[instrument(skip(app, tracker, payload), fields(day = %ticket.day))]
pub fn submit_claim<S: DocumentStore, P: IdentityProvider>(
    app: &App<S, P>,
    tracker: &ClaimFormTracker,
    ticket: FormTicket,
    payload: &ClaimPayload,
    editing: bool,
) -> Result<Option<Entry>, ClaimError> {
    let identity = app.session.current_identity();
    let result = SlotClaimer::new(app.calendar.store(), app.year).claim(
        app.year,
        ticket.day.get(),
        identity.as_ref(),
        payload,
    );

    if !tracker.is_current(ticket) {
        debug!(ok = result.is_ok(), "claim form already closed, dropping result");
        if result.is_ok() {
            app.refresh();
        }
        return Ok(None);
    }

    match result {
        Ok(entry) => {
            let message = if editing {
                "Entry updated."
            } else {
                "Entry registered."
            };
            app.notifier.notify(Notice::success(message));
            app.refresh();
            Ok(Some(entry))
        }
        Err(err) => {
            if matches!(err, ClaimError::SlotTaken { .. }) {
                app.refresh();
            }
            Err(err)
        }
    }
}

fn cmd_login<S: DocumentStore, P: IdentityProvider>(
    app: &App<S, P>,
    args: &[String],
) -> anyhow::Result<()> {
    let Some(args) = parse_command_args::<LoginArgs>("login", args)? else {
        return Ok(());
    };
    info!(provider = %args.provider, "command login");
    app.session.sign_in(args.provider);
    Ok(())
}

fn cmd_logout<S: DocumentStore, P: IdentityProvider>(app: &App<S, P>) -> anyhow::Result<()> {
    info!("command logout");
    if !app.session.is_authenticated() {
        app.notifier.notify(Notice::info("Not signed in."));
        return Ok(());
    }
    app.session.sign_out();
    Ok(())
}
