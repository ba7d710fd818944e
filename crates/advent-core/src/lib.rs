pub mod calendar;
pub mod claim;
pub mod cli;
pub mod commands;
pub mod config;
pub mod datastore;
pub mod entry;
pub mod grid;
pub mod identity;
pub mod notify;
pub mod render;

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{debug, info};

use crate::notify::{LogNotifier, Notifier};

#[tracing::instrument(skip_all)]
pub fn run(raw_args: Vec<OsString>) -> anyhow::Result<()> {
    let pre = cli::preprocess_args(&raw_args)?;
    let cli = cli::GlobalCli::parse_from(pre.cleaned_args);

    cli::init_tracing(cli.verbose, cli.quiet)?;

    info!(verbose = cli.verbose, quiet = cli.quiet, "starting advent CLI");
    debug!(?pre.rc_overrides, "preprocessed rc overrides");

    let mut cfg = config::Config::load(cli.adventrc.as_deref())?;
    cfg.apply_overrides(
        pre.rc_overrides
            .into_iter()
            .chain(cli.rc_overrides.into_iter().map(|kv| (kv.key, kv.value))),
    );

    let data_dir = config::resolve_data_dir(&cfg, cli.data.as_deref())
        .context("failed to resolve data directory")?;
    let store = datastore::JsonlStore::open(&data_dir)
        .with_context(|| format!("failed to open datastore at {}", data_dir.display()))?;
    let provider =
        identity::LocalIdentityProvider::from_config(&data_dir, &cfg).assume_yes(cli.yes);

    let notifier: Arc<dyn Notifier> = if cli.quiet > 0 {
        Arc::new(LogNotifier)
    } else {
        Arc::new(render::TerminalNotifier::new(&cfg)?)
    };

    let year = cfg.calendar_year()?;
    let app = commands::App::new(year, store, provider, notifier)
        .with_day_lock(commands::resolve_day_lock(&cfg, Utc::now())?);
    app.session.restore();

    let mut renderer = render::Renderer::new(&cfg)?;
    let inv = cli::Invocation::parse(&cfg, cli.rest)?;

    commands::dispatch(&app, &mut renderer, inv)?;

    info!("done");
    Ok(())
}
