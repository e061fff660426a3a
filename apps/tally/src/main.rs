use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    AggregationEngine, ClientError, Dashboard, DashboardConfig, DashboardState, HttpSession,
    MutationOutcome, ReconnectPolicy, RemoteCounterStore, SessionProvider, SkipReason,
};
use shared::domain::CounterField;
use tracing_subscriber::EnvFilter;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_VISIBLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(about = "Live per-user and all-user counters")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    username: String,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long, value_enum, default_value_t = Preset::Tally)]
    preset: Preset,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    Tally,
    Grading,
}

impl Preset {
    fn config(self) -> DashboardConfig {
        match self {
            Self::Tally => DashboardConfig::tally(),
            Self::Grading => DashboardConfig::grading(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the dashboard every time it changes, until Ctrl-C.
    Watch,
    /// Add one to your counter; defaults to the first tracked field.
    Increment { field: Option<String> },
    /// Take one from your counter unless it is already zero.
    Decrement { field: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
    let args = Args::parse();

    let session = HttpSession::sign_in(
        &args.server_url,
        &args.username,
        args.display_name.as_deref(),
        args.email.as_deref(),
    )
    .await
    .with_context(|| format!("failed to sign in at {}", args.server_url))?;
    let user = session.current_user().await.ok_or(ClientError::NotSignedIn)?;
    let store = RemoteCounterStore::connect(
        session.server_url(),
        user.user_id,
        ReconnectPolicy::default(),
    )?;
    let engine = AggregationEngine::new(Arc::new(store), args.preset.config());
    let mut dashboard = Dashboard::start(engine, Arc::new(session)).await?;
    println!("Hello, {}", dashboard.user().greeting_name());

    let result = match args.command {
        Command::Watch => watch(&dashboard).await,
        Command::Increment { field } => mutate(&dashboard, field, Direction::Up).await,
        Command::Decrement { field } => mutate(&dashboard, field, Direction::Down).await,
    };

    dashboard.sign_out().await;
    result
}

async fn watch(dashboard: &Dashboard) -> Result<()> {
    let mut state = dashboard.state();
    loop {
        render(&state.borrow_and_update());
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                return Ok(());
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}

async fn mutate(dashboard: &Dashboard, field: Option<String>, direction: Direction) -> Result<()> {
    let field = match field {
        Some(raw) => CounterField::parse(&raw)?,
        None => dashboard
            .config()
            .fields()
            .first()
            .cloned()
            .context("dashboard tracks no fields")?,
    };

    if dashboard.settled_within(SETTLE_TIMEOUT).await.is_none() {
        bail!(
            "no live counters after {}s; is the server reachable?",
            SETTLE_TIMEOUT.as_secs()
        );
    }
    let outcome = match direction {
        Direction::Up => dashboard.increment(&field).await,
        Direction::Down => dashboard.decrement(&field).await,
    };

    match outcome {
        MutationOutcome::Applied { value } => {
            let mut state = dashboard.state();
            let shown = tokio::time::timeout(
                ACK_VISIBLE_TIMEOUT,
                state.wait_for(|s| s.field(&field).is_some_and(|f| f.own == value)),
            )
            .await
            .is_ok();
            if !shown {
                println!("{field} is now {value}; the live view has not caught up yet");
            }
            render(&dashboard.snapshot());
            Ok(())
        }
        MutationOutcome::Skipped(SkipReason::AtFloor) => {
            println!("{field} is already 0; nothing to take away");
            Ok(())
        }
        MutationOutcome::Skipped(SkipReason::InFlight) => {
            println!("a change to {field} is still in flight");
            Ok(())
        }
        MutationOutcome::Skipped(SkipReason::UntrackedField) => {
            bail!("{field} is not tracked by this dashboard")
        }
        MutationOutcome::Skipped(SkipReason::Stopped) => bail!("the dashboard has already stopped"),
        MutationOutcome::Failed { message } => bail!("could not change {field}: {message}"),
    }
}

fn render(state: &DashboardState) {
    if !state.own_synced || !state.aggregate_synced {
        println!("loading...");
        return;
    }
    for field in &state.fields {
        let controls = match (
            state.can_increment(&field.field),
            state.can_decrement(&field.field),
        ) {
            (true, true) => "[+] [-]",
            (true, false) => "[+]",
            _ => "(pending)",
        };
        println!(
            "{}: yours {}  everyone {}  {controls}",
            field.field, field.own, field.aggregate
        );
    }
    println!("{} contributors", state.contributors);
}
