use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use viewtrail_core::{
    fingerprint_for_path, Command, HistoryConfig, HistoryEntry, HistorySnapshot, LinkService,
    MemoryEnvironment, MemoryLinkService, NavEnable, PushRequest, Session, ViewareaLocation,
    ViewerEvent,
};

const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Parser)]
#[command(
    name = "viewtrail",
    version,
    about = "Replays viewer navigation against a document history timeline"
)]
struct Args {
    /// History settings (TOML); defaults to the platform config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Number of pages in the simulated document
    #[arg(short = 'n', long = "pages", default_value_t = 10)]
    pages: u32,

    /// Location of the simulated viewer, including any `#fragment`
    #[arg(short = 'u', long = "url", default_value = "https://viewer.invalid/document")]
    url: String,

    /// JSON history snapshot to load before running commands
    #[arg(long = "history")]
    history: Option<PathBuf>,

    /// File of commands to run instead of reading stdin
    #[arg(short = 's', long = "script")]
    script: Option<PathBuf>,

    /// Document fingerprint
    #[arg(
        short = 'f',
        long = "fingerprint",
        conflicts_with = "document",
        required_unless_present = "document"
    )]
    fingerprint: Option<String>,

    /// Document whose path the fingerprint is derived from
    #[arg(short = 'd', long = "document")]
    document: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "viewtrail", "viewtrail")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config = match &args.config {
        Some(path) => HistoryConfig::load(path)?,
        None => HistoryConfig::discover()?,
    };
    let fingerprint = match (&args.fingerprint, &args.document) {
        (Some(fingerprint), _) => fingerprint.clone(),
        (None, Some(path)) => fingerprint_for_path(path),
        (None, None) => bail!("either --fingerprint or --document is required"),
    };

    let mut driver = Driver::new(args.pages, &args.url, config, fingerprint);
    if let Some(path) = &args.history {
        driver.load_history(path)?;
    }

    match &args.script {
        Some(path) => {
            let script = fs::read_to_string(path)
                .with_context(|| format!("failed to read script {:?}", path))?;
            driver.run_script(&script);
        }
        None => run_interactive(&mut driver).await?,
    }

    driver.finish()?;
    Ok(())
}

async fn run_interactive(driver: &mut Driver) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(TICK);
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if driver.run_line(&line) == Flow::Quit {
                    break;
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                driver.session.advance(now - last_tick);
                last_tick = now;
            }
        }
    }
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "viewtrail.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // Logs go to stderr so stdout carries only the JSON reports.
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
enum ScriptCommand {
    Init {
        reset_history: bool,
        update_url: bool,
    },
    Push {
        page: i64,
        named: Option<String>,
    },
    PushDest {
        dest: Vec<Value>,
        page: Option<i64>,
    },
    Scroll {
        first: u32,
        last: Option<u32>,
        params: Option<String>,
    },
    Position,
    Back,
    Forward,
    Hide,
    Hash(String),
    Pop(Option<HistoryEntry>),
    PagesInit,
    PagesLoaded(Option<u32>),
    Presentation(bool),
    Wait(Duration),
    Reset,
    Describe,
    Quit,
}

/// Parses one script line; blank lines and `#` comments yield `None`.
fn parse_line(line: &str) -> Result<Option<ScriptCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let mut args = rest.split_whitespace();

    let command = match word {
        "init" => {
            let mut reset_history = false;
            let mut update_url = false;
            for flag in args {
                match flag {
                    "reset" => reset_history = true,
                    "update-url" => update_url = true,
                    other => bail!("unknown init flag {other:?}"),
                }
            }
            ScriptCommand::Init {
                reset_history,
                update_url,
            }
        }
        "push" => {
            let page = required(args.next(), "push <page> [named]")?;
            ScriptCommand::Push {
                page: page.parse().context("page must be an integer")?,
                named: args.next().map(str::to_string),
            }
        }
        "push-dest" => {
            let (raw, page) = split_json(rest)?;
            let value: Value = serde_json::from_str(raw).context("invalid destination JSON")?;
            let dest = match value {
                Value::Array(items) => items,
                other => bail!("destination must be a JSON array, got {other}"),
            };
            let page = page
                .map(|page| page.parse().context("page must be an integer"))
                .transpose()?;
            ScriptCommand::PushDest { dest, page }
        }
        "scroll" => {
            let first = required(args.next(), "scroll <first> [last] [params]")?;
            let last = args
                .next()
                .map(|last| last.parse().context("last page must be an integer"))
                .transpose()?;
            ScriptCommand::Scroll {
                first: first.parse().context("first page must be an integer")?,
                last,
                params: args.next().map(str::to_string),
            }
        }
        "position" => ScriptCommand::Position,
        "back" => ScriptCommand::Back,
        "forward" => ScriptCommand::Forward,
        "hide" => ScriptCommand::Hide,
        "hash" => ScriptCommand::Hash(rest.to_string()),
        "pop" => match rest {
            "" | "none" => ScriptCommand::Pop(None),
            raw => ScriptCommand::Pop(Some(
                serde_json::from_str(raw).context("invalid history entry JSON")?,
            )),
        },
        "pages-init" => ScriptCommand::PagesInit,
        "pages-loaded" => ScriptCommand::PagesLoaded(
            args.next()
                .map(|count| count.parse().context("page count must be an integer"))
                .transpose()?,
        ),
        "presentation" => match args.next() {
            Some("on") => ScriptCommand::Presentation(true),
            Some("off") => ScriptCommand::Presentation(false),
            _ => bail!("usage: presentation on|off"),
        },
        "wait" => {
            let ms = required(args.next(), "wait <ms>")?;
            ScriptCommand::Wait(Duration::from_millis(
                ms.parse().context("wait takes milliseconds")?,
            ))
        }
        "reset" => ScriptCommand::Reset,
        "describe" => ScriptCommand::Describe,
        "quit" | "exit" => ScriptCommand::Quit,
        other => bail!("unknown command {other:?}"),
    };
    Ok(Some(command))
}

fn required<'a>(arg: Option<&'a str>, usage: &str) -> Result<&'a str> {
    arg.ok_or_else(|| anyhow!("usage: {usage}"))
}

/// Splits `<json> [page]`, where the JSON value may contain spaces.
fn split_json(rest: &str) -> Result<(&str, Option<&str>)> {
    let end = rest
        .rfind(']')
        .ok_or_else(|| anyhow!("usage: push-dest <json-array> [page]"))?;
    let (raw, tail) = rest.split_at(end + 1);
    let tail = tail.trim();
    Ok((raw, (!tail.is_empty()).then_some(tail)))
}

#[derive(Debug, Serialize)]
struct Report {
    fingerprint: String,
    initialized: bool,
    uid: i64,
    max_uid: i64,
    pop_state_in_progress: bool,
    initial_bookmark: Option<String>,
    initial_rotation: Option<i32>,
    page: u32,
    rotation: i32,
    history: Option<HistorySnapshot>,
}

/// Runs script commands against a session with in-memory collaborators.
struct Driver {
    session: Session,
    link: Arc<MemoryLinkService>,
    env: Arc<MemoryEnvironment>,
    fingerprint: String,
}

impl Driver {
    fn new(pages: u32, url: &str, config: HistoryConfig, fingerprint: String) -> Self {
        let link = Arc::new(MemoryLinkService::new(pages));
        let env = Arc::new(MemoryEnvironment::new(url));
        let mut session = Session::new(link.clone(), env.clone(), config);
        session
            .history_mut()
            .add_nav_enable_handler(|update: &NavEnable| {
                info!(
                    back = update.back,
                    forward = update.forward,
                    entries = update.history.states.len(),
                    "navigation availability changed"
                );
            });
        Self {
            session,
            link,
            env,
            fingerprint,
        }
    }

    fn load_history(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read history snapshot {:?}", path))?;
        let snapshot: HistorySnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse history snapshot {:?}", path))?;
        info!(entries = snapshot.states.len(), ptr = ?snapshot.ptr, "loaded history snapshot");
        self.session.apply(Command::DefineHistory {
            snapshot,
            reinit: false,
        })
    }

    fn run_script(&mut self, script: &str) {
        for line in script.lines() {
            if self.run_line(line) == Flow::Quit {
                break;
            }
        }
    }

    /// Rejected lines are logged and skipped.
    fn run_line(&mut self, line: &str) -> Flow {
        let result = parse_line(line).and_then(|command| match command {
            Some(command) => self.execute(command),
            None => Ok(Flow::Continue),
        });
        result.unwrap_or_else(|err| {
            warn!(line, "{err:#}");
            Flow::Continue
        })
    }

    fn execute(&mut self, command: ScriptCommand) -> Result<Flow> {
        match command {
            ScriptCommand::Init {
                reset_history,
                update_url,
            } => self.session.apply(Command::Initialize {
                fingerprint: self.fingerprint.clone(),
                reset_history,
                update_url,
            })?,
            ScriptCommand::Push { page, named } => {
                let dest = vec![json!({ "num": page, "gen": 0 }), json!({ "name": "Fit" })];
                let mut request = PushRequest::new(dest, Some(page));
                request.named_dest = named;
                self.session.apply(Command::Push(request))?;
            }
            ScriptCommand::PushDest { dest, page } => {
                self.session
                    .apply(Command::Push(PushRequest::new(dest, page)))?;
            }
            ScriptCommand::Scroll {
                first,
                last,
                params,
            } => {
                self.link.scroll_to(last.unwrap_or(first));
                let location = ViewareaLocation {
                    page_number: first,
                    pdf_open_params: params.unwrap_or_else(|| format!("#page={first}")),
                    rotation: self.link.rotation(),
                };
                self.emit(ViewerEvent::UpdateViewarea { location })?;
            }
            ScriptCommand::Position => self.session.apply(Command::PushCurrentPosition)?,
            ScriptCommand::Back => self.session.apply(Command::Back)?,
            ScriptCommand::Forward => self.session.apply(Command::Forward)?,
            ScriptCommand::Hide => self.emit(ViewerEvent::PageHide)?,
            ScriptCommand::Hash(hash) => {
                self.env.set_hash(&hash);
                self.emit(ViewerEvent::PopState { state: None })?;
                self.emit(ViewerEvent::HashChange)?;
            }
            ScriptCommand::Pop(state) => self.emit(ViewerEvent::PopState { state })?,
            ScriptCommand::PagesInit => self.emit(ViewerEvent::PagesInit)?,
            ScriptCommand::PagesLoaded(count) => {
                if let Some(count) = count {
                    self.link.set_pages_count(count);
                }
                let pages_count = self.link.pages_count();
                self.emit(ViewerEvent::PagesLoaded { pages_count })?;
            }
            ScriptCommand::Presentation(active) => {
                self.emit(ViewerEvent::PresentationModeChanged {
                    active,
                    switch_in_progress: false,
                })?;
            }
            ScriptCommand::Wait(duration) => {
                self.session.apply(Command::Advance { duration })?;
            }
            ScriptCommand::Reset => self.session.apply(Command::Reset)?,
            ScriptCommand::Describe => self.print_report()?,
            ScriptCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    fn emit(&mut self, event: ViewerEvent) -> Result<()> {
        self.session.apply(Command::Emit(event))
    }

    fn report(&self) -> Report {
        let history = self.session.history();
        Report {
            fingerprint: self.fingerprint.clone(),
            initialized: history.is_initialized(),
            uid: history.uid(),
            max_uid: history.max_uid(),
            pop_state_in_progress: history.pop_state_in_progress(),
            initial_bookmark: history.initial_bookmark().map(str::to_string),
            initial_rotation: history.initial_rotation(),
            page: self.link.page(),
            rotation: self.link.rotation(),
            history: self.session.describe(),
        }
    }

    fn print_report(&self) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(&self.report())?);
        Ok(())
    }

    /// Saves the last position the way a closing viewer would, then prints
    /// the final report.
    fn finish(&mut self) -> Result<()> {
        self.emit(ViewerEvent::PageHide)?;
        self.print_report()
    }
}
