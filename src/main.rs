use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use sessionkeeper::config::{AppConfig, LogFormat, LoggingConfig};
use sessionkeeper::driver::{DriverFactory, StaticPageDriver};
use sessionkeeper::finder::{self, dom::Document, LoginFormFinder};
use sessionkeeper::model::{Credentials, Field, NewHistory, NewSite, Site, SiteId};
use sessionkeeper::policy::SchedulePolicy;
use sessionkeeper::script::check_syntax;

/// Environment variable read when `site add` is given no `--password`.
const PASSWORD_ENV: &str = "SESSIONKEEPER_PASSWORD";

#[derive(Parser)]
#[command(
    name = "sessionkeeper",
    about = "Keeps website sessions alive by logging in on a randomized schedule",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $SESSIONKEEPER_CONFIG, then /etc/sessionkeeper/sessionkeeper.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler)
    Serve {
        /// Bind address, overrides [api].bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Check a login script for syntax errors
    CheckScript {
        /// Script file
        file: PathBuf,
    },

    /// Locate the login form fields in a saved HTML page
    FindForm {
        /// HTML file
        file: PathBuf,

        /// Also print every ranked candidate
        #[arg(long)]
        candidates: bool,
    },

    /// Manage sites
    Site {
        #[command(subcommand)]
        action: SiteAction,
    },

    /// Show the login history of a site
    History {
        site_id: SiteId,

        /// Number of entries to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SiteAction {
    /// List all sites
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Add a new site
    Add(AddSite),

    /// Stop scheduling a site
    Pause { id: SiteId },

    /// Resume a paused site with a freshly drawn next run
    Resume { id: SiteId },

    /// Log in as soon as possible
    Trigger { id: SiteId },

    /// Record a login done by hand and reschedule from now
    Log { id: SiteId },

    /// Remove a site and its history
    Remove { id: SiteId },
}

#[derive(Args)]
struct AddSite {
    #[arg(long)]
    name: String,

    /// Page the login form is on
    #[arg(long)]
    url: String,

    /// Page the browser must reach after logging in
    #[arg(long)]
    success_url: String,

    #[arg(long)]
    username: String,

    /// Falls back to $SESSIONKEEPER_PASSWORD
    #[arg(long)]
    password: Option<String>,

    /// Earliest next login, in minutes from the previous one
    #[arg(long, default_value = "10080")]
    date_minutes_start: u32,

    /// Latest next login, in minutes from the previous one
    #[arg(long)]
    date_minutes_end: Option<u32>,

    /// Start of the allowed time of day, in minutes after midnight
    #[arg(long)]
    allowed_start: Option<u32>,

    /// End of the allowed time of day, in minutes after midnight
    #[arg(long)]
    allowed_end: Option<u32>,

    /// Custom login script file
    #[arg(long)]
    script: Option<PathBuf>,

    /// Save a screenshot of every attempt
    #[arg(long)]
    screenshot: bool,

    /// Add the site paused
    #[arg(long)]
    paused: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting sessionkeeper daemon");
            sessionkeeper::serve(config).await?;
        }
        Commands::CheckScript { file } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            match check_syntax(&source) {
                None => println!("{}: OK", file.display()),
                Some(diagnostic) => bail!("{}: {}", file.display(), diagnostic),
            }
        }
        Commands::FindForm { file, candidates } => find_form(&file, candidates).await?,
        Commands::Site { action } => site(&config, action)?,
        Commands::History {
            site_id,
            limit,
            json,
        } => {
            let store = sessionkeeper::open_store(&config)?;
            let rows = store.history_for_site(site_id, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No history for site {}.", site_id);
            } else {
                println!("{:<25} | {:<11} | {:<32} | Message", "Started", "Status", "Failure");
                println!("{:-<25}-|-{:-<11}-|-{:-<32}-|-{:-<20}", "", "", "", "");
                for row in rows {
                    println!(
                        "{:<25} | {:<11} | {:<32} | {}",
                        row.execution_started.to_rfc3339(),
                        row.status,
                        row.failure.map(|f| f.as_str()).unwrap_or("-"),
                        row.message.as_deref().unwrap_or("")
                    );
                }
            }
        }
    }

    Ok(())
}

async fn find_form(file: &Path, candidates: bool) -> Result<()> {
    let html = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let driver = StaticPageDriver::new(html.clone());
    let session = driver.connect().await?;
    session.open_url(&format!("file://{}", file.display())).await?;
    let locators = LoginFormFinder::new(session.as_ref()).find().await?;
    session.disconnect().await?;

    for field in Field::ALL {
        let name = field_name(field);
        match locators.get(field) {
            Some(locator) => println!("{:<14} {}", name, locator),
            None => println!("{:<14} not found ({})", name, field.not_found_status()),
        }
    }

    if candidates {
        let doc = Document::parse(&html);
        for field in Field::ALL {
            println!("\n{} candidates:", field_name(field));
            for candidate in finder::rank(&doc, field) {
                println!(
                    "  {:>4}  {}  [{}]",
                    candidate.score,
                    doc.absolute_path(candidate.node),
                    candidate.evidence.join(", ")
                );
            }
        }
    }
    Ok(())
}

fn field_name(field: Field) -> &'static str {
    match field {
        Field::Username => "username",
        Field::Password => "password",
        Field::SubmitButton => "submit button",
    }
}

fn site(config: &AppConfig, action: SiteAction) -> Result<()> {
    let store = sessionkeeper::open_store(config)?;
    match action {
        SiteAction::List { json } => {
            let sites = store.list_sites()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sites)?);
            } else if sites.is_empty() {
                println!("No sites configured.");
            } else {
                println!("{:<4} | {:<20} | {:<6} | {:<25} | URL", "ID", "Name", "Paused", "Next login");
                println!("{:-<4}-|-{:-<20}-|-{:-<6}-|-{:-<25}-|-{:-<30}", "", "", "", "", "");
                for site in sites {
                    println!(
                        "{:<4} | {:<20} | {:<6} | {:<25} | {}",
                        site.id,
                        site.name,
                        site.paused,
                        next_login(&site),
                        site.url
                    );
                }
            }
        }
        SiteAction::Add(add) => {
            let password = match add.password {
                Some(password) => password,
                None => std::env::var(PASSWORD_ENV)
                    .with_context(|| format!("--password not given and ${PASSWORD_ENV} is not set"))?,
            };
            let custom_script = match &add.script {
                Some(path) => Some(
                    std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                ),
                None => None,
            };
            let policy = SchedulePolicy::new(
                add.date_minutes_start,
                add.date_minutes_end,
                add.allowed_start,
                add.allowed_end,
            )?;
            let site = store.add_site(NewSite {
                name: add.name,
                url: add.url,
                success_url: add.success_url,
                credentials: Credentials::new(add.username, password),
                take_screenshot: add.screenshot,
                paused: add.paused,
                custom_script,
                policy,
            })?;
            println!("Site '{}' added with id {} (next login: {}).", site.name, site.id, next_login(&site));
        }
        SiteAction::Pause { id } => {
            let site = store.set_paused(id, true)?;
            println!("Site '{}' paused.", site.name);
        }
        SiteAction::Resume { id } => {
            let site = store.set_paused(id, false)?;
            println!("Site '{}' resumed (next login: {}).", site.name, next_login(&site));
        }
        SiteAction::Trigger { id } => {
            let site = store.trigger_now(id)?;
            println!("Site '{}' will log in at the next scheduler pass.", site.name);
        }
        SiteAction::Log { id } => {
            store.insert_history(id, NewHistory::manual(chrono::Utc::now()))?;
            let site = store.get_site(id)?;
            println!("Manual login recorded for '{}' (next login: {}).", site.name, next_login(&site));
        }
        SiteAction::Remove { id } => {
            store.delete_site(id)?;
            println!("Site {} removed.", id);
        }
    }
    Ok(())
}

fn next_login(site: &Site) -> String {
    site.next_schedule
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}
