mod agent;
mod init;
mod service;

use agent::Agent;
use clap::{Parser, Subcommand};
use courier_core::config;
use courier_session::PhoneCompletion;
use courier_store::HistoryQuery;
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[derive(Parser)]
#[command(
    name = "courier",
    version,
    about = "Hubfeed Courier — local agent for messaging avatars"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted.
    Start,
    /// Check configuration, token, and backend health.
    Status,
    /// Interactive first-run setup.
    Init,
    /// Connect an avatar (QR code or phone code).
    Login,
    /// Query the local execution history.
    History {
        /// Only events touching this avatar id.
        #[arg(long)]
        avatar: Option<String>,
        /// Only events for this job id.
        #[arg(long)]
        job: Option<String>,
        /// Only events from this date (YYYY-MM-DD).
        #[arg(long)]
        date: Option<String>,
        /// Only event types starting with this prefix.
        #[arg(long)]
        event_type: Option<String>,
        /// Substring match across event fields.
        #[arg(long)]
        text: Option<String>,
        /// Maximum number of events to print.
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Print aggregate statistics instead of events.
        #[arg(long)]
        summary: bool,
        /// Day range for --summary.
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Manage the login service (LaunchAgent on macOS, systemd on Linux).
    Service {
        #[command(subcommand)]
        action: ServiceCommands,
    },
}

#[derive(Subcommand)]
enum ServiceCommands {
    /// Write and activate the service file.
    Install,
    /// Stop the service and remove its file.
    Uninstall,
    /// Report install and running state.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The long-lived agent also logs to a daily rolling file under the data
    // directory; every other command logs to stderr only.
    if !matches!(cli.command, Commands::Start) {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Refuse to run as root — the session store lives in the login user's home.
    if unsafe { libc::geteuid() } == 0 {
        anyhow::bail!(
            "Courier must not run as root. Use a LaunchAgent (~/Library/LaunchAgents/) \
             instead of a LaunchDaemon (/Library/LaunchDaemons/)."
        );
    }

    match cli.command {
        Commands::Start => {
            let cfg = config::load(&cli.config)?;

            let data_dir = courier_core::shellexpand(&cfg.courier.data_dir);
            std::fs::create_dir_all(&data_dir)?;
            let (file_writer, _log_guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::daily(&data_dir, "courier.log"),
            );
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                        tracing_subscriber::EnvFilter::new(&cfg.courier.log_level)
                    }),
                )
                .with_writer(std::io::stderr.and(file_writer))
                .init();

            println!("Hubfeed Courier — starting agent...");
            let agent = Agent::new(cfg).await?;
            let status = agent.start().await?;
            if !status.verified {
                println!("  token not verified yet — polling stays paused until the backend accepts it");
            }
            if !status.backend_reachable {
                println!("  backend unreachable right now — the loop keeps retrying");
            }
            println!("  press Ctrl+C to stop");

            tokio::signal::ctrl_c().await?;
            println!();
            println!("Shutting down...");
            agent.stop().await?;
        }
        Commands::Status => {
            let cfg = config::load(&cli.config)?;
            let agent = Agent::new(cfg).await?;
            let status = agent.status().await?;
            let masked = agent.masked_token().await?;

            println!("Hubfeed Courier — Status\n");
            println!("Config: {}", cli.config);
            println!();
            println!(
                "  token: {}",
                if !status.configured {
                    "not configured — run `courier init`".to_string()
                } else if status.verified {
                    format!("{masked} (verified)")
                } else {
                    format!("{masked} (not verified)")
                }
            );
            println!(
                "  backend: {}",
                if status.backend_reachable {
                    "reachable"
                } else {
                    "unreachable"
                }
            );

            let avatars = agent.avatars().await?;
            println!();
            if avatars.is_empty() {
                println!("  avatars: none — run `courier login`");
            } else {
                println!("  avatars:");
                for avatar in &avatars {
                    println!(
                        "    {} [{}] — {} source(s)",
                        avatar.name,
                        avatar.status.as_str(),
                        avatar.sources.items.len()
                    );
                }
            }
        }
        Commands::Init => {
            init::run(&cli.config).await?;
        }
        Commands::Login => {
            let cfg = config::load(&cli.config)?;
            let agent = Agent::new(cfg).await?;
            run_login(&agent).await?;
        }
        Commands::History {
            avatar,
            job,
            date,
            event_type,
            text,
            limit,
            summary,
            days,
        } => {
            let cfg = config::load(&cli.config)?;
            let agent = Agent::new(cfg).await?;

            if summary {
                let stats = agent.history_summary(days).await?;
                println!("History summary — last {days} day(s)\n");
                println!(
                    "  events:         {} ({} ok, {} failed)",
                    stats.total_events, stats.successful, stats.failed
                );
                println!("  items returned: {}", stats.total_items_returned);
                println!("  items filtered: {}", stats.total_items_filtered);
                println!("  avg execution:  {:.0} ms", stats.avg_execution_ms);
                if !stats.event_types.is_empty() {
                    println!("\n  by type:");
                    for (event_type, counts) in &stats.event_types {
                        println!(
                            "    {:<28} {:>5} ({} failed)",
                            event_type, counts.count, counts.failed
                        );
                    }
                }
            } else {
                let date = match date {
                    Some(raw) => match raw.parse::<chrono::NaiveDate>() {
                        Ok(parsed) => Some(parsed),
                        Err(_) => anyhow::bail!("invalid --date '{raw}', expected YYYY-MM-DD"),
                    },
                    None => None,
                };
                let query = HistoryQuery {
                    avatar_id: avatar,
                    job_id: job,
                    date,
                    event_type_prefix: event_type,
                    text,
                    limit,
                    ..Default::default()
                };
                let events = agent.history(&query).await?;
                if events.is_empty() {
                    println!("No matching history events");
                }
                for event in &events {
                    println!(
                        "{}  {:<26} {:<7} {}:{}",
                        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        event.event_type,
                        event.status.as_str(),
                        event.resource_type,
                        event.resource_id
                    );
                    if let (Some(returned), Some(filtered)) =
                        (event.items_returned, event.items_filtered)
                    {
                        println!("{:21}{returned} item(s) returned, {filtered} filtered", "");
                    }
                    if let Some(error) = &event.error {
                        println!("{:21}{error}", "");
                    }
                }
            }
        }
        Commands::Service { action } => match action {
            ServiceCommands::Install => service::install(&cli.config)?,
            ServiceCommands::Uninstall => service::uninstall()?,
            ServiceCommands::Status => service::status()?,
        },
    }

    Ok(())
}

/// Interactive login wizard: pick or create an avatar, then connect it over
/// QR or phone code.
async fn run_login(agent: &Agent) -> anyhow::Result<()> {
    cliclack::intro(console::style("courier login").bold().to_string())?;

    let avatars = agent.avatars().await?;
    let mut picker = cliclack::select("Which avatar?");
    for avatar in &avatars {
        picker = picker.item(
            avatar.id.clone(),
            format!("{} [{}]", avatar.name, avatar.status.as_str()),
            &avatar.platform,
        );
    }
    picker = picker.item(String::new(), "Create a new avatar", "");
    let selected: String = picker.interact()?;

    let avatar_id = if selected.is_empty() {
        let name: String = cliclack::input("Avatar name")
            .placeholder("personal")
            .validate(|input: &String| {
                if input.trim().is_empty() {
                    Err("A name is required")
                } else {
                    Ok(())
                }
            })
            .interact()?;
        agent.create_avatar(&name, None).await?.id
    } else {
        selected
    };

    if let Some(avatar) = agent.avatar(&avatar_id).await? {
        if avatar.session_live() {
            let action: &str = cliclack::select(format!("{} is already connected", avatar.name))
                .item("relogin", "Log in again", "replaces the current session")
                .item("logout", "Log out", "revokes the session, keeps the avatar")
                .item("delete", "Delete the avatar", "")
                .item("cancel", "Cancel", "")
                .interact()?;
            match action {
                "logout" => {
                    agent.logout(&avatar_id).await?;
                    cliclack::outro("Logged out")?;
                    return Ok(());
                }
                "delete" => {
                    agent.delete_avatar(&avatar_id).await?;
                    cliclack::outro("Avatar deleted")?;
                    return Ok(());
                }
                "cancel" => {
                    cliclack::outro_cancel("Nothing changed")?;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    let method: &str = cliclack::select("Login method")
        .item("qr", "QR code", "scan from the Telegram app")
        .item("phone", "Phone code", "Telegram sends a login code")
        .interact()?;

    if method == "qr" {
        qr_login(agent, &avatar_id).await
    } else {
        phone_login(agent, &avatar_id).await
    }
}

/// Drive the QR flow: render each token the authenticator hands out and
/// poll until the scan lands or the flow gives up.
async fn qr_login(agent: &Agent, avatar_id: &str) -> anyhow::Result<()> {
    let auth = agent.authenticator();
    auth.start_qr(avatar_id).await?;

    let spinner = cliclack::spinner();
    spinner.start("Requesting a login token from the bridge...");
    let mut shown: Option<String> = None;

    loop {
        let status = auth.status(avatar_id).await;
        match status.state.as_str() {
            "ready" => {
                if let Some(payload) = status.payload {
                    if shown.as_deref() != Some(payload.as_str()) {
                        let art = courier_platform::qr::render_terminal(&payload)?;
                        if shown.is_none() {
                            spinner.stop("QR code ready");
                        } else {
                            cliclack::log::info("The previous code expired — scan this one")?;
                        }
                        cliclack::note("Telegram → Settings → Devices → Link Desktop Device", &art)?;
                        shown = Some(payload);
                    }
                }
            }
            "success" => {
                if shown.is_none() {
                    spinner.stop("Avatar connected");
                } else {
                    cliclack::log::success("Avatar connected")?;
                }
                return finish_login(agent, avatar_id).await;
            }
            "error" | "idle" => {
                let message = status
                    .message
                    .unwrap_or_else(|| "the login flow ended unexpectedly".to_string());
                if shown.is_none() {
                    spinner.error(&message);
                } else {
                    cliclack::log::error(&message)?;
                }
                cliclack::outro_cancel("Login failed — run `courier login` to retry")?;
                return Ok(());
            }
            _ => {}
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

/// Drive the phone flow: request a code, confirm it, and handle the
/// two-step-verification password when the account has one.
async fn phone_login(agent: &Agent, avatar_id: &str) -> anyhow::Result<()> {
    let auth = agent.authenticator();

    let phone: String = cliclack::input("Phone number (international format)")
        .placeholder("+15551234567")
        .validate(|input: &String| {
            if input.trim().is_empty() {
                Err("A phone number is required")
            } else {
                Ok(())
            }
        })
        .interact()?;
    let phone = phone.trim().to_string();

    let spinner = cliclack::spinner();
    spinner.start("Requesting a login code...");
    let code_hash = match auth.start_phone(avatar_id, &phone).await {
        Ok(hash) => {
            spinner.stop("Code sent — check your Telegram app");
            hash
        }
        Err(e) => {
            spinner.error(format!("Could not request a code: {e}"));
            cliclack::outro_cancel("Login failed — run `courier login` to retry")?;
            return Ok(());
        }
    };

    let code: String = cliclack::input("Login code")
        .placeholder("12345")
        .validate(|input: &String| {
            if input.trim().is_empty() {
                Err("The code is required")
            } else {
                Ok(())
            }
        })
        .interact()?;

    let spinner = cliclack::spinner();
    spinner.start("Confirming the code...");
    match auth
        .complete_phone(avatar_id, &phone, code.trim(), &code_hash, None)
        .await
    {
        Ok(PhoneCompletion::Authenticated) => spinner.stop("Avatar connected"),
        Ok(PhoneCompletion::PasswordRequired) => {
            spinner.stop("This account has two-step verification");
            let password: String = cliclack::password("Account password").mask('▪').interact()?;
            let spinner = cliclack::spinner();
            spinner.start("Checking the password...");
            match auth
                .complete_phone(
                    avatar_id,
                    &phone,
                    code.trim(),
                    &code_hash,
                    Some(password.trim()),
                )
                .await
            {
                Ok(PhoneCompletion::Authenticated) => spinner.stop("Avatar connected"),
                Ok(PhoneCompletion::PasswordRequired) => {
                    spinner.error("The password was not accepted");
                    cliclack::outro_cancel("Login failed — run `courier login` to retry")?;
                    return Ok(());
                }
                Err(e) => {
                    spinner.error(format!("Password check failed: {e}"));
                    cliclack::outro_cancel("Login failed — run `courier login` to retry")?;
                    return Ok(());
                }
            }
        }
        Err(e) => {
            spinner.error(format!("Code rejected: {e}"));
            cliclack::outro_cancel("Login failed — run `courier login` to retry")?;
            return Ok(());
        }
    }

    finish_login(agent, avatar_id).await
}

/// Shared tail of both login flows: show who logged in and warm the
/// dialog cache.
async fn finish_login(agent: &Agent, avatar_id: &str) -> anyhow::Result<()> {
    if let Some(avatar) = agent.avatar(avatar_id).await? {
        if let Some(username) = avatar.profile.username {
            cliclack::log::info(format!("Logged in as @{username}"))?;
        }
    }
    match agent.dialogs(avatar_id, 50, true).await {
        Ok(dialogs) => {
            cliclack::log::info(format!("{} dialog(s) visible to this avatar", dialogs.len()))?;
        }
        Err(e) => {
            cliclack::log::warning(format!("Could not list dialogs yet: {e}"))?;
        }
    }
    cliclack::outro("Avatar ready — the backend can now send jobs its way")?;
    Ok(())
}
