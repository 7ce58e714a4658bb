//! Interactive setup wizard — walks from an empty machine to a configured agent.

use courier_core::config::{BackendConfig, Config, CourierConfig};

use crate::agent::Agent;
use crate::service;

const LOGO: &str = r#"
     ██████╗ ██████╗ ██╗   ██╗██████╗ ██╗███████╗██████╗
    ██╔════╝██╔═══██╗██║   ██║██╔══██╗██║██╔════╝██╔══██╗
    ██║     ██║   ██║██║   ██║██████╔╝██║█████╗  ██████╔╝
    ██║     ██║   ██║██║   ██║██╔══██╗██║██╔══╝  ██╔══██╗
    ╚██████╗╚██████╔╝╚██████╔╝██║  ██║██║███████╗██║  ██║
     ╚═════╝ ╚═════╝  ╚═════╝ ╚═╝  ╚═╝╚═╝╚══════╝╚═╝  ╚═╝
"#;

/// Run the interactive setup wizard.
pub async fn run(config_path: &str) -> anyhow::Result<()> {
    println!("{}", console::style(LOGO).cyan());
    cliclack::intro(console::style("courier init").bold().to_string())?;

    // 1. Create data directory.
    let data_dir = courier_core::shellexpand("~/.courier");
    std::fs::create_dir_all(&data_dir)?;
    cliclack::log::success(format!("Data directory: {data_dir}"))?;

    // 2. Backend URL.
    let backend_url: String = cliclack::input("Backend URL (leave empty for the default)")
        .placeholder("https://hubfeed.app")
        .required(false)
        .default_input("")
        .interact()?;
    let backend_url = if backend_url.trim().is_empty() {
        "https://hubfeed.app".to_string()
    } else {
        backend_url.trim().trim_end_matches('/').to_string()
    };

    // 3. Agent token, verified against the backend right away.
    let token: String = cliclack::input("Agent token (from the Hubfeed dashboard)")
        .placeholder("couriertok-...")
        .validate(|input: &String| {
            if input.trim().is_empty() {
                Err("A token is required — create one in the dashboard first")
            } else {
                Ok(())
            }
        })
        .interact()?;

    let verify_config = Config {
        courier: CourierConfig {
            data_dir: "~/.courier".to_string(),
            ..Default::default()
        },
        backend: BackendConfig {
            base_url: backend_url.clone(),
            ..Default::default()
        },
        ..Default::default()
    };
    let agent = Agent::new(verify_config).await?;

    let spinner = cliclack::spinner();
    spinner.start("Verifying agent token...");
    match agent.update_token(&token).await {
        Ok(true) => spinner.stop("Agent token verified"),
        Ok(false) => {
            spinner.error("Token not verified");
            cliclack::log::warning(
                "The token is stored, but job polling stays paused until a verification \
                 succeeds. Check the dashboard or rerun `courier init` with a fresh token.",
            )?;
        }
        Err(e) => {
            spinner.error(format!("Could not store the token: {e}"));
            cliclack::outro_cancel("Setup aborted")?;
            return Ok(());
        }
    }

    // 4. Telegram bridge URL.
    let bridge_url: String = cliclack::input("Telegram bridge URL (leave empty for the default)")
        .placeholder("http://127.0.0.1:8077")
        .required(false)
        .default_input("")
        .interact()?;
    let bridge_url = if bridge_url.trim().is_empty() {
        "http://127.0.0.1:8077".to_string()
    } else {
        bridge_url.trim().trim_end_matches('/').to_string()
    };

    // 5. Poll interval.
    let poll_interval: u64 = cliclack::select("Job poll interval")
        .item(30, "30 seconds", "recommended")
        .item(15, "15 seconds", "lower latency, more backend traffic")
        .item(60, "1 minute", "")
        .item(120, "2 minutes", "")
        .interact()?;

    // 6. Write config.toml — existing files are left untouched.
    let config_file = std::path::Path::new(config_path);
    if config_file.exists() {
        cliclack::log::warning(format!("{config_path} already exists — leaving it untouched"))?;
    } else {
        let content = generate_config(&backend_url, &bridge_url, poll_interval);
        std::fs::write(config_file, content)?;
        cliclack::log::success(format!("Wrote {config_path}"))?;
    }

    // 7. Offer to install as a login service.
    let install_service: bool = cliclack::confirm("Start Courier automatically on login?")
        .initial_value(false)
        .interact()?;
    if install_service {
        if let Err(e) = service::install(config_path) {
            cliclack::log::warning(format!("Service install failed: {e}"))?;
        }
    }

    // 8. Next steps.
    let mut steps = String::from("1. Log an avatar in:   courier login\n");
    if install_service {
        steps.push_str("2. Check the service:  courier service status\n");
    } else {
        steps.push_str("2. Start the agent:    courier start\n");
    }
    steps.push_str("3. Watch it work:      courier history");
    cliclack::note("Next steps", &steps)?;

    cliclack::outro("Setup complete")?;
    Ok(())
}

/// Render the bootstrap config (pure function for testability).
pub fn generate_config(backend_url: &str, bridge_url: &str, poll_interval_secs: u64) -> String {
    format!(
        r#"# Hubfeed Courier configuration — generated by `courier init`.
# Runtime state (agent token, avatars, blacklist) lives in JSON documents
# under the data directory, not in this file.

[courier]
data_dir = "~/.courier"
log_level = "info"
history_keep_days = 30

[backend]
base_url = "{backend_url}"
poll_interval_secs = {poll_interval_secs}
request_timeout_secs = 30

[platform.telegram]
enabled = true
bridge_url = "{bridge_url}"
request_timeout_secs = 30
"#
    )
}
