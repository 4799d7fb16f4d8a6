use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mailgrab::config::{default_config_path, Config};
use mailgrab::run::{AccountOutcome, RunOptions};
use mailgrab::vault::Vault;
use mailgrab::{auth, log, log_error, log_info, run};

fn print_help() {
    eprintln!("Usage: mailgrab [OPTIONS]");
    eprintln!();
    eprintln!("Downloads matching Gmail attachments for every configured account.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config=PATH    Use config file at PATH instead of default");
    eprintln!("  --days=N         Look back N days (overrides default_days)");
    eprintln!("  --auth=EMAIL     Run the OAuth consent flow for EMAIL and exit");
    eprintln!("  --verbose        Enable debug logging");
    eprintln!("  --help           Show this help");
}

fn load_config(config_path: &Path) -> Config {
    match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config from {}: {}", config_path.display(), e);
            eprintln!("Create a config file with:");
            eprintln!();
            eprintln!("  [download]");
            eprintln!("  base_path = \"~/attachments\"");
            eprintln!();
            eprintln!("  [account.\"you@gmail.com\"]");
            eprintln!("  [[account.\"you@gmail.com\".filter]]");
            eprintln!("  from = \"billing@\"");
            eprintln!("  attachments = \"*.pdf\"");
            std::process::exit(1);
        }
    }
}

fn run_auth(config_path: &Path, vault_dir: &Path, email: &str) {
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let client = match auth::load_client_secret(config_dir) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let credential = match auth::authorize_interactive(&client, email) {
        Ok(credential) => credential,
        Err(e) => {
            eprintln!("Authorization failed: {}", e);
            std::process::exit(1);
        }
    };

    let vault = match Vault::open(vault_dir) {
        Ok(vault) => vault,
        Err(e) => {
            eprintln!("Cannot open vault at {}: {}", vault_dir.display(), e);
            std::process::exit(1);
        }
    };
    if let Err(e) = vault.store(email, &credential) {
        eprintln!("Failed to store credentials: {}", e);
        std::process::exit(1);
    }

    println!("Stored credentials for {}.", email);
}

fn print_summary(summary: &run::RunSummary) {
    eprintln!();
    eprintln!("==== Summary ====");
    for (email, outcome) in &summary.accounts {
        match outcome {
            AccountOutcome::Done(stats) => {
                let status = if stats.failed_writes > 0 { "NG" } else { "OK" };
                eprintln!(
                    "{}  {}: {} downloaded (examined {}, matched {}, failed {})",
                    status,
                    email,
                    stats.downloaded,
                    stats.examined,
                    stats.matched,
                    stats.failed_writes
                );
            }
            AccountOutcome::Skipped(failure) => {
                eprintln!("NG  {}: {}", email, failure);
                if failure.needs_reauth() {
                    eprintln!("    run with --auth={} to authorize", email);
                }
            }
        }
    }
    if summary.interrupted {
        eprintln!("Interrupted before all accounts were processed.");
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        std::process::exit(0);
    }

    if args.iter().any(|a| a == "--verbose" || a == "-v") {
        log::set_verbose(true);
    }

    let config_path = args
        .iter()
        .find(|a| a.starts_with("--config="))
        .map(|a| PathBuf::from(&a["--config=".len()..]))
        .unwrap_or_else(default_config_path);

    // Authorization works before a config file exists; fall back to the
    // default vault location when the config cannot be loaded.
    if let Some(auth_arg) = args.iter().find(|a| a.starts_with("--auth=")) {
        let email = &auth_arg["--auth=".len()..];
        if email.is_empty() {
            eprintln!("Usage: --auth=EMAIL");
            std::process::exit(1);
        }
        let vault_dir = match Config::load(&config_path) {
            Ok(config) => {
                if !config.accounts.iter().any(|a| a.email == email) {
                    eprintln!(
                        "Warning: {} is not in the config file; authorizing anyway.",
                        email
                    );
                }
                config.vault_dir
            }
            Err(e) => {
                eprintln!(
                    "Note: config not loaded ({}); using the default vault location.",
                    e
                );
                mailgrab::config::default_vault_dir()
            }
        };
        run_auth(&config_path, &vault_dir, email);
        std::process::exit(0);
    }

    let config = load_config(&config_path);

    let days = match args.iter().find(|a| a.starts_with("--days=")) {
        Some(arg) => match arg["--days=".len()..].parse::<u32>() {
            Ok(days) if days > 0 => days,
            _ => {
                eprintln!("--days requires a positive integer");
                std::process::exit(1);
            }
        },
        None => config.download.default_days,
    };

    let vault = match Vault::open(&config.vault_dir) {
        Ok(vault) => vault,
        Err(e) => {
            eprintln!("Cannot open vault at {}: {}", config.vault_dir.display(), e);
            std::process::exit(1);
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            cancel.store(true, Ordering::SeqCst);
            eprintln!("Interrupt received, finishing current message...");
        }) {
            log_error!("[MAIN] Failed to install interrupt handler: {}", e);
        }
    }

    log_info!(
        "[MAIN] Starting run: {} account(s), {} day(s) back",
        config.accounts.len(),
        days
    );

    let options = RunOptions {
        days,
        gmail_base_url: None,
    };
    let summary = run::run(&config, &vault, &options, &cancel);

    print_summary(&summary);
    std::process::exit(summary.exit_code());
}
