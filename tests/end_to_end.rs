
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use mock_gmail::MockGmailServer;

use mailgrab::config::{AccountConfig, Config, DownloadConfig};
use mailgrab::matcher::{FilterSetDef, PatternSpec};
use mailgrab::run::{self, AccountFailure, AccountOutcome, RunOptions, SkipReason};
use mailgrab::vault::{Credential, Vault};

fn billing_pdf_filter() -> Vec<FilterSetDef> {
    vec![FilterSetDef {
        from: Some(PatternSpec::One("billing@".to_string())),
        to: None,
        subject: None,
        body: None,
        attachments: Some(PatternSpec::One("*.pdf".to_string())),
    }]
}

fn make_config(base: &Path, accounts: Vec<AccountConfig>) -> Config {
    Config {
        accounts,
        download: DownloadConfig {
            default_days: 7,
            base_path: base.join("downloads"),
        },
        vault_dir: base.join("vault"),
    }
}

fn credential(access_token: &str, token_uri: &str, expired: bool) -> Credential {
    let expiry = if expired {
        Utc::now() - chrono::Duration::hours(1)
    } else {
        Utc::now() + chrono::Duration::hours(1)
    };
    Credential {
        access_token: access_token.to_string(),
        refresh_token: Some("refresh-token".to_string()),
        token_uri: token_uri.to_string(),
        client_id: "cid".to_string(),
        client_secret: "cs".to_string(),
        scopes: vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()],
        expiry: Some(expiry),
    }
}

fn collect_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if !dir.exists() {
        return files;
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn runner_options(server: &MockGmailServer) -> RunOptions {
    RunOptions {
        days: 7,
        gmail_base_url: Some(server.url()),
    }
}

#[test]
fn downloads_only_selected_attachments_of_matching_messages() {
    let server = MockGmailServer::start();
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![AccountConfig {
            email: "me@example.com".to_string(),
            filters: billing_pdf_filter(),
        }],
    );
    let vault = Vault::open(&config.vault_dir).unwrap();
    vault
        .store(
            "me@example.com",
            &credential(mock_gmail::GOOD_TOKEN, &server.token_url(), false),
        )
        .unwrap();

    let cancel = AtomicBool::new(false);
    let summary = run::run(&config, &vault, &runner_options(&server), &cancel);

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.accounts.len(), 1);
    match &summary.accounts[0].1 {
        AccountOutcome::Done(stats) => {
            // The mock serves the list across two pages.
            assert_eq!(stats.examined, 3);
            // msg-1 and msg-3 match the sender; msg-2 does not.
            assert_eq!(stats.matched, 2);
            // Only msg-1's pdf is selected; the txt and msg-3 produce nothing.
            assert_eq!(stats.downloaded, 1);
            assert_eq!(stats.failed_writes, 0);

            // Per-message outcomes carry the reason codes.
            assert_eq!(stats.messages.len(), 3);
            assert_eq!(stats.messages[0].id, "msg-1");
            assert_eq!(stats.messages[0].filter_set, Some(0));
            assert_eq!(stats.messages[0].skip_reason, None);
            assert_eq!(stats.messages[0].written.len(), 1);
            assert!(stats.messages[0].written[0].ends_with("0315_msg-1_invoice_2024.pdf"));
            assert_eq!(stats.messages[1].id, "msg-2");
            assert_eq!(stats.messages[1].filter_set, None);
            assert_eq!(stats.messages[1].skip_reason, Some(SkipReason::NoFilterMatch));
            assert!(stats.messages[1].written.is_empty());
            assert_eq!(stats.messages[2].id, "msg-3");
            assert_eq!(stats.messages[2].filter_set, Some(0));
            assert_eq!(stats.messages[2].skip_reason, Some(SkipReason::NoAttachments));
        }
        other => panic!("expected Done, got {:?}", other),
    }

    let files = collect_files(&config.download.base_path);
    assert_eq!(files.len(), 1, "files on disk: {:?}", files);
    assert!(files[0].ends_with(
        Path::new("me@example.com")
            .join("2024")
            .join("0315_msg-1_invoice_2024.pdf")
    ));
    assert_eq!(std::fs::read(&files[0]).unwrap(), mock_gmail::PDF_BYTES);
}

#[test]
fn rerun_does_not_overwrite_existing_download() {
    let server = MockGmailServer::start();
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![AccountConfig {
            email: "me@example.com".to_string(),
            filters: billing_pdf_filter(),
        }],
    );
    let vault = Vault::open(&config.vault_dir).unwrap();
    vault
        .store(
            "me@example.com",
            &credential(mock_gmail::GOOD_TOKEN, &server.token_url(), false),
        )
        .unwrap();

    let cancel = AtomicBool::new(false);
    let first = run::run(&config, &vault, &runner_options(&server), &cancel);
    assert_eq!(first.exit_code(), 0);
    let original = collect_files(&config.download.base_path);
    assert_eq!(original.len(), 1);
    let original_bytes = std::fs::read(&original[0]).unwrap();

    let second = run::run(&config, &vault, &runner_options(&server), &cancel);
    assert_eq!(second.exit_code(), 0);

    let files = collect_files(&config.download.base_path);
    assert_eq!(files.len(), 2, "files on disk: {:?}", files);
    // The first file is byte-identical and the rerun landed beside it.
    assert_eq!(std::fs::read(&original[0]).unwrap(), original_bytes);
    assert!(files
        .iter()
        .any(|f| f.ends_with("0315_msg-1_invoice_2024_01.pdf")));
}

#[test]
fn write_failure_aborts_remaining_attachments_of_message() {
    let server = MockGmailServer::start();
    let dir = tempfile::tempdir().unwrap();

    // No attachments pattern: both of msg-1's attachments are selected.
    let config = make_config(
        dir.path(),
        vec![AccountConfig {
            email: "me@example.com".to_string(),
            filters: vec![FilterSetDef {
                from: Some(PatternSpec::One("billing@".to_string())),
                to: None,
                subject: None,
                body: None,
                attachments: None,
            }],
        }],
    );
    let vault = Vault::open(&config.vault_dir).unwrap();
    vault
        .store(
            "me@example.com",
            &credential(mock_gmail::GOOD_TOKEN, &server.token_url(), false),
        )
        .unwrap();

    // A regular file where the account directory belongs makes every write
    // for this account fail.
    std::fs::create_dir_all(&config.download.base_path).unwrap();
    std::fs::write(config.download.base_path.join("me@example.com"), b"in the way").unwrap();

    let cancel = AtomicBool::new(false);
    let summary = run::run(&config, &vault, &runner_options(&server), &cancel);

    assert_eq!(summary.exit_code(), 1);
    match &summary.accounts[0].1 {
        AccountOutcome::Done(stats) => {
            assert_eq!(stats.examined, 3);
            // The first failure aborts msg-1's second attachment, so the
            // message counts one failed write, not two.
            assert_eq!(stats.failed_writes, 1);
            assert_eq!(stats.downloaded, 0);
            assert!(stats.messages[0].failed_write);
            assert!(stats.messages[0].written.is_empty());
        }
        other => panic!("expected Done, got {:?}", other),
    }
}

#[test]
fn matched_message_selecting_nothing_reports_reason() {
    let server = MockGmailServer::start();
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![AccountConfig {
            email: "me@example.com".to_string(),
            filters: vec![FilterSetDef {
                from: Some(PatternSpec::One("newsletter@".to_string())),
                to: None,
                subject: None,
                body: None,
                attachments: Some(PatternSpec::One("*.zip".to_string())),
            }],
        }],
    );
    let vault = Vault::open(&config.vault_dir).unwrap();
    vault
        .store(
            "me@example.com",
            &credential(mock_gmail::GOOD_TOKEN, &server.token_url(), false),
        )
        .unwrap();

    let cancel = AtomicBool::new(false);
    let summary = run::run(&config, &vault, &runner_options(&server), &cancel);

    assert_eq!(summary.exit_code(), 0);
    match &summary.accounts[0].1 {
        AccountOutcome::Done(stats) => {
            assert_eq!(stats.matched, 1);
            assert_eq!(stats.downloaded, 0);
            // msg-2 matched but its promo.pdf is not a *.zip.
            assert_eq!(stats.messages[1].id, "msg-2");
            assert_eq!(stats.messages[1].filter_set, Some(0));
            assert_eq!(
                stats.messages[1].skip_reason,
                Some(SkipReason::NoneSelected)
            );
        }
        other => panic!("expected Done, got {:?}", other),
    }
    assert!(collect_files(&config.download.base_path).is_empty());
}

#[test]
fn missing_credentials_skip_account_with_reauth_hint() {
    let server = MockGmailServer::start();
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![AccountConfig {
            email: "nobody@example.com".to_string(),
            filters: billing_pdf_filter(),
        }],
    );
    let vault = Vault::open(&config.vault_dir).unwrap();

    let cancel = AtomicBool::new(false);
    let summary = run::run(&config, &vault, &runner_options(&server), &cancel);

    assert_eq!(summary.exit_code(), 1);
    match &summary.accounts[0].1 {
        AccountOutcome::Skipped(failure) => {
            assert!(matches!(failure, AccountFailure::NoCredentials));
            assert!(failure.needs_reauth());
        }
        other => panic!("expected Skipped, got {:?}", other),
    }
    assert!(collect_files(&config.download.base_path).is_empty());
}

#[test]
fn rejected_token_skips_account() {
    let server = MockGmailServer::start();
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![AccountConfig {
            email: "me@example.com".to_string(),
            filters: billing_pdf_filter(),
        }],
    );
    let vault = Vault::open(&config.vault_dir).unwrap();
    vault
        .store(
            "me@example.com",
            &credential("stale-token", &server.token_url(), false),
        )
        .unwrap();

    let cancel = AtomicBool::new(false);
    let summary = run::run(&config, &vault, &runner_options(&server), &cancel);

    assert_eq!(summary.exit_code(), 1);
    match &summary.accounts[0].1 {
        AccountOutcome::Skipped(failure) => {
            assert!(matches!(failure, AccountFailure::AuthFailed(_)));
            assert!(failure.needs_reauth());
        }
        other => panic!("expected Skipped, got {:?}", other),
    }
}

#[test]
fn expired_token_is_refreshed_and_persisted() {
    let server = MockGmailServer::start();
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![AccountConfig {
            email: "me@example.com".to_string(),
            filters: billing_pdf_filter(),
        }],
    );
    let vault = Vault::open(&config.vault_dir).unwrap();
    vault
        .store(
            "me@example.com",
            &credential("old-access-token", &server.token_url(), true),
        )
        .unwrap();

    let cancel = AtomicBool::new(false);
    let summary = run::run(&config, &vault, &runner_options(&server), &cancel);

    assert_eq!(summary.exit_code(), 0);
    match &summary.accounts[0].1 {
        AccountOutcome::Done(stats) => assert_eq!(stats.downloaded, 1),
        other => panic!("expected Done, got {:?}", other),
    }

    let stored = vault.load("me@example.com").unwrap();
    assert_eq!(stored.access_token, mock_gmail::REFRESHED_TOKEN);
    // The refresh token survives a response that omits it.
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-token"));
}

#[test]
fn one_broken_account_does_not_stop_the_others() {
    let server = MockGmailServer::start();
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![
            AccountConfig {
                email: "broken@example.com".to_string(),
                filters: billing_pdf_filter(),
            },
            AccountConfig {
                email: "me@example.com".to_string(),
                filters: billing_pdf_filter(),
            },
        ],
    );
    let vault = Vault::open(&config.vault_dir).unwrap();
    vault
        .store(
            "me@example.com",
            &credential(mock_gmail::GOOD_TOKEN, &server.token_url(), false),
        )
        .unwrap();

    let cancel = AtomicBool::new(false);
    let summary = run::run(&config, &vault, &runner_options(&server), &cancel);

    // Skipped account makes the run fail overall, but the good one finished.
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.accounts.len(), 2);
    assert!(matches!(
        summary.accounts[0].1,
        AccountOutcome::Skipped(AccountFailure::NoCredentials)
    ));
    match &summary.accounts[1].1 {
        AccountOutcome::Done(stats) => assert_eq!(stats.downloaded, 1),
        other => panic!("expected Done, got {:?}", other),
    }

    let files = collect_files(&config.download.base_path);
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with(config.download.base_path.join("me@example.com")));
}

#[test]
fn cancelled_run_reports_interruption() {
    let server = MockGmailServer::start();
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![AccountConfig {
            email: "me@example.com".to_string(),
            filters: billing_pdf_filter(),
        }],
    );
    let vault = Vault::open(&config.vault_dir).unwrap();
    vault
        .store(
            "me@example.com",
            &credential(mock_gmail::GOOD_TOKEN, &server.token_url(), false),
        )
        .unwrap();

    let cancel = AtomicBool::new(true);
    let summary = run::run(&config, &vault, &runner_options(&server), &cancel);

    assert!(summary.interrupted);
    assert_eq!(summary.exit_code(), 1);
    assert!(collect_files(&config.download.base_path).is_empty());
}
