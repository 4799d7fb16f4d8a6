use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::auth;
use crate::config::{AccountConfig, Config};
use crate::gmail::client::{GmailClient, GmailError};
use crate::matcher;
use crate::paths::PathPlanner;
use crate::vault::{Vault, VaultError};

pub struct RunOptions {
    pub days: u32,
    /// Alternate API endpoint, used by integration tests.
    pub gmail_base_url: Option<String>,
}

/// Why a whole account was skipped. Credential problems carry a hint to
/// re-run with --auth.
#[derive(Debug)]
pub enum AccountFailure {
    NoCredentials,
    AuthFailed(String),
    Api(String),
}

impl AccountFailure {
    pub fn needs_reauth(&self) -> bool {
        matches!(
            self,
            AccountFailure::NoCredentials | AccountFailure::AuthFailed(_)
        )
    }
}

impl std::fmt::Display for AccountFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountFailure::NoCredentials => write!(f, "no stored credentials"),
            AccountFailure::AuthFailed(e) => write!(f, "authentication failed: {}", e),
            AccountFailure::Api(e) => write!(f, "{}", e),
        }
    }
}

/// Why a matched-or-examined message produced no files. None of these are
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoFilterMatch,
    NoAttachments,
    NoneSelected,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoFilterMatch => write!(f, "no filter set matched"),
            SkipReason::NoAttachments => write!(f, "matched but carries no attachments"),
            SkipReason::NoneSelected => write!(f, "matched but no attachment was selected"),
        }
    }
}

/// What happened to one examined message. Either it was skipped for a
/// reason, or some of its attachments were written (a write failure aborts
/// the message's remaining attachments; files already written stay).
#[derive(Debug)]
pub struct MessageOutcome {
    pub id: String,
    pub filter_set: Option<usize>,
    pub skip_reason: Option<SkipReason>,
    pub written: Vec<PathBuf>,
    pub failed_write: bool,
}

#[derive(Debug, Default)]
pub struct AccountStats {
    pub examined: usize,
    pub matched: usize,
    pub downloaded: usize,
    pub failed_writes: usize,
    pub messages: Vec<MessageOutcome>,
}

#[derive(Debug)]
pub enum AccountOutcome {
    Done(AccountStats),
    Skipped(AccountFailure),
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub accounts: Vec<(String, AccountOutcome)>,
    pub interrupted: bool,
}

impl RunSummary {
    /// Nonzero when any account was skipped, any write failed, or the run
    /// was interrupted.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            return 1;
        }
        for (_, outcome) in &self.accounts {
            match outcome {
                AccountOutcome::Skipped(_) => return 1,
                AccountOutcome::Done(stats) if stats.failed_writes > 0 => return 1,
                AccountOutcome::Done(_) => {}
            }
        }
        0
    }
}

fn build_query(days: u32) -> String {
    let after = (Utc::now() - Duration::days(i64::from(days))).date_naive();
    format!("after:{} has:attachment", after.format("%Y/%m/%d"))
}

/// Write attachment bytes next to the destination, then rename into place.
/// A failed write leaves no partial file at the final path.
fn write_attachment(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let tmp = dir.join(format!(
        ".{}.part",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string())
    ));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn process_account(
    account: &AccountConfig,
    vault: &Vault,
    options: &RunOptions,
    planner: &mut PathPlanner,
    cancel: &AtomicBool,
) -> Result<AccountStats, AccountFailure> {
    let mut credential = match vault.load(&account.email) {
        Ok(credential) => credential,
        Err(VaultError::Missing(_)) => return Err(AccountFailure::NoCredentials),
        Err(e) => return Err(AccountFailure::AuthFailed(e.to_string())),
    };

    if credential.is_expired() {
        log_info!("[RUN] Access token for {} expired, refreshing", account.email);
        credential = auth::refresh(&credential)
            .map_err(|e| AccountFailure::AuthFailed(e.to_string()))?;
        if let Err(e) = vault.store(&account.email, &credential) {
            log_warn!(
                "[RUN] Could not persist refreshed token for {}: {}",
                account.email,
                e
            );
        }
    }

    let client = match &options.gmail_base_url {
        Some(base) => GmailClient::with_base_url(&credential.access_token, base),
        None => GmailClient::new(&credential.access_token),
    };

    let filters = matcher::compile_filter_sets(&account.filters, &account.email);
    for (idx, def) in account.filters.iter().enumerate() {
        log_debug!(
            "[RUN] {} filter set {}: {}",
            account.email,
            idx,
            matcher::describe_filter_set(def)
        );
    }
    let query = build_query(options.days);
    let ids = client
        .list_messages(&query)
        .map_err(|e| account_failure(e))?;

    let mut stats = AccountStats::default();
    for id in &ids {
        if cancel.load(Ordering::SeqCst) {
            break;
        }

        let message = client.get_message(id).map_err(account_failure)?;
        stats.examined += 1;

        let result = matcher::evaluate(&filters, &message);
        let mut outcome = MessageOutcome {
            id: message.id.clone(),
            filter_set: result.filter_set,
            skip_reason: None,
            written: Vec::new(),
            failed_write: false,
        };

        match result.filter_set {
            None => {
                outcome.skip_reason = Some(SkipReason::NoFilterMatch);
            }
            Some(set_index) => {
                stats.matched += 1;

                let filenames: Vec<&str> = message
                    .attachments
                    .iter()
                    .map(|a| a.filename.as_str())
                    .collect();
                let selected = matcher::select_attachments(&filters[set_index], &filenames);

                if message.attachments.is_empty() {
                    outcome.skip_reason = Some(SkipReason::NoAttachments);
                } else if selected.is_empty() {
                    outcome.skip_reason = Some(SkipReason::NoneSelected);
                } else {
                    for index in selected {
                        let attachment = &message.attachments[index];
                        let bytes = client
                            .get_attachment(&message.id, &attachment.attachment_id)
                            .map_err(account_failure)?;

                        let destination = match planner.plan(
                            &account.email,
                            message.internal_date,
                            &message.id,
                            &attachment.filename,
                        ) {
                            Ok(path) => path,
                            Err(e) => {
                                log_error!(
                                    "[RUN] Cannot create directory for {} of message {}: {}",
                                    attachment.filename,
                                    message.id,
                                    e
                                );
                                outcome.failed_write = true;
                                // Skip this message's remaining attachments.
                                break;
                            }
                        };

                        match write_attachment(&destination, &bytes) {
                            Ok(()) => {
                                log_info!("[RUN] Saved {}", destination.display());
                                stats.downloaded += 1;
                                outcome.written.push(destination);
                            }
                            Err(e) => {
                                log_error!(
                                    "[RUN] Failed to write {}: {}",
                                    destination.display(),
                                    e
                                );
                                outcome.failed_write = true;
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Some(reason) = outcome.skip_reason {
            log_debug!("[RUN] Message {}: {}", message.id, reason);
        }
        if outcome.failed_write {
            stats.failed_writes += 1;
        }
        stats.messages.push(outcome);
    }

    Ok(stats)
}

fn account_failure(e: GmailError) -> AccountFailure {
    match e {
        GmailError::Auth(msg) => AccountFailure::AuthFailed(msg),
        other => AccountFailure::Api(other.to_string()),
    }
}

/// Process every configured account in order. A failure confined to one
/// account never stops the others.
pub fn run(config: &Config, vault: &Vault, options: &RunOptions, cancel: &AtomicBool) -> RunSummary {
    let mut planner = PathPlanner::new(&config.download.base_path);
    let mut summary = RunSummary::default();

    for account in &config.accounts {
        if cancel.load(Ordering::SeqCst) {
            summary.interrupted = true;
            break;
        }

        log_info!("[RUN] Processing account: {}", account.email);
        let outcome = match process_account(account, vault, options, &mut planner, cancel) {
            Ok(stats) => {
                log_info!(
                    "[RUN] {}: examined {}, matched {}, downloaded {}, failed {}",
                    account.email,
                    stats.examined,
                    stats.matched,
                    stats.downloaded,
                    stats.failed_writes
                );
                AccountOutcome::Done(stats)
            }
            Err(failure) => {
                log_error!("[RUN] Skipping {}: {}", account.email, failure);
                AccountOutcome::Skipped(failure)
            }
        };
        summary.accounts.push((account.email.clone(), outcome));
    }

    if cancel.load(Ordering::SeqCst) {
        summary.interrupted = true;
    }

    summary
}
