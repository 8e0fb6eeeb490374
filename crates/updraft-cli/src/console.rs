//! Terminal implementation of the user-interaction boundary.

use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use updraft_core::appcast::AppcastItem;
use updraft_core::driver::{TerminationResponse, UpdateStage, UserDriver, UserUpdateState};
use updraft_core::settings::{PermissionRequest, PermissionResponse};
use updraft_core::{NoUpdateReason, UpdateError, UserChoice};

/// Presents the session on stdin/stdout.
///
/// The unattended variant never prompts. It carries the user's recorded
/// automatic-download consent: with consent it stages and confirms
/// non-major updates on its own, without consent (and for every major
/// upgrade) it answers `Dismiss` so nothing installs until a person asks.
pub struct ConsoleDriver {
    attended: bool,
    auto_install: bool,
    last_percent: Mutex<Option<u64>>,
}

impl ConsoleDriver {
    /// Interactive driver: prompts on every choice.
    pub fn interactive() -> Self {
        Self {
            attended: true,
            auto_install: false,
            last_percent: Mutex::new(None),
        }
    }

    /// Non-interactive driver for scheduled checks. `auto_install` is the
    /// user's recorded automatic-download consent.
    pub fn unattended(auto_install: bool) -> Self {
        Self {
            attended: false,
            auto_install,
            last_percent: Mutex::new(None),
        }
    }

    async fn prompt_choice(&self, question: &str) -> UserChoice {
        let answer = prompt_line(&format!("{question} [i]nstall / [l]ater / [s]kip: ")).await;
        match answer.trim().to_ascii_lowercase().chars().next() {
            Some('i') => UserChoice::Install,
            Some('s') => UserChoice::Skip,
            _ => UserChoice::Dismiss,
        }
    }

    fn describe(item: &AppcastItem, state: UserUpdateState) {
        let title = item.title.as_deref().unwrap_or("Update available");
        println!("\n{title} version {}", item.display_version);
        if state.major_upgrade {
            println!("  This is a major upgrade and will not install automatically.");
        }
        match state.stage {
            UpdateStage::Downloaded => println!("  Already downloaded; ready to continue."),
            UpdateStage::Installing => println!("  An earlier session already began installing."),
            UpdateStage::Informational => {
                if let Some(url) = &item.info_url {
                    println!("  More information: {url}");
                }
            }
            UpdateStage::NotDownloaded => {}
        }
        if let Some(notes) = &item.release_notes_url {
            println!("  Release notes: {notes}");
        }
        if let Some(description) = &item.description {
            println!("  {description}");
        }
    }
}

/// Reads one line of input without blocking the runtime.
async fn prompt_line(prompt: &str) -> String {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || {
        print!("{prompt}");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok();
        line
    })
    .await
    .unwrap_or_default()
}

async fn prompt_bool(question: &str, default: bool) -> bool {
    let suffix = if default { "[Y/n]" } else { "[y/N]" };
    let answer = prompt_line(&format!("{question} {suffix}: ")).await;
    match answer.trim().to_ascii_lowercase().chars().next() {
        Some('y') => true,
        Some('n') => false,
        _ => default,
    }
}

#[async_trait]
impl UserDriver for ConsoleDriver {
    async fn request_permission(&self, request: PermissionRequest) -> PermissionResponse {
        println!("First run: configure automatic update checks.");
        let automatic_checks = prompt_bool("Check for updates automatically?", true).await;
        let automatic_downloads = if automatic_checks {
            Some(prompt_bool("Download updates in the background?", false).await)
        } else {
            None
        };
        println!("The following anonymous profile can accompany checks:");
        for (key, value) in &request.system_profile {
            println!("  {key}: {value}");
        }
        let send_system_profile = prompt_bool("Send it?", false).await;
        PermissionResponse {
            automatic_checks,
            automatic_downloads,
            send_system_profile,
        }
    }

    async fn check_started(&self, _cancel: CancellationToken) {
        println!("Checking for updates...");
    }

    async fn update_found(&self, item: &AppcastItem, state: UserUpdateState) -> UserChoice {
        Self::describe(item, state);
        if !self.attended {
            // Only a consented, non-major, installable update proceeds on
            // a scheduled check; everything else waits for a person.
            let auto = self.auto_install
                && !state.major_upgrade
                && state.stage != UpdateStage::Informational;
            return if auto {
                UserChoice::Install
            } else {
                UserChoice::Dismiss
            };
        }
        self.prompt_choice("Proceed?").await
    }

    async fn download_progress(&self, received: u64, expected: Option<u64>) {
        if let Some(total) = expected.filter(|t| *t > 0) {
            let percent = received * 100 / total;
            let mut last = match self.last_percent.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if *last != Some(percent) {
                *last = Some(percent);
                print!("\rDownloading... {percent}%");
                std::io::stdout().flush().ok();
            }
        }
    }

    async fn extraction_progress(&self, fraction: f64) {
        print!("\rExtracting... {:.0}%", fraction * 100.0);
        std::io::stdout().flush().ok();
    }

    async fn ready_to_install(&self, item: &AppcastItem) -> UserChoice {
        println!("\nVersion {} is staged and verified.", item.display_version);
        if !self.attended {
            return if self.auto_install {
                UserChoice::Install
            } else {
                UserChoice::Dismiss
            };
        }
        self.prompt_choice("Install now?").await
    }

    async fn request_termination(&self) -> TerminationResponse {
        TerminationResponse::Terminate
    }

    async fn installing(&self, terminated: bool) {
        if terminated {
            println!("Installing...");
        } else {
            println!("Installing; restart the application to finish.");
        }
    }

    async fn installed(&self, relaunched: bool) {
        if relaunched {
            println!("Update installed and relaunched.");
        } else {
            println!("Update installed.");
        }
    }

    async fn no_update(&self, reason: NoUpdateReason) {
        match reason {
            NoUpdateReason::OnLatestVersion => println!("You're up to date."),
            NoUpdateReason::OnNewerThanLatest => {
                println!("You're ahead of the latest published version.");
            }
            NoUpdateReason::SystemTooOld => {
                println!("An update exists but needs a newer OS.");
            }
            NoUpdateReason::SystemTooNew => {
                println!("No update is available for this OS version.");
            }
            NoUpdateReason::Unknown => println!("No update available."),
        }
    }

    async fn error(&self, error: &UpdateError) {
        eprintln!("Update failed: {error}");
    }

    async fn bring_to_focus(&self) {
        println!("A check is already in progress.");
    }

    async fn dismiss_all(&self) {
        println!();
    }
}
