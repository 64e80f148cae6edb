//! Demo work functions registered by the server binary.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::task::{Outcome, TaskHandler};
use crate::worker::ProgressReporter;

/// Labels reported while an email is being "sent".
const EMAIL_STEPS: &[&str] = &[
    "Resolving recipient",
    "Rendering template",
    "Connecting to mail server",
    "Sending message",
    "Confirming delivery",
];

/// Simulated email delivery with per-step progress.
pub struct SendEmailTask {
    step_delay: Duration,
}

impl SendEmailTask {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

impl Default for SendEmailTask {
    /// One second per step, five steps.
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Accepts both `emailAddress` and `email_address`.
fn email_address(input: &serde_json::Value) -> Option<&str> {
    input
        .get("emailAddress")
        .or_else(|| input.get("email_address"))
        .and_then(|v| v.as_str())
}

fn is_plausible_address(addr: &str) -> bool {
    match addr.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !addr.contains(' ')
        }
        None => false,
    }
}

#[async_trait]
impl TaskHandler for SendEmailTask {
    fn name(&self) -> &str {
        "send_email"
    }

    fn validate(&self, input: &serde_json::Value) -> Result<(), String> {
        match email_address(input) {
            Some(addr) if is_plausible_address(addr) => Ok(()),
            Some(addr) => Err(format!("'{addr}' is not a valid email address")),
            None => Err("missing 'emailAddress'".to_string()),
        }
    }

    async fn run(&self, input: serde_json::Value, progress: ProgressReporter) -> Outcome {
        let Some(addr) = email_address(&input) else {
            return Outcome::TerminalFailure("missing 'emailAddress'".to_string());
        };
        tracing::debug!(to = %addr, "Start sending email");

        let total = EMAIL_STEPS.len() as u64;
        for (i, label) in EMAIL_STEPS.iter().enumerate() {
            tokio::time::sleep(self.step_delay).await;
            if let Err(e) = progress.step(i as u64 + 1, total, *label).await {
                return Outcome::TerminalFailure(e.to_string());
            }
        }

        Outcome::Success(json!(format!("Email sent to {addr}")))
    }
}

/// Returns its input unchanged.
pub struct EchoTask;

#[async_trait]
impl TaskHandler for EchoTask {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, input: serde_json::Value, _progress: ProgressReporter) -> Outcome {
        Outcome::Success(input)
    }
}
