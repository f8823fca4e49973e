//! Failure reports by email, over SMTP with STARTTLS.

use std::error::Error;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::config::NotificationConfig;
use crate::jobs::Job;
use crate::notify::{failure_report, Notifier};

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Email build error: {0}")]
    Build(String),
}

pub struct EmailNotifier {
    config: NotificationConfig,
    password: Option<String>,
}

impl EmailNotifier {
    /// Builds a notifier, reading the SMTP password from the environment
    /// variable named in `password_env`.
    pub fn new(config: NotificationConfig) -> Self {
        let password = config
            .password_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        Self { config, password }
    }

    fn build_message(&self, job: &Job, error: &(dyn Error + 'static)) -> Result<Message, EmailError> {
        let mut builder = Message::builder()
            .from(self.config.from.parse()?)
            .subject(format!("[mapsched] Job #{} failed: {}", job.id, job.params.title))
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.config.recipients {
            builder = builder.to(recipient.parse()?);
        }
        builder
            .body(failure_report(job, error))
            .map_err(|e| EmailError::Build(e.to_string()))
    }

    fn send(&self, job: &Job, error: &(dyn Error + 'static)) -> Result<(), EmailError> {
        let message = self.build_message(job, error)?;

        let mut transport =
            SmtpTransport::starttls_relay(&self.config.smtp_host)?.port(self.config.smtp_port);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.password) {
            transport = transport.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        transport.build().send(&message)?;
        Ok(())
    }
}

impl Notifier for EmailNotifier {
    fn notify_failure(&self, job: &Job, error: &(dyn Error + 'static)) {
        match self.send(job, error) {
            Ok(()) => tracing::info!(
                job_id = job.id,
                recipients = self.config.recipients.len(),
                "Failure report sent"
            ),
            Err(e) => tracing::error!(job_id = job.id, error = %e, "Could not send failure report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{BoundingBox, JobStatus, RenderArea, RenderParams};
    use crate::render::RenderError;
    use chrono::Utc;
    use serial_test::serial;

    fn job() -> Job {
        Job {
            id: 12,
            status: JobStatus::InProgress,
            params: RenderParams {
                title: "Lyon".to_string(),
                area: RenderArea::BoundingBox(BoundingBox {
                    lat_upper_left: 45.8,
                    lon_upper_left: 4.77,
                    lat_bottom_right: 45.7,
                    lon_bottom_right: 4.9,
                }),
                stylesheet: "default".to_string(),
                layout: "plain".to_string(),
                paper_width_mm: 210,
                paper_height_mm: 297,
                locale: "fr_FR.UTF-8".to_string(),
            },
            submitted_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
            result_message: None,
            queue_index_at_submission: 1,
        }
    }

    fn config(recipients: Vec<&str>) -> NotificationConfig {
        NotificationConfig {
            smtp_host: "127.0.0.1".to_string(),
            smtp_port: 1,
            from: "mapsched@example.org".to_string(),
            recipients: recipients.into_iter().map(String::from).collect(),
            username: None,
            password_env: None,
        }
    }

    #[test]
    fn test_message_contains_job_dump() {
        let notifier = EmailNotifier::new(config(vec!["ops@example.org", "dev@example.org"]));
        let error = RenderError::Rendering("segfault in cairo".to_string());
        let message = notifier.build_message(&job(), &error).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("Job #12 failed"));
        assert!(raw.contains("segfault in cairo"));
        assert!(raw.contains("\"title\": \"Lyon\""));
        assert_eq!(message.envelope().to().len(), 2);
    }

    #[test]
    fn test_bad_recipient_is_an_error() {
        let notifier = EmailNotifier::new(config(vec!["not-an-address"]));
        let error = RenderError::Interrupted;
        assert!(matches!(
            notifier.build_message(&job(), &error),
            Err(EmailError::Address(_))
        ));
    }

    #[test]
    fn test_delivery_failure_is_swallowed() {
        // Nothing listens on port 1; the call must still return normally.
        let notifier = EmailNotifier::new(config(vec!["ops@example.org"]));
        notifier.notify_failure(&job(), &RenderError::Interrupted);
    }

    #[test]
    #[serial]
    fn test_password_read_from_named_env_var() {
        std::env::set_var("MAPSCHED_TEST_SMTP_PASSWORD", "hunter2");
        let mut cfg = config(vec!["ops@example.org"]);
        cfg.username = Some("mapsched".to_string());
        cfg.password_env = Some("MAPSCHED_TEST_SMTP_PASSWORD".to_string());

        let notifier = EmailNotifier::new(cfg);
        assert_eq!(notifier.password.as_deref(), Some("hunter2"));
        std::env::remove_var("MAPSCHED_TEST_SMTP_PASSWORD");
    }

    #[test]
    #[serial]
    fn test_unset_password_env_var_means_no_credentials() {
        std::env::remove_var("MAPSCHED_TEST_SMTP_PASSWORD");
        let mut cfg = config(vec!["ops@example.org"]);
        cfg.password_env = Some("MAPSCHED_TEST_SMTP_PASSWORD".to_string());

        let notifier = EmailNotifier::new(cfg);
        assert!(notifier.password.is_none());
    }
}
