use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::SmtpConfig;

/// Outbound messages the identity core needs.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_verification(&self, to: &str, name: &str, code: &str) -> anyhow::Result<()>;
    async fn send_welcome(&self, to: &str, name: &str) -> anyhow::Result<()>;
}

pub fn verification_link(base_url: &str, code: &str) -> String {
    format!("{}/auth/verify?code={}", base_url.trim_end_matches('/'), code)
}

fn verification_body(name: &str, link: &str) -> String {
    format!("Hello {name},\n\nPlease verify your email by clicking this link: {link}")
}

fn welcome_body(name: &str) -> String {
    format!("Hello {name},\n\nWelcome to our platform. We're excited to have you!")
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    base_url: String,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig, base_url: &str) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .context("build smtp transport")?
            .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }
        let from = config
            .from_email
            .parse::<Mailbox>()
            .context("parse FROM_EMAIL")?;
        Ok(Self {
            transport: builder.build(),
            from,
            base_url: base_url.to_string(),
        })
    }

    async fn send(&self, to: &str, name: &str, subject: &str, body: String) -> anyhow::Result<()> {
        let address = to.parse::<Address>().context("parse recipient")?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(Some(name.to_string()), address))
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .context("build message")?;
        self.transport.send(message).await.context("smtp send")?;
        debug!(subject, "email sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send_verification(&self, to: &str, name: &str, code: &str) -> anyhow::Result<()> {
        let link = verification_link(&self.base_url, code);
        self.send(to, name, "Verify your email address", verification_body(name, &link))
            .await
    }

    async fn send_welcome(&self, to: &str, name: &str) -> anyhow::Result<()> {
        self.send(to, name, "Welcome to our platform!", welcome_body(name))
            .await
    }
}

#[derive(Debug)]
pub struct WelcomeJob {
    pub to: String,
    pub name: String,
}

/// Fire-and-forget welcome mail. Jobs go through a bounded channel to a single
/// worker; failures end up in the log only.
#[derive(Clone)]
pub struct WelcomeQueue {
    tx: mpsc::Sender<WelcomeJob>,
}

impl WelcomeQueue {
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<WelcomeJob>(capacity);
        let handle = tokio::spawn(async move {
            info!("welcome mail worker started");
            while let Some(job) = rx.recv().await {
                if let Err(e) = notifier.send_welcome(&job.to, &job.name).await {
                    error!(error = ?e, "welcome email failed");
                }
            }
            info!("welcome mail worker stopped (channel closed)");
        });
        (Self { tx }, handle)
    }

    /// Never blocks; a full or closed queue drops the job.
    pub fn enqueue(&self, to: &str, name: &str) {
        let job = WelcomeJob {
            to: to.to_string(),
            name: name.to_string(),
        };
        if let Err(e) = self.tx.try_send(job) {
            warn!(error = %e, "welcome email dropped");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Verification { to: String, code: String },
        Welcome { to: String },
    }

    /// Records every send; optionally fails them all.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Sent>>,
        pub fail: bool,
    }

    impl RecordingNotifier {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_verification(&self, to: &str, _name: &str, code: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("smtp unavailable");
            }
            self.sent.lock().unwrap().push(Sent::Verification {
                to: to.into(),
                code: code.into(),
            });
            Ok(())
        }

        async fn send_welcome(&self, to: &str, _name: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("smtp unavailable");
            }
            self.sent.lock().unwrap().push(Sent::Welcome { to: to.into() });
            Ok(())
        }
    }
}
