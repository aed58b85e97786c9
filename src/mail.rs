use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct Outgoing {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: Outgoing) -> AppResult<()>;
}

/// `{{name}}` placeholder substitution; enough for transactional mail.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

pub mod templates {
    use super::{render, Outgoing};
    use crate::config;

    const OTP: &str = "<p>Your verification code is <strong>{{code}}</strong>. \
        It expires in {{minutes}} minutes.</p>";
    const PASSWORD_RESET: &str =
        "<p>Reset your password: <a href=\"{{link}}\">{{link}}</a></p>";
    const EMAIL_VERIFY: &str =
        "<p>Confirm your email address: <a href=\"{{link}}\">{{link}}</a></p>";
    const INVITATION: &str = "<p>You have been invited to join {{workspace}}. \
        Accept here: <a href=\"{{link}}\">{{link}}</a></p>";

    pub fn otp(to: &str, code: &str) -> Outgoing {
        let minutes = config::OTP_TTL_MINUTES.to_string();
        Outgoing {
            to: to.to_string(),
            subject: "Your verification code".into(),
            html: render(OTP, &[("code", code), ("minutes", minutes.as_str())]),
        }
    }

    pub fn password_reset(to: &str, token: &str) -> Outgoing {
        let link = format!("{}/reset-password?token={token}", *config::APP_BASE_URL);
        Outgoing {
            to: to.to_string(),
            subject: "Reset your password".into(),
            html: render(PASSWORD_RESET, &[("link", link.as_str())]),
        }
    }

    pub fn email_verify(to: &str, token: &str) -> Outgoing {
        let link = format!("{}/verify-email?token={token}", *config::APP_BASE_URL);
        Outgoing {
            to: to.to_string(),
            subject: "Verify your email".into(),
            html: render(EMAIL_VERIFY, &[("link", link.as_str())]),
        }
    }

    pub fn invitation(to: &str, workspace: &str, token: &str) -> Outgoing {
        let link = format!("{}/invitations?token={token}", *config::APP_BASE_URL);
        Outgoing {
            to: to.to_string(),
            subject: format!("Invitation to {workspace}"),
            html: render(
                INVITATION,
                &[("workspace", workspace), ("link", link.as_str())],
            ),
        }
    }
}

/// Sends through the configured HTTP mail provider.
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(endpoint: String, api_key: String, from: String) -> Arc<Self> {
        Arc::new(HttpMailer {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("client build"),
            endpoint,
            api_key,
            from,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, mail: Outgoing) -> AppResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [mail.to],
                "subject": mail.subject,
                "html": mail.html,
            }))
            .send()
            .await
            .map_err(upstream)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let cause = response.text().await.unwrap_or_default();
            tracing::error!(status, "mail provider rejected message");
            return Err(AppError::Upstream {
                provider: "mail",
                status: Some(status),
                cause: truncate(&cause, 200),
            });
        }
        Ok(())
    }
}

/// Fallback for environments without a mail provider: logs the envelope,
/// never the body.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: Outgoing) -> AppResult<()> {
        tracing::info!(to = %mail.to, subject = %mail.subject, "mail provider not configured; dropping message");
        Ok(())
    }
}

pub fn from_config() -> Arc<dyn Mailer> {
    if config::MAIL_API_ENDPOINT.is_empty() || config::MAIL_API_KEY.is_empty() {
        tracing::warn!("MAIL_API_ENDPOINT/MAIL_API_KEY unset; outgoing mail will be logged only");
        Arc::new(LogMailer)
    } else {
        HttpMailer::new(
            config::MAIL_API_ENDPOINT.clone(),
            config::MAIL_API_KEY.clone(),
            config::MAIL_FROM_ADDRESS.clone(),
        )
    }
}

fn upstream(e: reqwest::Error) -> AppError {
    tracing::error!(?e, "mail provider call failed");
    AppError::Upstream {
        provider: "mail",
        status: e.status().map(|s| s.as_u16()),
        cause: e.to_string(),
    }
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        value.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_every_placeholder() {
        let html = render(
            "<p>{{a}} and {{b}} and {{a}}</p>",
            &[("a", "x"), ("b", "y")],
        );
        assert_eq!(html, "<p>x and y and x</p>");
    }

    #[test]
    fn otp_template_includes_code() {
        let mail = templates::otp("a@b.co", "123456");
        assert!(mail.html.contains("123456"));
        assert_eq!(mail.to, "a@b.co");
    }
}
