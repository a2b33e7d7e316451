use std::sync::OnceLock;

use async_trait::async_trait;
use lettre::{
    Message, SmtpTransport, Transport,
    message::{Mailbox, header::ContentType},
    transport::smtp::{PoolConfig, authentication::Credentials},
};
use tokio::task;

use crate::appsettings::SmtpSettings;

use super::{MailTransport, OutgoingMail, TransportError};

/// Sends mail through an SMTPS relay. The transport is built on the first send
/// and shared afterwards; every send opens its own connection and closes it.
pub struct SmtpMailTransport {
    settings: SmtpSettings,
    transport: OnceLock<SmtpTransport>,
}

impl SmtpMailTransport {
    pub fn new(settings: SmtpSettings) -> Self {
        Self {
            settings,
            transport: OnceLock::new(),
        }
    }

    fn transport(&self) -> Result<SmtpTransport, TransportError> {
        if let Some(transport) = self.transport.get() {
            return Ok(transport.clone());
        }

        log::info!(
            "Connecting mail transport to {}:{}",
            self.settings.host,
            self.settings.port
        );
        let credentials = Credentials::new(
            self.settings.login.clone(),
            self.settings.password.clone(),
        );
        let transport = SmtpTransport::relay(&self.settings.host)?
            .port(self.settings.port)
            .credentials(credentials)
            .pool_config(PoolConfig::new().max_size(0))
            .build();

        Ok(self.transport.get_or_init(|| transport).clone())
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        let message = build_message(&self.settings.login, mail)?;
        let transport = self.transport()?;

        let response = task::spawn_blocking(move || transport.send(&message)).await??;
        log::debug!(
            "SMTP relay accepted message [code = {}, recipient = {}]",
            response.code(),
            mail.recipient
        );

        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address
        .parse()
        .map_err(|source| TransportError::InvalidAddress {
            address: address.to_owned(),
            source,
        })
}

fn build_message(sender: &str, mail: &OutgoingMail) -> Result<Message, TransportError> {
    let message = Message::builder()
        .from(parse_mailbox(sender)?)
        .to(parse_mailbox(&mail.recipient)?)
        .subject(mail.subject.as_str())
        .header(ContentType::TEXT_HTML)
        .body(mail.html_body.clone())?;

    Ok(message)
}
