mod mail;
mod smtp;

pub use mail::{OutgoingMail, render_mail};
pub use smtp::SmtpMailTransport;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Common(#[from] anyhow::Error),

    #[error("Invalid email address {address:?}")]
    InvalidAddress {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("Could not build email message")]
    Message(#[from] lettre::error::Error),

    #[error("SMTP delivery failed")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Mail worker stopped before finishing")]
    Worker(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError>;
}
