//! Verification dispatcher: composes and routes per-field challenges.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport error: {0}")]
    Transport(String),
}

/// Builds absolute confirm/deny/review URLs for a challenge, decoupling the
/// dispatcher from the HTTP layer's host/scheme.
pub trait UrlBuilder: Send + Sync {
    fn confirm_url(&self, short_id: &str) -> String;
    fn deny_url(&self, short_id: &str) -> String;
    fn review_url(&self, short_id: &str) -> String;
}

pub struct PathUrlBuilder {
    pub base: String,
}

impl UrlBuilder for PathUrlBuilder {
    fn confirm_url(&self, short_id: &str) -> String {
        format!("{}/verify/{}/confirm/", self.base, short_id)
    }
    fn deny_url(&self, short_id: &str) -> String {
        format!("{}/verify/{}/deny/", self.base, short_id)
    }
    fn review_url(&self, short_id: &str) -> String {
        format!("{}/verify/{}/", self.base, short_id)
    }
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body_text: &str, body_html: &str)
        -> Result<(), DispatchError>;
}

#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, to: &str, from: &str, body: &str) -> Result<(), DispatchError>;
}

/// Default transport: logs instead of delivering. The real SMTP/SMS-gateway
/// wire protocols are an external collaborator, out of scope here.
pub struct LoggingEmailTransport;

#[async_trait]
impl EmailTransport for LoggingEmailTransport {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body_text: &str,
        _body_html: &str,
    ) -> Result<(), DispatchError> {
        tracing::info!(to, subject, body = %body_text, "dispatching verification email");
        Ok(())
    }
}

pub struct LoggingSmsTransport;

#[async_trait]
impl SmsTransport for LoggingSmsTransport {
    async fn send(&self, to: &str, from: &str, body: &str) -> Result<(), DispatchError> {
        tracing::info!(to, from, body, "dispatching verification sms");
        Ok(())
    }
}

/// In-memory recording transport for tests.
#[derive(Default)]
pub struct RecordingEmailTransport {
    pub sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl EmailTransport for RecordingEmailTransport {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body_text: &str,
        _body_html: &str,
    ) -> Result<(), DispatchError> {
        self.sent
            .lock()
            .await
            .push((to.to_string(), subject.to_string(), body_text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSmsTransport {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SmsTransport for RecordingSmsTransport {
    async fn send(&self, to: &str, _from: &str, body: &str) -> Result<(), DispatchError> {
        self.sent.lock().await.push((to.to_string(), body.to_string()));
        Ok(())
    }
}

/// The verified side-channel a challenge is routed to. Collapses what the
/// original source modeled as a mixin class hierarchy (one `Verifier`
/// subclass per channel) into a single tagged variant.
pub enum Verifier {
    Email(String),
    Phone(String),
}

/// One challenge waiting to be dispatched to its side-channel.
pub struct Challenge {
    pub short_id: String,
    pub verifier: Verifier,
}

pub struct VerificationDispatcher<'a> {
    pub email: &'a dyn EmailTransport,
    pub sms: &'a dyn SmsTransport,
    pub url_builder: &'a dyn UrlBuilder,
    pub from_email: &'a str,
    pub from_phone: &'a str,
}

impl<'a> VerificationDispatcher<'a> {
    /// Single entry point matching the source's `start_verification`: the
    /// channel is carried by the `Verifier` tag, not re-derived from data.
    pub async fn dispatch(&self, challenge: &Challenge) -> Result<(), DispatchError> {
        match &challenge.verifier {
            Verifier::Email(addr) => self.dispatch_email(&challenge.short_id, addr).await,
            Verifier::Phone(number) => self.dispatch_phone(&challenge.short_id, number).await,
        }
    }

    async fn dispatch_email(&self, short_id: &str, addr: &str) -> Result<(), DispatchError> {
        let confirm = self.url_builder.confirm_url(short_id);
        let deny = self.url_builder.deny_url(short_id);
        let review = self.url_builder.review_url(short_id);

        let body_text = format!(
            "Someone requested a change to your contact directory entry.\n\n\
             Confirm: {confirm}\nDeny: {deny}\nReview: {review}\n\n\
             ---\n\
             Jemand hat eine Aenderung an Ihrem Verzeichniseintrag angefordert.\n\n\
             Bestaetigen: {confirm}\nAblehnen: {deny}\nUebersicht: {review}\n"
        );
        let body_html = format!(
            "<p>Someone requested a change to your contact directory entry.</p>\
             <p><a href=\"{confirm}\">Confirm</a> | <a href=\"{deny}\">Deny</a> | <a href=\"{review}\">Review</a></p>\
             <hr>\
             <p>Jemand hat eine &Auml;nderung an Ihrem Verzeichniseintrag angefordert.</p>\
             <p><a href=\"{confirm}\">Best&auml;tigen</a> | <a href=\"{deny}\">Ablehnen</a> | <a href=\"{review}\">&Uuml;bersicht</a></p>"
        );

        self.email
            .send(addr, "Confirm your directory entry", &body_text, &body_html)
            .await
    }

    async fn dispatch_phone(&self, short_id: &str, number: &str) -> Result<(), DispatchError> {
        let review = self.url_builder.review_url(short_id);
        let body = format!("Confirm or deny a directory change: {review}");
        let body = body.trim().to_string();
        if body.len() > 160 {
            return Err(DispatchError::Transport("sms body exceeds 160 characters".into()));
        }
        self.sms.send(number, self.from_phone, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedUrlBuilder;
    impl UrlBuilder for FixedUrlBuilder {
        fn confirm_url(&self, short_id: &str) -> String {
            format!("https://dir.example/verify/{short_id}/confirm/")
        }
        fn deny_url(&self, short_id: &str) -> String {
            format!("https://dir.example/verify/{short_id}/deny/")
        }
        fn review_url(&self, short_id: &str) -> String {
            format!("https://dir.example/verify/{short_id}/")
        }
    }

    #[tokio::test]
    async fn email_dispatch_records_urls() {
        let email = RecordingEmailTransport::default();
        let sms = RecordingSmsTransport::default();
        let builder = FixedUrlBuilder;
        let dispatcher = VerificationDispatcher {
            email: &email,
            sms: &sms,
            url_builder: &builder,
            from_email: "no-reply@example.com",
            from_phone: "+15005550006",
        };

        let challenge = Challenge {
            short_id: "CDEHKMPRST".to_string(),
            verifier: Verifier::Email("x@example.com".to_string()),
        };
        dispatcher.dispatch(&challenge).await.unwrap();

        let sent = email.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].2.contains("confirm/"));
    }

    #[tokio::test]
    async fn phone_dispatch_body_has_no_surrounding_whitespace_and_fits_sms() {
        let email = RecordingEmailTransport::default();
        let sms = RecordingSmsTransport::default();
        let builder = FixedUrlBuilder;
        let dispatcher = VerificationDispatcher {
            email: &email,
            sms: &sms,
            url_builder: &builder,
            from_email: "no-reply@example.com",
            from_phone: "+15005550006",
        };

        let challenge = Challenge {
            short_id: "CDEHKMPRST".to_string(),
            verifier: Verifier::Phone("+491234567".to_string()),
        };
        dispatcher.dispatch(&challenge).await.unwrap();

        let sent = sms.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.len() <= 160);
        assert_eq!(sent[0].1, sent[0].1.trim());
    }
}
