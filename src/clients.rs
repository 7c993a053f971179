use crate::calendar::{CalendarApi, GoogleCalendarClient};
use crate::gmail::{GmailClient, MailApi};
use anyhow::{Context, Result};
use google_calendar3::CalendarHub;
use google_gmail1::Gmail;
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;

pub type HttpsClient = hyper::Client<HttpsConnector<HttpConnector>>;

/// Builds provider clients from a decrypted access token, once per use.
pub trait ClientFactory: Send + Sync {
    fn calendar(&self, access_token: &str) -> Result<Box<dyn CalendarApi>>;

    fn mail(&self, access_token: &str) -> Result<Box<dyn MailApi>>;
}

pub fn https_client() -> Result<HttpsClient> {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .context("Failed to load native TLS roots")?
        .https_only()
        .enable_http1()
        .build();
    Ok(hyper::Client::builder().build(connector))
}

pub struct GoogleClients {
    http: HttpsClient,
    calendar_id: String,
}

impl GoogleClients {
    pub fn new(calendar_id: String) -> Result<Self> {
        Ok(Self {
            http: https_client()?,
            calendar_id,
        })
    }
}

impl ClientFactory for GoogleClients {
    fn calendar(&self, access_token: &str) -> Result<Box<dyn CalendarApi>> {
        if access_token.is_empty() {
            anyhow::bail!("Cannot build calendar client without an access token");
        }
        let hub = CalendarHub::new(self.http.clone(), access_token.to_string());
        Ok(Box::new(GoogleCalendarClient::new(hub, self.calendar_id.clone())))
    }

    fn mail(&self, access_token: &str) -> Result<Box<dyn MailApi>> {
        if access_token.is_empty() {
            anyhow::bail!("Cannot build mail client without an access token");
        }
        let hub = Gmail::new(self.http.clone(), access_token.to_string());
        Ok(Box::new(GmailClient::new(hub)))
    }
}
