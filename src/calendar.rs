use crate::models::{CalendarEvent, NewCalendarEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_calendar3::CalendarHub;
use google_calendar3::api::{Event, EventDateTime};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;

#[derive(Debug, Clone)]
pub struct EventQuery {
    pub time_min: DateTime<Utc>,
    pub time_max: DateTime<Utc>,
    pub max_results: i32,
    /// Free-text filter passed through to the provider.
    pub text: Option<String>,
}

#[async_trait]
pub trait CalendarApi: Send + Sync {
    /// Single-occurrence events in the window, ordered by start time.
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<CalendarEvent>>;

    async fn insert_event(&self, event: &NewCalendarEvent) -> Result<CalendarEvent>;
}

pub struct GoogleCalendarClient {
    hub: CalendarHub<HttpsConnector<HttpConnector>>,
    calendar_id: String,
}

impl GoogleCalendarClient {
    pub fn new(hub: CalendarHub<HttpsConnector<HttpConnector>>, calendar_id: String) -> Self {
        Self { hub, calendar_id }
    }
}

#[async_trait]
impl CalendarApi for GoogleCalendarClient {
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<CalendarEvent>> {
        let mut req = self
            .hub
            .events()
            .list(&self.calendar_id)
            .time_min(query.time_min)
            .time_max(query.time_max)
            .single_events(true)
            .order_by("startTime")
            .max_results(query.max_results);

        if let Some(text) = &query.text {
            req = req.q(text);
        }

        let (_, events) = req.doit().await.context("Failed to list calendar events")?;

        Ok(events
            .items
            .unwrap_or_default()
            .into_iter()
            .filter_map(event_from_api)
            .collect())
    }

    async fn insert_event(&self, event: &NewCalendarEvent) -> Result<CalendarEvent> {
        let body = Event {
            summary: Some(event.summary.clone()),
            description: Some(event.description.clone()),
            start: Some(EventDateTime {
                date_time: Some(event.start),
                ..Default::default()
            }),
            end: Some(EventDateTime {
                date_time: Some(event.end),
                ..Default::default()
            }),
            ..Default::default()
        };

        let (_, created) = self
            .hub
            .events()
            .insert(body, &self.calendar_id)
            .doit()
            .await
            .context("Failed to create calendar event")?;

        event_from_api(created).context("Provider returned an event without an id")
    }
}

fn event_from_api(event: Event) -> Option<CalendarEvent> {
    Some(CalendarEvent {
        id: event.id?,
        summary: event.summary.unwrap_or_default(),
        description: event.description,
        location: event.location,
        start: event.start.as_ref().and_then(event_time),
        end: event.end.as_ref().and_then(event_time),
    })
}

/// Timed events carry `date_time`; all-day events only a `date`, taken as midnight UTC.
fn event_time(time: &EventDateTime) -> Option<DateTime<Utc>> {
    if let Some(dt) = &time.date_time {
        return Some(dt.with_timezone(&Utc));
    }
    time.date
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
