// Event names and payloads delivered to observers and the headless handler

use crate::location::{LocationSample, StationaryRegion};
use crate::motion::ActivityObservation;
use crate::platform::AuthorizationStatus;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    Location,
    Stationary,
    StartMoving,
    Activity,
    Start,
    Stop,
    Error,
    Authorization,
    Foreground,
    Background,
    AbortRequested,
    HttpAuthorization,
}

impl EventName {
    pub const ALL: [EventName; 12] = [
        EventName::Location,
        EventName::Stationary,
        EventName::StartMoving,
        EventName::Activity,
        EventName::Start,
        EventName::Stop,
        EventName::Error,
        EventName::Authorization,
        EventName::Foreground,
        EventName::Background,
        EventName::AbortRequested,
        EventName::HttpAuthorization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Location => "location",
            EventName::Stationary => "stationary",
            EventName::StartMoving => "start_moving",
            EventName::Activity => "activity",
            EventName::Start => "start",
            EventName::Stop => "stop",
            EventName::Error => "error",
            EventName::Authorization => "authorization",
            EventName::Foreground => "foreground",
            EventName::Background => "background",
            EventName::AbortRequested => "abort_requested",
            EventName::HttpAuthorization => "http_authorization",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EventName::ALL
            .iter()
            .find(|name| name.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("Unknown event name: {}", s))
    }
}

/// Error payload handed to hosts: stable numeric code plus message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub message: String,
}

/// An event together with its payload
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A new sample was persisted
    Location(LocationSample),
    /// Device confirmed stationary in this region
    Stationary(StationaryRegion),
    /// Device left its stationary region
    StartMoving,
    Activity(ActivityObservation),
    Start,
    Stop,
    Error(ErrorPayload),
    Authorization(AuthorizationStatus),
    Foreground,
    Background,
    AbortRequested,
    /// The collector answered 401
    HttpAuthorization { status: u16 },
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::Location(_) => EventName::Location,
            Event::Stationary(_) => EventName::Stationary,
            Event::StartMoving => EventName::StartMoving,
            Event::Activity(_) => EventName::Activity,
            Event::Start => EventName::Start,
            Event::Stop => EventName::Stop,
            Event::Error(_) => EventName::Error,
            Event::Authorization(_) => EventName::Authorization,
            Event::Foreground => EventName::Foreground,
            Event::Background => EventName::Background,
            Event::AbortRequested => EventName::AbortRequested,
            Event::HttpAuthorization { .. } => EventName::HttpAuthorization,
        }
    }

    /// Plain data payload, as handed to the headless handler
    pub fn params(&self) -> Value {
        match self {
            Event::Location(sample) => Value::Object(sample.to_json()),
            Event::Stationary(region) => {
                let mut map = region.anchor.to_json();
                map.insert("radius".into(), json!(region.radius));
                Value::Object(map)
            }
            Event::Activity(observation) => json!(observation),
            Event::Error(payload) => json!(payload),
            Event::Authorization(status) => json!(status.as_id()),
            Event::HttpAuthorization { status } => json!({ "status": status }),
            Event::StartMoving
            | Event::Start
            | Event::Stop
            | Event::Foreground
            | Event::Background
            | Event::AbortRequested => Value::Null,
        }
    }
}
