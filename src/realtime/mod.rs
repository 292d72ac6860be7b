use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::model::NoteRow;
use crate::store::{Reconcile, SyncStore};

/// Change event as delivered by the backend's push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChange {
    pub event_type: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl WireChange {
    pub fn insert(row: &NoteRow) -> Self {
        Self {
            event_type: "INSERT".into(),
            new: serde_json::to_value(row).ok(),
            old: None,
        }
    }

    pub fn update(row: &NoteRow) -> Self {
        Self {
            event_type: "UPDATE".into(),
            new: serde_json::to_value(row).ok(),
            old: None,
        }
    }

    pub fn delete(id: &str) -> Self {
        Self {
            event_type: "DELETE".into(),
            new: None,
            old: Some(serde_json::json!({ "id": id })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Inserted(NoteRow),
    Updated(NoteRow),
    Deleted { id: String },
}

impl ChangeEvent {
    pub fn note_id(&self) -> &str {
        match self {
            ChangeEvent::Inserted(row) | ChangeEvent::Updated(row) => &row.id,
            ChangeEvent::Deleted { id } => id,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown change event type {0:?}")]
    UnknownEvent(String),
    #[error("{0} event carries no row")]
    MissingRow(&'static str),
    #[error("delete event carries no id")]
    MissingId,
    #[error("malformed row: {0}")]
    InvalidRow(#[from] serde_json::Error),
}

pub fn decode(wire: &WireChange) -> Result<ChangeEvent, DecodeError> {
    match wire.event_type.to_ascii_uppercase().as_str() {
        "INSERT" => Ok(ChangeEvent::Inserted(decode_row(wire.new.as_ref(), "insert")?)),
        "UPDATE" => Ok(ChangeEvent::Updated(decode_row(wire.new.as_ref(), "update")?)),
        "DELETE" => {
            let id = wire
                .old
                .as_ref()
                .and_then(|old| old.get("id"))
                .and_then(id_from_value)
                .ok_or(DecodeError::MissingId)?;
            Ok(ChangeEvent::Deleted { id })
        }
        other => Err(DecodeError::UnknownEvent(other.to_string())),
    }
}

fn decode_row(value: Option<&Value>, kind: &'static str) -> Result<NoteRow, DecodeError> {
    let value = value.ok_or(DecodeError::MissingRow(kind))?;
    Ok(NoteRow::deserialize(value)?)
}

// Backends disagree on whether ids are numbers or strings.
fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Live realtime listener. Dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Feeds every decodable event from `receiver` into the store's
/// reconciliation entry point until the channel closes.
pub fn listen(store: SyncStore, mut receiver: broadcast::Receiver<WireChange>) -> Subscription {
    let handle = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(wire) => match decode(&wire) {
                    Ok(event) => {
                        tracing::debug!(note_id = event.note_id(), "realtime change");
                        store.reconcile(Reconcile::Remote(event));
                    }
                    Err(err) => tracing::warn!(%err, "dropping undecodable realtime change"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "realtime listener lagged behind the change feed");
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("realtime change feed closed");
                    break;
                }
            }
        }
    });
    Subscription { handle }
}
