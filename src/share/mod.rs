use time::OffsetDateTime;

use crate::gateway::{GatewayError, RemoteNotes};
use crate::model::NoteColor;

/// Read-only projection of a published note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedNote {
    pub title: String,
    pub html: String,
    pub tags: Vec<String>,
    pub color: NoteColor,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareView {
    Available(SharedNote),
    /// Missing and private notes look the same from the outside.
    Unavailable,
}

/// Resolves a public link. Content passes through `sanitize` before it is
/// handed out; not-found becomes [`ShareView::Unavailable`] and any other
/// failure is returned to the caller.
pub async fn load_shared<S>(
    gateway: &RemoteNotes,
    slug: &str,
    sanitize: S,
) -> Result<ShareView, GatewayError>
where
    S: FnOnce(&str) -> String,
{
    let slug = slug.trim();
    if slug.is_empty() {
        return Ok(ShareView::Unavailable);
    }
    match gateway.fetch_public(slug).await {
        Ok(row) => Ok(ShareView::Available(SharedNote {
            html: sanitize(&row.content),
            title: row.title,
            tags: row.tags,
            color: row.color,
            updated_at: row.updated_at,
        })),
        Err(GatewayError::NotFound) => {
            tracing::debug!(slug, "shared note unavailable");
            Ok(ShareView::Unavailable)
        }
        Err(err) => Err(err),
    }
}
