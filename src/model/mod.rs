use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use time::OffsetDateTime;
use uuid::Uuid;

const LOCAL_ID_PREFIX: &str = "note_";
const LOCAL_SUFFIX_LEN: usize = 9;
const SLUG_LEN: usize = 8;

/// Closed palette a note can be tinted with.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NoteColor {
    #[default]
    Default,
    Rose,
    Red,
    Pink,
    Fuchsia,
    Violet,
    Purple,
    Indigo,
    Navy,
    Blue,
    Sky,
    Cyan,
    Teal,
    Mint,
    Emerald,
    Green,
    Lime,
    Yellow,
    Amber,
    Gold,
    Orange,
    Maroon,
    Coffee,
    Slate,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SortMode {
    #[default]
    Updated,
    Created,
    Title,
}

/// In-memory note as held by the sync store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub color: NoteColor,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub public_slug: Option<String>,
}

impl Note {
    /// Fresh, empty, local-only note.
    pub fn empty() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: generate_local_id(),
            owner: None,
            title: String::new(),
            content: String::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            is_pinned: false,
            is_archived: false,
            color: NoteColor::Default,
            is_public: false,
            public_slug: None,
        }
    }

    pub fn is_local_only(&self) -> bool {
        self.owner.is_none()
    }

    /// Refreshes `updated_at`, never letting it fall behind `created_at` or
    /// the previous stamp.
    pub fn touch(&mut self) {
        let now = OffsetDateTime::now_utc();
        self.updated_at = now.max(self.updated_at).max(self.created_at);
    }

    pub fn apply_patch(&mut self, patch: &NotePatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        if let Some(tags) = &patch.tags {
            self.tags = dedup_tags(tags.iter().cloned());
        }
        if let Some(pinned) = patch.is_pinned {
            self.is_pinned = pinned;
        }
        if let Some(archived) = patch.is_archived {
            self.is_archived = archived;
        }
        if let Some(color) = patch.color {
            self.color = color;
        }
        if let Some(slug) = patch.public_slug.as_deref() {
            if !slug.trim().is_empty() {
                self.public_slug = Some(slug.to_owned());
            }
        }
        if let Some(public) = patch.is_public {
            // A public note always carries a slug to be reached by.
            if public && self.public_slug.is_none() {
                self.public_slug = Some(generate_public_slug());
            }
            self.is_public = public;
        }
    }

    /// Overwrites every remotely owned field with the row's values. Identity,
    /// ownership and creation time stay as they are.
    pub fn merge_remote(&mut self, row: &NoteRow) {
        self.title = row.title.clone();
        self.content = row.content.clone();
        self.tags = dedup_tags(row.tags.iter().cloned());
        self.updated_at = row.updated_at.max(self.created_at);
        self.is_pinned = row.is_pinned;
        self.is_archived = row.is_archived;
        self.color = row.color;
        if row.public_slug.is_some() {
            self.public_slug = row.public_slug.clone();
        }
        self.is_public = row.is_public && self.public_slug.is_some();
    }
}

impl From<NoteRow> for Note {
    fn from(row: NoteRow) -> Self {
        let updated_at = row.updated_at.max(row.created_at);
        let is_public = row.is_public && row.public_slug.is_some();
        Self {
            id: row.id,
            owner: row.owner_ref,
            title: row.title,
            content: row.content,
            tags: dedup_tags(row.tags),
            created_at: row.created_at,
            updated_at,
            is_pinned: row.is_pinned,
            is_archived: row.is_archived,
            color: row.color,
            is_public,
            public_slug: row.public_slug,
        }
    }
}

/// Row shape exchanged with the remote backend and carried by realtime events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRow {
    pub id: String,
    #[serde(default, alias = "user_id")]
    pub owner_ref: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "nullable_tags")]
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub color: NoteColor,
    #[serde(default)]
    pub public_slug: Option<String>,
    #[serde(default)]
    pub is_public: bool,
}

fn nullable_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Partial row used for creates and updates. Absent fields are left untouched
/// by the backend.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub is_pinned: Option<bool>,
    pub is_archived: Option<bool>,
    pub color: Option<NoteColor>,
    pub public_slug: Option<String>,
    pub is_public: Option<bool>,
}

impl NotePatch {
    /// Snapshot of every syncable field of `note`.
    pub fn from_note(note: &Note) -> Self {
        Self {
            title: Some(note.title.clone()),
            content: Some(note.content.clone()),
            tags: Some(note.tags.clone()),
            is_pinned: Some(note.is_pinned),
            is_archived: Some(note.is_archived),
            color: Some(note.color),
            public_slug: note.public_slug.clone(),
            is_public: Some(note.is_public),
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// `note_<unix millis>_<random suffix>`; unique enough to never collide with
/// another local note or a backend id.
pub fn generate_local_id() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{LOCAL_ID_PREFIX}{millis}_{}", &suffix[..LOCAL_SUFFIX_LEN])
}

pub fn generate_public_slug() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    raw[..SLUG_LEN].to_string()
}

/// Normalises user tag input: trimmed and lowercased, `None` when blank.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let tag = raw.trim().to_lowercase();
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

fn dedup_tags<I>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use time::macros::datetime;

    #[test]
    fn local_ids_are_prefixed_and_unique() {
        let a = generate_local_id();
        let b = generate_local_id();
        assert!(a.starts_with("note_"));
        assert_ne!(a, b);
        let suffix = a.rsplit('_').next().expect("suffix");
        assert_eq!(suffix.len(), 9);
    }

    #[test]
    fn slug_is_short_and_alphanumeric() {
        let slug = generate_public_slug();
        assert_eq!(slug.len(), 8);
        assert!(slug.chars().all(|ch| ch.is_ascii_alphanumeric()));
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut note = Note::empty();
        note.created_at = datetime!(2999-01-01 0:00 UTC);
        note.updated_at = note.created_at;
        note.touch();
        assert!(note.updated_at >= note.created_at);
    }

    #[test]
    fn row_decodes_legacy_user_id_and_null_tags() {
        let raw = r#"{
            "id": "42",
            "user_id": "acct-1",
            "title": "Plan",
            "content": "<p>x</p>",
            "tags": null,
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-02T10:00:00Z",
            "is_pinned": true,
            "is_archived": false,
            "color": "sky",
            "public_slug": null,
            "is_public": false
        }"#;
        let row: NoteRow = serde_json::from_str(raw).expect("row decodes");
        assert_eq!(row.owner_ref.as_deref(), Some("acct-1"));
        assert!(row.tags.is_empty());
        assert_eq!(row.color, NoteColor::Sky);
    }

    #[test]
    fn row_without_slug_is_never_public() {
        let row = NoteRow {
            id: "1".into(),
            owner_ref: Some("acct".into()),
            title: String::new(),
            content: String::new(),
            tags: vec!["a".into(), "a".into()],
            created_at: datetime!(2024-01-02 0:00 UTC),
            updated_at: datetime!(2024-01-01 0:00 UTC),
            is_pinned: false,
            is_archived: false,
            color: NoteColor::Default,
            public_slug: None,
            is_public: true,
        };
        let note = Note::from(row);
        assert!(!note.is_public);
        assert_eq!(note.tags, vec!["a".to_string()]);
        assert!(note.updated_at >= note.created_at);
    }

    #[test]
    fn publishing_through_a_patch_always_leaves_a_slug() {
        let mut note = Note::empty();
        note.apply_patch(&NotePatch {
            public_slug: Some("  ".into()),
            is_public: Some(true),
            ..NotePatch::default()
        });
        assert!(note.is_public);
        let slug = note.public_slug.clone().expect("slug assigned");
        assert_eq!(slug.len(), 8);

        note.apply_patch(&NotePatch {
            public_slug: Some(String::new()),
            is_public: Some(false),
            ..NotePatch::default()
        });
        assert!(!note.is_public);
        assert_eq!(note.public_slug.as_deref(), Some(slug.as_str()));

        note.apply_patch(&NotePatch {
            is_public: Some(true),
            ..NotePatch::default()
        });
        assert_eq!(note.public_slug.as_deref(), Some(slug.as_str()));
    }

    #[test]
    fn patch_skips_absent_fields_when_serialised() {
        let patch = NotePatch::title("Draft");
        let json = serde_json::to_value(&patch).expect("serialise");
        assert_eq!(json, serde_json::json!({ "title": "Draft" }));
    }

    #[test]
    fn colors_parse_from_lowercase_names() {
        assert_eq!(NoteColor::from_str("coffee").unwrap(), NoteColor::Coffee);
        assert_eq!(NoteColor::default().to_string(), "default");
        assert_eq!(SortMode::from_str("title").unwrap(), SortMode::Title);
    }

    #[test]
    fn palette_names_round_trip() {
        use strum::IntoEnumIterator;
        assert_eq!(NoteColor::iter().count(), 24);
        for color in NoteColor::iter() {
            assert_eq!(NoteColor::from_str(color.as_ref()).unwrap(), color);
        }
    }

    #[test]
    fn normalize_tag_trims_and_lowercases() {
        assert_eq!(normalize_tag("  Work "), Some("work".to_string()));
        assert_eq!(normalize_tag("   "), None);
    }
}
