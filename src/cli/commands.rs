use std::fmt::Write as _;

use anyhow::{bail, Context, Result};
use clap::Args;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::gateway::RemoteNotes;
use crate::model::{normalize_tag, Note, NotePatch, SortMode};
use crate::share::{load_shared, ShareView};
use crate::store::SyncStore;

const SNIPPET_CHARS: usize = 72;

#[derive(Args, Debug, Clone, Default)]
pub struct ListArgs {
    /// Show the archive instead of active notes
    #[arg(long)]
    pub archived: bool,
    /// Case-insensitive text matched against title, content and tags
    #[arg(long)]
    pub search: Option<String>,
    /// Only notes carrying this exact tag
    #[arg(long)]
    pub tag: Option<String>,
    /// Sort order (updated, created, title); remembered for later runs
    #[arg(long)]
    pub sort: Option<SortMode>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct NewArgs {
    /// Title for the note
    #[arg()]
    pub title: Option<String>,
    /// Note body (markup allowed)
    #[arg(long)]
    pub content: Option<String>,
    /// Tag to attach; repeat for several
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ShareArgs {
    /// Public slug from a share link
    pub slug: String,
}

pub async fn list_notes(store: &SyncStore, args: ListArgs) -> Result<String> {
    if let Some(sort) = args.sort {
        store.set_sort_mode(sort);
    }
    store.set_show_archived(args.archived);
    store.set_tag_filter(args.tag.and_then(|tag| normalize_tag(&tag)));
    store.set_search_text(args.search.unwrap_or_default());
    store.settle().await;
    if let Err(err) = store.fetch_notes(true).await {
        tracing::warn!(%err, "showing local notes only");
    }
    Ok(format_note_list(&store.filtered_notes()))
}

pub async fn new_note(store: &SyncStore, args: NewArgs) -> Result<String> {
    let id = store.create_note();
    let patch = NotePatch {
        title: args.title.map(|title| title.trim().to_owned()),
        content: args.content,
        ..NotePatch::default()
    };
    if !patch.is_empty() {
        store.update_note(&id, patch).context("filling in new note")?;
    }
    for tag in &args.tags {
        store
            .add_tag(&id, tag)
            .with_context(|| format!("tagging new note with '{tag}'"))?;
    }
    store.settle().await;

    // Creation may have re-keyed the note to its backend id.
    let note = store
        .active_note()
        .context("new note vanished before it could be shown")?;
    let mut out = format!("Created note {}", note.id);
    if note.is_local_only() {
        out.push_str(" (local only)");
    }
    out.push('\n');
    Ok(out)
}

pub fn list_tags(store: &SyncStore) -> String {
    let tags = store.all_tags();
    if tags.is_empty() {
        return "(no tags)\n".to_string();
    }
    tags.iter().fold(String::new(), |mut out, tag| {
        let _ = writeln!(&mut out, "- {tag}");
        out
    })
}

pub fn list_pending(store: &SyncStore) -> String {
    let pending = store.pending_ids();
    if pending.is_empty() {
        return "Everything is synced.\n".to_string();
    }
    let mut out = format!("{} note(s) waiting to sync\n", pending.len());
    for id in pending {
        let title = store
            .note(&id)
            .map(|note| display_title(&note.title).to_string())
            .unwrap_or_else(|| "<missing>".into());
        let _ = writeln!(&mut out, "  {id}  {title}");
    }
    out
}

/// Pushes pre-sign-in notes once, sweeps pending edits, then reloads.
pub async fn sync(store: &SyncStore, gateway: &RemoteNotes) -> Result<String> {
    let Some(account) = gateway.current_account() else {
        bail!("no account configured; pass --account or set account.id in the config");
    };
    let pushed = store
        .sync_local_to_cloud()
        .await
        .context("pushing local notes")?;
    let summary = store.sync_pending().await;
    store.settle().await;
    store.fetch_notes(true).await.context("reloading notes")?;

    let mut out = format!("Synced as {account}\n");
    if pushed {
        out.push_str("  uploaded notes created before sign-in\n");
    }
    let _ = writeln!(
        &mut out,
        "  {} written, {} failed, {} still pending",
        summary.synced,
        summary.failed,
        store.pending_ids().len()
    );
    Ok(out)
}

pub async fn show_shared(gateway: &RemoteNotes, args: ShareArgs) -> Result<String> {
    // Shared content is only printed, never re-served as HTML.
    let view = load_shared(gateway, &args.slug, render_terminal_text)
        .await
        .with_context(|| format!("loading shared note {}", args.slug))?;
    let note = match view {
        ShareView::Available(note) => note,
        ShareView::Unavailable => {
            return Ok("This note is unavailable. It may be private or deleted.\n".to_string())
        }
    };
    let mut out = String::new();
    let _ = writeln!(&mut out, "{}", display_title(&note.title));
    let _ = writeln!(&mut out, "updated {}", format_timestamp(note.updated_at));
    if !note.tags.is_empty() {
        let _ = writeln!(&mut out, "tags    {}", note.tags.join(", "));
    }
    out.push('\n');
    out.push_str(note.html.trim());
    out.push('\n');
    Ok(out)
}

fn format_note_list(notes: &[Note]) -> String {
    if notes.is_empty() {
        return "No notes.\n".to_string();
    }
    let mut out = String::new();
    for note in notes {
        let mut headline = format!("{}  {}", note.id, display_title(&note.title));
        if note.is_pinned {
            headline.push_str("  [PINNED]");
        }
        if note.is_archived {
            headline.push_str("  [ARCHIVED]");
        }
        if note.is_public {
            headline.push_str("  [PUBLIC]");
        }
        let _ = writeln!(&mut out, "{headline}");
        let _ = writeln!(
            &mut out,
            "    updated {}",
            format_timestamp(note.updated_at)
        );
        if !note.tags.is_empty() {
            let _ = writeln!(&mut out, "    tags    {}", note.tags.join(", "));
        }
        if let Some(snippet) = snippet(&note.content) {
            let _ = writeln!(&mut out, "    {snippet}");
        }
    }
    out
}

fn display_title(title: &str) -> &str {
    let title = title.trim();
    if title.is_empty() {
        "<untitled>"
    } else {
        title
    }
}

fn snippet(content: &str) -> Option<String> {
    let text = render_terminal_text(content);
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    if line.chars().count() <= SNIPPET_CHARS {
        return Some(line.to_string());
    }
    let cut: String = line.chars().take(SNIPPET_CHARS).collect();
    Some(format!("{}...", cut.trim_end()))
}

fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

/// Renders stored markup as terminal text: tags dropped, block ends become
/// newlines, script/style bodies removed and common entities decoded. Nothing
/// markup-shaped survives, so it also serves as the share view's sanitizer
/// when the output only ever reaches a terminal.
fn render_terminal_text(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut rest = markup;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let Some(len) = rest[start..].find('>') else {
            rest = &rest[start..];
            break;
        };
        let tag = rest[start + 1..start + len].trim().to_ascii_lowercase();
        rest = &rest[start + len + 1..];
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        if !tag.starts_with('/') && (name == "script" || name == "style") {
            let closing = format!("</{name}");
            rest = match rest.to_ascii_lowercase().find(&closing) {
                Some(end) => rest[end..].find('>').map_or("", |gt| &rest[end + gt + 1..]),
                None => "",
            };
            continue;
        }
        let breaks_line = matches!(name.as_str(), "br" | "li")
            || (tag.starts_with('/') && matches!(name.as_str(), "p" | "div" | "h1" | "h2" | "h3"));
        if breaks_line && !out.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str(rest);
    decode_entities(&out)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gateway::SessionAccount;
    use crate::retry::RetryPolicy;
    use crate::storage::{LocalState, SqliteBackend};
    use crate::store::StoreOptions;
    use tempfile::TempDir;

    type TestResult<T = ()> = anyhow::Result<T>;

    fn setup(account: Option<&str>) -> TestResult<(TempDir, SyncStore, RemoteNotes)> {
        let temp = TempDir::new().context("creating temp dir")?;
        let backend = SqliteBackend::open(&temp.path().join("data/backend.db"))?;
        let local = LocalState::open(&temp.path().join("data/local-state.db"))?;
        let session = match account {
            Some(id) => SessionAccount::signed_in(id),
            None => SessionAccount::default(),
        };
        let gateway = RemoteNotes::new(
            Arc::new(backend),
            Arc::new(session),
            RetryPolicy::immediate(2),
        );
        let store = SyncStore::with_local_state(gateway.clone(), StoreOptions::default(), local);
        Ok((temp, store, gateway))
    }

    #[test]
    fn plain_text_drops_markup_and_scripts() {
        let html = "<h1>Plan</h1><p>Ship &amp; test</p><script>alert('x')</script><ul><li>one</li><li>two</li></ul>";
        insta::assert_snapshot!(render_terminal_text(html).trim_end(), @r###"
        Plan
        Ship & test
        one
        two
        "###);
    }

    #[test]
    fn snippet_truncates_long_first_lines() {
        let long = format!("<p>{}</p>", "word ".repeat(30));
        let cut = snippet(&long).unwrap();
        assert!(cut.ends_with("..."));
        assert!(cut.chars().count() <= SNIPPET_CHARS + 3);
        assert_eq!(snippet("<p> </p>"), None);
    }

    #[tokio::test]
    async fn new_note_offline_stays_local_and_pending() -> TestResult {
        let (_temp, store, _gateway) = setup(None)?;
        let out = new_note(
            &store,
            NewArgs {
                title: Some("  Groceries ".into()),
                content: Some("<p>milk</p>".into()),
                tags: vec!["Home".into()],
            },
        )
        .await?;
        assert!(out.ends_with("(local only)\n"));

        let listing = list_notes(&store, ListArgs::default()).await?;
        assert!(listing.contains("Groceries"));
        assert!(listing.contains("tags    home"));
        assert!(listing.contains("    milk"));
        assert_eq!(list_tags(&store), "- home\n");
        assert!(list_pending(&store).starts_with("1 note(s) waiting to sync"));
        Ok(())
    }

    #[tokio::test]
    async fn sync_uploads_and_clears_pending() -> TestResult {
        let (_temp, store, gateway) = setup(Some("acct-1"))?;
        new_note(
            &store,
            NewArgs {
                title: Some("Remote".into()),
                ..NewArgs::default()
            },
        )
        .await?;
        let out = sync(&store, &gateway).await?;
        assert!(out.starts_with("Synced as acct-1"));
        assert_eq!(list_pending(&store), "Everything is synced.\n");
        assert_eq!(gateway.fetch_all().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn sync_without_account_is_an_error() -> TestResult {
        let (_temp, store, gateway) = setup(None)?;
        let err = sync(&store, &gateway).await.unwrap_err();
        assert!(err.to_string().contains("no account configured"));
        Ok(())
    }

    #[tokio::test]
    async fn list_filters_by_tag_and_search() -> TestResult {
        let (_temp, store, _gateway) = setup(None)?;
        for (title, tag) in [("Project plan", "work"), ("Holiday", "home")] {
            new_note(
                &store,
                NewArgs {
                    title: Some(title.into()),
                    tags: vec![tag.into()],
                    ..NewArgs::default()
                },
            )
            .await?;
        }
        let by_tag = list_notes(
            &store,
            ListArgs {
                tag: Some("Work".into()),
                ..ListArgs::default()
            },
        )
        .await?;
        assert!(by_tag.contains("Project plan"));
        assert!(!by_tag.contains("Holiday"));

        let by_search = list_notes(
            &store,
            ListArgs {
                search: Some("holi".into()),
                ..ListArgs::default()
            },
        )
        .await?;
        assert!(by_search.contains("Holiday"));
        assert!(!by_search.contains("Project plan"));

        let archived = list_notes(
            &store,
            ListArgs {
                archived: true,
                ..ListArgs::default()
            },
        )
        .await?;
        assert_eq!(archived, "No notes.\n");
        Ok(())
    }

    #[tokio::test]
    async fn share_renders_public_notes_as_text() -> TestResult {
        let (_temp, store, gateway) = setup(Some("acct-1"))?;
        new_note(
            &store,
            NewArgs {
                title: Some("Recipe".into()),
                content: Some("<p>Mix &amp; bake</p>".into()),
                ..NewArgs::default()
            },
        )
        .await?;
        let id = store.active_note().context("active note")?.id;
        store.toggle_public(&id)?;
        store.settle().await;
        let slug = store
            .note(&id)
            .and_then(|note| note.public_slug)
            .context("slug assigned")?;

        let shown = show_shared(&gateway, ShareArgs { slug }).await?;
        assert!(shown.starts_with("Recipe\n"));
        assert!(shown.ends_with("Mix & bake\n"));

        let missing = show_shared(
            &gateway,
            ShareArgs {
                slug: "nope0000".into(),
            },
        )
        .await?;
        assert!(missing.contains("unavailable"));
        Ok(())
    }
}
