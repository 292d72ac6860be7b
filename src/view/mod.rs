use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::model::{Note, SortMode};

/// What the list pane is currently showing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewFilter<'a> {
    pub search: &'a str,
    pub tag: Option<&'a str>,
    pub show_archived: bool,
}

/// Notes visible under `filter`, pinned first, then ordered by `sort`.
pub fn filtered_notes<'a, I>(notes: I, filter: &ViewFilter<'_>, sort: SortMode) -> Vec<&'a Note>
where
    I: IntoIterator<Item = &'a Note>,
{
    let needle = filter.search.to_lowercase();
    let mut visible: Vec<&Note> = notes
        .into_iter()
        .filter(|note| note.is_archived == filter.show_archived)
        .filter(|note| needle.is_empty() || matches_search(note, &needle))
        .filter(|note| match filter.tag {
            Some(tag) => note.tags.iter().any(|t| t == tag),
            None => true,
        })
        .collect();

    visible.sort_by(|a, b| {
        b.is_pinned
            .cmp(&a.is_pinned)
            .then_with(|| compare_by_mode(a, b, sort))
    });
    visible
}

/// Sorted, deduplicated union of every tag in the collection.
pub fn all_tags<'a, I>(notes: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a Note>,
{
    notes
        .into_iter()
        .flat_map(|note| note.tags.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn matches_search(note: &Note, needle: &str) -> bool {
    note.title.to_lowercase().contains(needle)
        || note.content.to_lowercase().contains(needle)
        || note.tags.iter().any(|tag| tag.to_lowercase().contains(needle))
}

fn compare_by_mode(a: &Note, b: &Note, sort: SortMode) -> Ordering {
    match sort {
        SortMode::Updated => b.updated_at.cmp(&a.updated_at),
        SortMode::Created => b.created_at.cmp(&a.created_at),
        SortMode::Title => compare_titles(&a.title, &b.title),
    }
}

// Case-folded first so "apple" and "Banana" sort as a reader expects; the raw
// comparison only breaks ties.
fn compare_titles(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn note(id: &str, title: &str, updated: OffsetDateTime) -> Note {
        let mut note = Note::empty();
        note.id = id.to_string();
        note.title = title.to_string();
        note.created_at = datetime!(2024-01-01 0:00 UTC);
        note.updated_at = updated;
        note
    }

    fn ids(notes: &[&Note]) -> Vec<String> {
        notes.iter().map(|note| note.id.clone()).collect()
    }

    #[test]
    fn all_tags_is_sorted_and_deduplicated() {
        let mut a = note("a", "", datetime!(2024-01-02 0:00 UTC));
        a.tags = vec!["a".into(), "b".into()];
        let mut b = note("b", "", datetime!(2024-01-02 0:00 UTC));
        b.tags = vec!["b".into(), "c".into()];
        let tags = all_tags([&a, &b]);
        insta::assert_snapshot!(tags.join(","), @"a,b,c");
    }

    #[test]
    fn all_tags_ignores_the_current_view() {
        let mut archived = note("a", "", datetime!(2024-01-02 0:00 UTC));
        archived.is_archived = true;
        archived.tags = vec!["old".into()];
        assert_eq!(all_tags([&archived]), vec!["old".to_string()]);
    }

    #[test]
    fn pinned_notes_lead_in_every_sort_mode() {
        let mut notes = vec![
            note("1", "zeta", datetime!(2024-03-05 0:00 UTC)),
            note("2", "alpha", datetime!(2024-03-01 0:00 UTC)),
            note("3", "Mid", datetime!(2024-03-04 0:00 UTC)),
            note("4", "beta", datetime!(2024-03-02 0:00 UTC)),
        ];
        notes[1].is_pinned = true;
        notes[3].is_pinned = true;
        notes[0].created_at = datetime!(2024-02-01 0:00 UTC);

        for sort in [SortMode::Updated, SortMode::Created, SortMode::Title] {
            let visible = filtered_notes(&notes, &ViewFilter::default(), sort);
            let first_unpinned = visible
                .iter()
                .position(|note| !note.is_pinned)
                .unwrap_or(visible.len());
            assert!(
                visible[first_unpinned..].iter().all(|note| !note.is_pinned),
                "unpinned before pinned under {sort}"
            );
        }

        let by_updated = filtered_notes(&notes, &ViewFilter::default(), SortMode::Updated);
        assert_eq!(ids(&by_updated), vec!["4", "2", "1", "3"]);
        let by_title = filtered_notes(&notes, &ViewFilter::default(), SortMode::Title);
        assert_eq!(ids(&by_title), vec!["2", "4", "3", "1"]);
        let by_created = filtered_notes(&notes, &ViewFilter::default(), SortMode::Created);
        assert_eq!(ids(&by_created)[2], "1");
    }

    #[test]
    fn search_matches_title_content_or_tag_and_respects_archive_view() {
        let mut title_hit = note("t", "Project plan", datetime!(2024-03-01 0:00 UTC));
        title_hit.content = "x".into();
        let mut content_hit = note("c", "Notes", datetime!(2024-03-02 0:00 UTC));
        content_hit.content = "<p>side PROJ idea</p>".into();
        let mut tag_hit = note("g", "Misc", datetime!(2024-03-03 0:00 UTC));
        tag_hit.tags = vec!["projects".into()];
        let miss = note("m", "Groceries", datetime!(2024-03-04 0:00 UTC));
        let mut archived_hit = note("a", "Old proj", datetime!(2024-03-05 0:00 UTC));
        archived_hit.is_archived = true;

        let notes = vec![title_hit, content_hit, tag_hit, miss, archived_hit];
        let filter = ViewFilter {
            search: "proj",
            ..ViewFilter::default()
        };
        let visible = filtered_notes(&notes, &filter, SortMode::Updated);
        assert_eq!(ids(&visible), vec!["g", "c", "t"]);

        let archive_view = ViewFilter {
            search: "PROJ",
            show_archived: true,
            ..ViewFilter::default()
        };
        let visible = filtered_notes(&notes, &archive_view, SortMode::Updated);
        assert_eq!(ids(&visible), vec!["a"]);
    }

    #[test]
    fn search_text_is_matched_verbatim_including_spaces() {
        let spaced = note("s", "side project", datetime!(2024-03-01 0:00 UTC));
        let joined = note("j", "sideproject", datetime!(2024-03-02 0:00 UTC));
        let notes = vec![spaced, joined];
        let filter = ViewFilter {
            search: "e p",
            ..ViewFilter::default()
        };
        assert_eq!(ids(&filtered_notes(&notes, &filter, SortMode::Updated)), vec!["s"]);

        let padded = ViewFilter {
            search: " project",
            ..ViewFilter::default()
        };
        assert_eq!(ids(&filtered_notes(&notes, &padded, SortMode::Updated)), vec!["s"]);
    }

    #[test]
    fn tag_filter_requires_exact_membership() {
        let mut work = note("w", "w", datetime!(2024-03-01 0:00 UTC));
        work.tags = vec!["work".into()];
        let mut workshop = note("s", "s", datetime!(2024-03-02 0:00 UTC));
        workshop.tags = vec!["workshop".into()];
        let notes = vec![work, workshop];
        let filter = ViewFilter {
            tag: Some("work"),
            ..ViewFilter::default()
        };
        assert_eq!(ids(&filtered_notes(&notes, &filter, SortMode::Updated)), vec!["w"]);
    }
}
