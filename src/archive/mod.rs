//! Date-keyed archive of daily documents.
//!
//! [`merge`] is the pure half: it folds a freshly classified
//! [`DailyDocument`] into the [`Archive`] index. [`ArchiveStore`] is the
//! file-system half that persists both.

pub mod store;

pub use store::ArchiveStore;

use chrono::NaiveDate;

use crate::models::{Archive, ArchiveEntry, DailyDocument};
use crate::utils::truncate_chars;

const MAX_HEADLINE_CHARS: usize = 160;

/// Path of a day's document relative to the archive root.
pub fn document_path(date: NaiveDate) -> String {
    format!("archive/{date}.json")
}

/// Index entry describing `doc`.
pub fn entry_for(doc: &DailyDocument) -> ArchiveEntry {
    ArchiveEntry {
        date: doc.date,
        path: document_path(doc.date),
        headline: headline(&doc.summary),
        news_count: doc.news_count(),
    }
}

/// Return a new archive with `doc` added.
///
/// An entry for the same date is replaced in place; otherwise the entry is
/// inserted at its chronological position. Every other entry is carried
/// over untouched.
pub fn merge(archive: &Archive, doc: &DailyDocument) -> Archive {
    let entry = entry_for(doc);
    let mut entries = archive.entries.clone();
    let pos = entries.partition_point(|e| e.date < entry.date);
    match entries.get_mut(pos) {
        Some(existing) if existing.date == entry.date => *existing = entry,
        _ => entries.insert(pos, entry),
    }
    Archive { entries }
}

/// First sentence of the summary, capped for display.
fn headline(summary: &str) -> String {
    let summary = summary.trim();
    let mut chars = summary.char_indices().peekable();
    let mut end = summary.len();
    while let Some((idx, c)) = chars.next() {
        let closes = match c {
            '。' | '！' | '？' => true,
            // "2.5%" is not a sentence break
            '.' | '!' | '?' => chars.peek().is_none_or(|(_, next)| next.is_whitespace()),
            _ => false,
        };
        if closes {
            end = idx + c.len_utf8();
            break;
        }
    }
    truncate_chars(&summary[..end], MAX_HEADLINE_CHARS)
}
