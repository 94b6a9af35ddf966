//! Badge and game-card page extraction.
//!
//! The web session hands over raw HTML; the regexes here pull out the
//! pagination bound, the per-game drop rows and the remaining-drops
//! counter. Markup that does not match is a soft failure: the caller gets
//! `None`/nothing and decides how to proceed.

use std::sync::LazyLock;

use regex::Regex;

use crate::platform::AppId;

/// One farmable row on a badge page.
#[derive(Debug, Clone, PartialEq)]
pub struct BadgeEntry {
    pub app_id: AppId,
    /// Playtime the platform reports for this game, in hours.
    pub hours: f32,
}

static PAGE_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="pagelink"[^>]*>\s*(\d+)\s*<"#).expect("static regex"));

static BADGE_ROW_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="badge_row\b"#).expect("static regex"));

static APP_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"gamecards/(\d+)").expect("static regex"));

static DROPS_REMAINING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+card drops? remaining").expect("static regex"));

static NO_DROPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"No card drops remaining").expect("static regex"));

static HOURS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s+hrs on record").expect("static regex"));

/// Number of badge pages, taken from the highest pagination link.
/// A page without pagination is a single page.
pub fn parse_page_count(html: &str) -> u32 {
    PAGE_LINK_RE
        .captures_iter(html)
        .filter_map(|c| c[1].parse::<u32>().ok())
        .max()
        .unwrap_or(1)
}

/// All rows on a badge page that still have card drops to earn.
///
/// Rows without the drops marker (completed games, non-card badges) are
/// skipped; a row with the marker but no parsable app id is skipped too.
pub fn parse_badge_entries(html: &str) -> Vec<BadgeEntry> {
    let mut entries = Vec::new();

    let row_starts: Vec<usize> = BADGE_ROW_SPLIT_RE.find_iter(html).map(|m| m.start()).collect();
    for (i, &start) in row_starts.iter().enumerate() {
        let end = row_starts.get(i + 1).copied().unwrap_or(html.len());
        let row = &html[start..end];

        // "Play to earn" marker: N card drops remaining, N > 0.
        let Some(drops) = DROPS_REMAINING_RE
            .captures(row)
            .and_then(|c| c[1].parse::<u32>().ok())
        else {
            continue;
        };
        if drops == 0 {
            continue;
        }

        let Some(app_id) = APP_ID_RE.captures(row).and_then(|c| c[1].parse::<AppId>().ok())
        else {
            continue;
        };

        let hours = HOURS_RE
            .captures(row)
            .and_then(|c| c[1].parse::<f32>().ok())
            .unwrap_or(0.0);

        entries.push(BadgeEntry { app_id, hours });
    }

    entries
}

/// Remaining card drops reported by a single game's card page.
///
/// `Some(0)` means the page explicitly says farming is done; `None` means
/// the counter could not be found at all.
pub fn parse_cards_remaining(html: &str) -> Option<u32> {
    if let Some(c) = DROPS_REMAINING_RE.captures(html) {
        return c[1].parse().ok();
    }
    if NO_DROPS_RE.is_match(html) {
        return Some(0);
    }
    None
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn badge_row(app_id: AppId, drops: u32, hours: f32) -> String {
        format!(
            r#"<div class="badge_row is_link">
                 <a class="badge_row_overlay" href="https://community.example/id/me/gamecards/{app_id}/"></a>
                 <div class="badge_title_stats">
                   <div class="badge_title_stats_playtime">{hours:.1} hrs on record</div>
                   <span class="progress_info_bold">{drops} card drops remaining</span>
                 </div>
               </div>"#
        )
    }

    fn finished_row(app_id: AppId) -> String {
        format!(
            r#"<div class="badge_row is_link">
                 <a class="badge_row_overlay" href="https://community.example/id/me/gamecards/{app_id}/"></a>
                 <span class="progress_info_bold">No card drops remaining</span>
               </div>"#
        )
    }

    #[test]
    fn page_count_takes_the_highest_link() {
        let html = r#"
            <a class="pagelink" href="?p=1">1</a>
            <a class="pagelink" href="?p=2">2</a>
            <a class="pagelink" href="?p=3">3</a>
            <a class="pagelink" href="?p=2">2</a>
        "#;
        assert_eq!(parse_page_count(html), 3);
    }

    #[test]
    fn page_count_defaults_to_one() {
        assert_eq!(parse_page_count("<html><body>no pager</body></html>"), 1);
    }

    #[test]
    fn entries_skip_finished_and_unparsable_rows() {
        let html = format!(
            "{}{}{}<div class=\"badge_row\">junk without marker</div>",
            badge_row(440, 3, 12.5),
            finished_row(570),
            badge_row(730, 1, 0.3),
        );
        let entries = parse_badge_entries(&html);
        assert_eq!(
            entries,
            vec![
                BadgeEntry {
                    app_id: 440,
                    hours: 12.5
                },
                BadgeEntry {
                    app_id: 730,
                    hours: 0.3
                },
            ]
        );
    }

    #[test]
    fn entries_default_missing_hours_to_zero() {
        let html = r#"<div class="badge_row">
            <a href="/gamecards/10/"></a>
            <span>2 card drops remaining</span>
        </div>"#;
        let entries = parse_badge_entries(html);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].app_id, 10);
        assert_eq!(entries[0].hours, 0.0);
    }

    #[test]
    fn cards_remaining_reads_the_counter() {
        assert_eq!(
            parse_cards_remaining(r#"<span class="progress_info_bold">5 card drops remaining</span>"#),
            Some(5)
        );
        assert_eq!(
            parse_cards_remaining(r#"<span class="progress_info_bold">1 card drop remaining</span>"#),
            Some(1)
        );
        assert_eq!(
            parse_cards_remaining(r#"<span class="progress_info_bold">No card drops remaining</span>"#),
            Some(0)
        );
    }

    #[test]
    fn cards_remaining_is_none_on_foreign_markup() {
        assert_eq!(parse_cards_remaining("<html>maintenance</html>"), None);
    }
}
