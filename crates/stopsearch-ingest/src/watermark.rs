//! Incremental watermark and month selection
//!
//! The watermark for a force is the maximum event timestamp already stored
//! for it, truncated to a `YYYY-MM` month. Storage is the single source of
//! truth: the watermark is read fresh at the start of every run and never
//! cached across runs.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Month key format used throughout: `YYYY-MM`.
const MONTH_FORMAT: &str = "%Y-%m";

/// Latest ingested month for a force, if any rows exist.
pub async fn latest_month(pool: &PgPool, force: &str) -> Result<Option<String>, sqlx::Error> {
    let latest: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT MAX(datetime) FROM stop_searches WHERE force = $1")
            .bind(force)
            .fetch_one(pool)
            .await?;

    Ok(latest.map(|dt| dt.format(MONTH_FORMAT).to_string()))
}

/// Months that still need fetching.
///
/// Keeps every available month strictly after the watermark (all of them when
/// no watermark exists), and drops months after `target` when an upper bound
/// is given. `YYYY-MM` keys order correctly as strings.
pub fn months_after_watermark(
    available: &[String],
    watermark: Option<&str>,
    target: Option<&str>,
) -> Vec<String> {
    available
        .iter()
        .filter(|month| match target {
            Some(upper) => month.as_str() <= upper,
            None => true,
        })
        .filter(|month| match watermark {
            Some(latest) => month.as_str() > latest,
            None => true,
        })
        .cloned()
        .collect()
}

/// Whether `text` looks like a `YYYY-MM` month key.
pub fn is_month_key(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 7
        && bytes[4] == b'-'
        && text[..4].chars().all(|c| c.is_ascii_digit())
        && text[5..].chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn months(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn selects_only_months_after_watermark() {
        let available = months(&["2023-01", "2023-02", "2023-03"]);
        let selected = months_after_watermark(&available, Some("2023-02"), None);
        assert_eq!(selected, months(&["2023-03"]));
    }

    #[test]
    fn no_watermark_selects_everything() {
        let available = months(&["2023-01", "2023-02"]);
        let selected = months_after_watermark(&available, None, None);
        assert_eq!(selected, available);
    }

    #[test]
    fn selection_is_idempotent_when_nothing_new_is_published() {
        // Watermark at the newest available month -> empty fetch list, every
        // time it is recomputed.
        let available = months(&["2023-01", "2023-02", "2023-03"]);
        for _ in 0..3 {
            let selected = months_after_watermark(&available, Some("2023-03"), None);
            assert!(selected.is_empty());
        }
    }

    #[test]
    fn target_month_caps_the_selection() {
        let available = months(&["2023-01", "2023-02", "2023-03", "2023-04"]);
        let selected = months_after_watermark(&available, Some("2023-01"), Some("2023-03"));
        assert_eq!(selected, months(&["2023-02", "2023-03"]));
    }

    #[test]
    fn empty_availability_yields_empty_selection() {
        assert!(months_after_watermark(&[], None, None).is_empty());
        assert!(months_after_watermark(&[], Some("2023-01"), None).is_empty());
    }

    #[test]
    fn month_key_validation() {
        assert!(is_month_key("2023-02"));
        assert!(!is_month_key("2023-2"));
        assert!(!is_month_key("2023/02"));
        assert!(!is_month_key("23-02-01"));
    }
}
