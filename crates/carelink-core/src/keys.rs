// ── Well-known cache keys ──
//
// The notification layer owns exactly two logical queries. List pages
// key under the list prefix so one invalidation covers every page, and
// carry their paging params so an owner task can rebuild the fetch
// from the key alone.

use crate::cache::QueryKey;

pub fn unread_count() -> QueryKey {
    QueryKey::new(["notifications", "unreadCount"])
}

pub fn notification_list() -> QueryKey {
    QueryKey::new(["notifications", "list"])
}

pub fn notification_list_page(page: u32, per_page: u32) -> QueryKey {
    QueryKey::new(vec![
        "notifications".to_string(),
        "list".to_string(),
        page.to_string(),
        per_page.to_string(),
    ])
}

/// Recover `(page, per_page)` from a list-page key.
pub fn list_page_params(key: &QueryKey) -> Option<(u32, u32)> {
    if !key.starts_with(&notification_list()) {
        return None;
    }
    match key.segments() {
        [_, _, page, per_page] => Some((page.parse().ok()?, per_page.parse().ok()?)),
        _ => None,
    }
}
