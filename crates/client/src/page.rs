//! Cursor-following iteration over paged list endpoints.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::ApiError;

/// One page of results plus the continuation token, if any. An absent or
/// empty token means iteration is complete; no fixed page size is assumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, continuation: None }
    }
}

fn max_pages() -> usize {
    std::env::var("STEWARD_MAX_PAGES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000)
}

/// Case-insensitive exact match used for name lookups against list endpoints
/// that offer no server-side search.
pub fn name_matches(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Follow continuation cursors until `pred` matches or pages run out.
///
/// The first match in iteration order wins (the service guarantees no
/// ordering, so that is the tie-break when duplicates exist). Transport
/// errors abort iteration; exhausting all pages without a match is a normal
/// `Ok(None)` outcome, not an error.
pub async fn find_by<T, P, F, Fut>(mut fetch: F, pred: P) -> Result<Option<T>, ApiError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, ApiError>>,
    P: Fn(&T) -> bool,
{
    let mut cursor: Option<String> = None;
    for _ in 0..max_pages() {
        let page = fetch(cursor.take()).await?;
        if let Some(hit) = page.items.into_iter().find(|it| pred(it)) {
            return Ok(Some(hit));
        }
        match page.continuation {
            Some(c) if !c.is_empty() => cursor = Some(c),
            _ => return Ok(None),
        }
    }
    Err(ApiError::Transport(format!(
        "list endpoint did not terminate within {} pages",
        max_pages()
    )))
}
