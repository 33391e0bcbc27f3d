//! Fetch history pages from the remote ledger, absorbing short pages and transient errors

use crate::{
    client::{Page, PageRequest, RemoteLedger},
    config::PageRetryPolicy,
    error::ServerError,
};

/// Fetches one history page, retrying within the budget of `policy`.
///
/// A page is fetched again while it holds fewer than `min_page_items` items and a `before`
/// cursor is present, as paginated APIs sporadically answer from a stale replica. Transient
/// errors are retried within the same budget with a linear backoff. The largest page seen is
/// returned.
pub async fn fetch_history_page(
    ledger: &dyn RemoteLedger,
    request: &PageRequest,
    policy: &PageRetryPolicy,
) -> Result<Page, ServerError> {
    let min_items = policy.min_page_items.min(request.limit);
    let mut best: Option<Page> = None;
    let mut attempt: u32 = 0;

    loop {
        match ledger.fetch_page(request).await {
            Ok(page) => {
                let best_page = match best.take() {
                    Some(previous) if previous.items.len() >= page.items.len() => previous,
                    _ => page,
                };
                let short = best_page.items.len() < min_items && request.before.is_some();
                if !short || attempt >= policy.max_page_retries {
                    return Ok(best_page);
                }
                tracing::debug!(
                    "short page of {} items for {}, retrying",
                    best_page.items.len(),
                    request.address
                );
                best = Some(best_page);
            }
            Err(e) if e.is_transient() && attempt < policy.max_page_retries => {
                tracing::debug!("transient error fetching page for {}. {}", request.address, e);
            }
            Err(e) => {
                return match best {
                    Some(page) => Ok(page),
                    None => Err(e),
                };
            }
        }

        attempt += 1;
        tokio::time::sleep(policy.retry_delay * attempt).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{mocks::MockLedger, primitives::PaginationCursor};

    fn policy() -> PageRetryPolicy {
        PageRetryPolicy {
            max_page_retries: 3,
            min_page_items: 5,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn request(before: Option<PaginationCursor>) -> PageRequest {
        PageRequest {
            address: "acc".to_string(),
            before,
            until: None,
            limit: 10,
        }
    }

    #[tokio::test]
    async fn short_page_with_before_cursor_is_retried() {
        let ledger = MockLedger::with_history("acc", 1..=30);
        ledger.short_next(2);
        ledger.short_next(1);
        let before = ledger.cursor_at("acc", 25);

        let page = fetch_history_page(&ledger, &request(Some(before)), &policy())
            .await
            .unwrap();

        assert_eq!(page.items.len(), 10);
        assert_eq!(ledger.page_calls(), 3);
    }

    #[tokio::test]
    async fn short_page_without_before_cursor_is_accepted() {
        let ledger = MockLedger::with_history("acc", 1..=30);
        ledger.short_next(2);

        let page = fetch_history_page(&ledger, &request(None), &policy())
            .await
            .unwrap();

        assert_eq!(page.items.len(), 2);
        assert_eq!(ledger.page_calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_largest_page() {
        let ledger = MockLedger::with_history("acc", 1..=30);
        for max_items in [3, 4, 1, 2] {
            ledger.short_next(max_items);
        }
        let before = ledger.cursor_at("acc", 25);

        let page = fetch_history_page(&ledger, &request(Some(before)), &policy())
            .await
            .unwrap();

        assert_eq!(page.items.len(), 4);
        assert_eq!(ledger.page_calls(), 4);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_and_persistent_errors_surface() {
        let ledger = MockLedger::with_history("acc", 1..=30);
        ledger.fail_next(ServerError::Timeout);
        ledger.fail_next(ServerError::RateLimited);

        let page = fetch_history_page(&ledger, &request(None), &policy())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 10);

        ledger.fail_next(ServerError::RequestFailed("500".to_string()));
        let result = fetch_history_page(&ledger, &request(None), &policy()).await;
        assert_eq!(
            result.unwrap_err(),
            ServerError::RequestFailed("500".to_string())
        );
    }
}
