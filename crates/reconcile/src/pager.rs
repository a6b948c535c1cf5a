//! Paginated listing under retry.

use crate::classify::RetryOptions;
use crate::error::{ReconcileError, Result};
use crate::retry::RetryPolicy;
use directory::{DirectoryClient, Entity, ListQuery};
use log::trace;

/// Fetch every page of `query`, retrying each page independently.
///
/// A missing parent is fatal, so 404 is never retried here.
pub fn list_all(
    client: &dyn DirectoryClient,
    policy: &RetryPolicy,
    query: &ListQuery,
    description: &str,
) -> Result<Vec<Entity>> {
    let mut items = Vec::new();
    let mut token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = policy
            .run(description, RetryOptions::default(), || {
                client.list_page(query, token.as_deref())
            })
            .map_err(|source| ReconcileError::remote(description, source))?;
        pages += 1;
        trace!("{description}: page {pages} returned {} item(s)", page.items.len());

        let next = page.next_token().map(str::to_string);
        items.extend(page.items);
        match next {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use directory::{ApiError, CallKind, Group, Member, MemoryDirectory, Role};

    #[test]
    fn test_list_all_follows_tokens_and_retries_pages() {
        let dir = MemoryDirectory::new().with_page_size(2);
        dir.add_group(Group::new("eng@x.com")).unwrap();
        for i in 0..5 {
            dir.add_member("eng@x.com", Member::new(format!("u{i}@x.com"), Role::Member))
                .unwrap();
        }
        dir.fail_next(CallKind::List, ApiError::new(503, "Backend Error"));

        let clock = crate::clock::ManualClock::new();
        let policy = RetryPolicy::default().with_clock(std::sync::Arc::new(clock));
        let items = list_all(&dir, &policy, &ListQuery::members("eng@x.com"), "list members").unwrap();

        assert_eq!(items.len(), 5);
        assert_eq!(dir.calls().len(), 4);
    }

    #[test]
    fn test_missing_parent_is_fatal() {
        let dir = MemoryDirectory::new();
        let err = list_all(
            &dir,
            &RetryPolicy::default(),
            &ListQuery::members("ghost@x.com"),
            "list members of ghost@x.com",
        )
        .unwrap_err();
        assert!(err.remote_source().is_some_and(directory::Error::is_not_found));
        assert_eq!(dir.calls().len(), 1);
    }
}
