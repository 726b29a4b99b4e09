//! Request trace IDs.
//!
//! Keyfront stamps every inbound request with one trace ID and carries it
//! to every place the request leaves a mark:
//!
//! - the `x-keyfront-trace-id` response header and the `traceId` field of
//!   error bodies,
//! - the request's audit event and any error-tracker record,
//! - the `X-Trace-ID` header injected into downstream proxy calls.
//!
//! Wire format: `"kf-"` followed by a UUID v4.
//!
//! Rather than threading an ID parameter through the whole call graph, the
//! trace middleware installs the ID in a task-local slot around the
//! middleware chain, and leaf code reads it back with [`current`]. Code
//! that can run outside a request scope — startup, background flushers,
//! test helpers — uses [`current_or_new`], which mints a fresh ID instead
//! of failing. The slot is deliberately private: [`with_trace_id`] is the
//! only way to install an ID, so a scope can never leak past its request.
//! Note that `tokio::spawn` does not inherit the slot — background work
//! detached from a request intentionally gets its own ID.

use uuid::Uuid;

tokio::task_local! {
    /// Trace ID of the request driving the current task, when inside a
    /// [`with_trace_id`] scope.
    static CURRENT_TRACE_ID: String;
}

/// Prefix marking trace IDs minted by this gateway (as opposed to IDs that
/// arrived from upstream infrastructure).
const TRACE_PREFIX: &str = "kf-";

/// Mint a fresh trace ID.
#[must_use]
pub fn generate() -> String {
    format!("{TRACE_PREFIX}{}", Uuid::new_v4())
}

/// The trace ID installed for the current task, if any.
#[must_use]
pub fn current() -> Option<String> {
    CURRENT_TRACE_ID.try_with(Clone::clone).ok()
}

/// The current trace ID, or a fresh one when no request scope is active.
///
/// Audit events, error bodies, and error-tracker records always need *an*
/// ID; off-request paths (startup checks, shutdown flushes) get a unique
/// one rather than an error.
#[must_use]
pub fn current_or_new() -> String {
    current().unwrap_or_else(generate)
}

/// Run `future` with `trace_id` installed for its whole duration,
/// including everything it awaits.
pub async fn with_trace_id<F, T>(trace_id: String, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT_TRACE_ID.scope(trace_id, future).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_use_the_wire_format() {
        let id = generate();
        let uuid_part = id.strip_prefix("kf-").expect("gateway prefix");
        let uuid = Uuid::parse_str(uuid_part).expect("UUID body");
        assert_eq!(uuid.get_version_num(), 4);
    }

    #[test]
    fn minted_ids_do_not_collide() {
        let ids: std::collections::HashSet<String> = (0..100).map(|_| generate()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[tokio::test]
    async fn scope_installs_and_clears_the_id() {
        assert_eq!(current(), None);

        let seen = with_trace_id("kf-req-1".to_string(), async { current() }).await;
        assert_eq!(seen.as_deref(), Some("kf-req-1"));

        // Once the request scope ends, the slot is empty again.
        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn id_survives_await_points_within_a_scope() {
        let seen = with_trace_id("kf-req-2".to_string(), async {
            tokio::task::yield_now().await;
            current()
        })
        .await;
        assert_eq!(seen.as_deref(), Some("kf-req-2"));
    }

    #[tokio::test]
    async fn current_or_new_prefers_the_installed_id() {
        let seen = with_trace_id("kf-req-3".to_string(), async { current_or_new() }).await;
        assert_eq!(seen, "kf-req-3");
    }

    #[tokio::test]
    async fn current_or_new_mints_off_request() {
        // Background flushers and startup paths run with no scope; they
        // must still get a well-formed ID, and a different one each time.
        let a = current_or_new();
        let b = current_or_new();
        assert!(a.starts_with("kf-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn spawned_tasks_do_not_inherit_the_request_scope() {
        // Work detached via tokio::spawn is not part of the request; its
        // audit trail must not claim the request's ID.
        let inherited = with_trace_id("kf-req-4".to_string(), async {
            tokio::spawn(async { current() }).await.unwrap()
        })
        .await;
        assert_eq!(inherited, None);
    }
}
