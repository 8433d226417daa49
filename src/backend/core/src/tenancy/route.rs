//! Route normalization.
//!
//! Policy rules are keyed by route patterns, so concrete request paths are
//! reduced to the same shape before lookup: `/Workspaces/42/tasks/?page=2`
//! and `/workspaces/:workspace_id/tasks` both become `/workspaces/:id/tasks`.

use regex::Regex;
use std::sync::LazyLock;

/// Placeholder substituted for every dynamic segment.
pub const ID_PLACEHOLDER: &str = ":id";

static UUID_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("Invalid UUID segment regex")
});

static NUMERIC_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("Invalid numeric segment regex"));

static OBJECT_ID_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{24}$").expect("Invalid object id regex"));

/// Long opaque tokens (slugs with ids, base62 keys). Must also contain a digit.
static OPAQUE_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{8,}$").expect("Invalid opaque segment regex"));

/// Reduce a request path or route pattern to its canonical policy key.
///
/// Idempotent: `normalize_route(&normalize_route(r)) == normalize_route(r)`.
pub fn normalize_route(route: &str) -> String {
    let path = route.split(['?', '#']).next().unwrap_or_default();

    let segments: Vec<String> = path
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(normalize_segment)
        .collect();

    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}

/// Like [`normalize_route`], but also treats segments equal to any of
/// `known_ids` as dynamic. Used when the caller's route embeds short ids
/// (`/workspaces/w1/tasks`) that do not look like identifiers on their own.
pub fn normalize_route_with_ids(route: &str, known_ids: &[&str]) -> String {
    let path = route.split(['?', '#']).next().unwrap_or_default();
    let substituted: Vec<&str> = path
        .split('/')
        .map(|segment| {
            let trimmed = segment.trim();
            if !trimmed.is_empty() && known_ids.contains(&trimmed) {
                ID_PLACEHOLDER
            } else {
                segment
            }
        })
        .collect();
    normalize_route(&substituted.join("/"))
}

fn normalize_segment(segment: &str) -> String {
    if is_dynamic(segment) {
        ID_PLACEHOLDER.to_string()
    } else {
        segment.to_ascii_lowercase()
    }
}

fn is_dynamic(segment: &str) -> bool {
    if segment.starts_with(':') || (segment.starts_with('{') && segment.ends_with('}')) {
        return true;
    }

    UUID_SEGMENT.is_match(segment)
        || NUMERIC_SEGMENT.is_match(segment)
        || OBJECT_ID_SEGMENT.is_match(segment)
        || (OPAQUE_SEGMENT.is_match(segment) && segment.bytes().any(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_query_fragment_and_slashes() {
        assert_eq!(normalize_route("/workspaces/?page=2"), "/workspaces");
        assert_eq!(normalize_route("//workspaces//tasks#top"), "/workspaces/tasks");
        assert_eq!(normalize_route(""), "/");
        assert_eq!(normalize_route("/?x=1"), "/");
    }

    #[test]
    fn test_whitespace_around_segments_is_dropped() {
        assert_eq!(normalize_route("/workspaces /"), "/workspaces");
        assert_eq!(normalize_route("/workspaces/ 42 /tasks"), "/workspaces/:id/tasks");
        assert_eq!(normalize_route("/ /workspaces"), "/workspaces");
    }

    #[test]
    fn test_replaces_identifiers() {
        assert_eq!(
            normalize_route("/workspaces/550e8400-e29b-41d4-a716-446655440000/tasks/42"),
            "/workspaces/:id/tasks/:id"
        );
        assert_eq!(
            normalize_route("/documents/507f1f77bcf86cd799439011"),
            "/documents/:id"
        );
        assert_eq!(normalize_route("/forms/frm_8Xk2pQ91"), "/forms/:id");
    }

    #[test]
    fn test_placeholders_collapse_to_id() {
        assert_eq!(
            normalize_route("/workspaces/:workspace_id/projects/{project_id}"),
            "/workspaces/:id/projects/:id"
        );
    }

    #[test]
    fn test_static_segments_are_lowercased_not_replaced() {
        assert_eq!(normalize_route("/V1/Workspaces/Members"), "/v1/workspaces/members");
        assert_eq!(normalize_route("/workspaces/settings"), "/workspaces/settings");
        assert_eq!(normalize_route("/workspaces/w1"), "/workspaces/w1");
    }

    #[test]
    fn test_known_ids_are_substituted() {
        assert_eq!(
            normalize_route_with_ids("/workspaces/w1/tasks?x=w1", &["w1"]),
            "/workspaces/:id/tasks"
        );
        assert_eq!(
            normalize_route_with_ids("/workspaces/w1/tasks/t1", &["w1", "t1"]),
            "/workspaces/:id/tasks/:id"
        );
        assert_eq!(normalize_route_with_ids("/workspaces/w2", &["w1"]), "/workspaces/w2");
    }

    #[test]
    fn test_idempotent() {
        let routes = [
            "/Workspaces/42/Tasks/?page=2",
            "//workspaces/:id//documents/",
            "/forms/FRM_8XK2PQ91#x",
            "/v1/workspaces/550E8400-E29B-41D4-A716-446655440000/actions/archive/preview",
            "workspaces",
            "/",
            "/workspaces /",
            " /workspaces/ 42 /tasks\t/",
        ];
        for route in routes {
            let once = normalize_route(route);
            assert_eq!(normalize_route(&once), once, "not idempotent for {}", route);
        }
    }
}
