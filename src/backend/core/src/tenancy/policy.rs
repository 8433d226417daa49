//! Declarative role × route × action policy matrix.
//!
//! The matrix answers "may a caller holding effective role R perform action A
//! on route P?". Lookups try the exact (normalized) route first, then the
//! most specific rule pattern whose `:id` segments cover the route's concrete
//! ids, and finally fall back to the role's `*` rule. Members and viewers additionally pass an ownership
//! tie-break for mutating actions on a single entity.
//!
//! Matrices are built once at startup (built-in defaults or a TOML file) and
//! are read-only afterwards. Every build checks that privileges never shrink
//! when moving up the role order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use tracing::debug;

use super::decision::{AccessDecision, DecisionReason};
use super::models::{Action, Role, UserId};
use super::route::{normalize_route, ID_PLACEHOLDER};
use crate::error::{BastionError, Result};

/// Route key of the per-role fallback rule.
pub const WILDCARD_ROUTE: &str = "*";

// ═══════════════════════════════════════════════════════════════════════════════
// Action sets
// ═══════════════════════════════════════════════════════════════════════════════

/// Actions granted by one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionSet {
    /// Every action (`*`).
    All,
    Only(BTreeSet<Action>),
}

impl ActionSet {
    pub fn empty() -> Self {
        Self::Only(BTreeSet::new())
    }

    pub fn contains(&self, action: Action) -> bool {
        match self {
            Self::All => true,
            Self::Only(actions) => actions.contains(&action),
        }
    }

    pub fn is_subset_of(&self, other: &ActionSet) -> bool {
        match (self, other) {
            (_, Self::All) => true,
            (Self::All, Self::Only(theirs)) => Action::ALL.iter().all(|a| theirs.contains(a)),
            (Self::Only(ours), Self::Only(theirs)) => ours.is_subset(theirs),
        }
    }

    fn extend(&mut self, actions: impl IntoIterator<Item = Action>) {
        if let Self::Only(set) = self {
            set.extend(actions);
        }
    }
}

impl fmt::Display for ActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Only(actions) => {
                let names: Vec<&str> = actions.iter().map(Action::as_str).collect();
                f.write_str(&names.join(", "))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rules and evaluation input
// ═══════════════════════════════════════════════════════════════════════════════

/// One row of the matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub role: Role,
    pub route: String,
    pub actions: ActionSet,
}

/// Creator and assignee of the entity an action targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityOwnership {
    #[serde(default)]
    pub created_by: Option<UserId>,
    #[serde(default)]
    pub assignee: Option<UserId>,
}

impl EntityOwnership {
    pub fn created_by(user: impl Into<UserId>) -> Self {
        Self {
            created_by: Some(user.into()),
            assignee: None,
        }
    }

    pub fn with_assignee(mut self, user: impl Into<UserId>) -> Self {
        self.assignee = Some(user.into());
        self
    }

    pub fn is_owned_by(&self, user: &UserId) -> bool {
        self.created_by.as_ref() == Some(user) || self.assignee.as_ref() == Some(user)
    }
}

/// Where an action is being attempted.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub route: &'a str,
    pub caller: &'a UserId,
    pub ownership: Option<&'a EntityOwnership>,
}

impl<'a> RouteContext<'a> {
    pub fn new(route: &'a str, caller: &'a UserId) -> Self {
        Self {
            route,
            caller,
            ownership: None,
        }
    }

    pub fn with_ownership(mut self, ownership: Option<&'a EntityOwnership>) -> Self {
        self.ownership = ownership;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Matrix
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable policy matrix.
#[derive(Debug, Clone)]
pub struct PolicyMatrix {
    rules: HashMap<(Role, String), ActionSet>,
}

impl PolicyMatrix {
    pub fn builder() -> PolicyMatrixBuilder {
        PolicyMatrixBuilder::default()
    }

    /// Built-in rules for the standard workspace entities.
    pub fn default_matrix() -> Self {
        const ENTITY_COLLECTIONS: [&str; 4] = ["projects", "tasks", "documents", "forms"];

        let mut builder = Self::builder()
            .allow_all(Role::Admin, WILDCARD_ROUTE)
            .allow_all(Role::Owner, WILDCARD_ROUTE)
            .allow(Role::Member, WILDCARD_ROUTE, [Action::Read])
            .allow(Role::Member, "/workspaces", [Action::Read, Action::Create])
            .allow(Role::Member, "/workspaces/:id", [Action::Read])
            .allow(Role::Member, "/workspaces/:id/members", [Action::Read])
            .allow(Role::Viewer, WILDCARD_ROUTE, [Action::Read]);

        for collection in ENTITY_COLLECTIONS {
            builder = builder
                .allow(
                    Role::Member,
                    &format!("/workspaces/:id/{}", collection),
                    [Action::Read, Action::Create],
                )
                .allow(
                    Role::Member,
                    &format!("/workspaces/:id/{}/:id", collection),
                    [
                        Action::Read,
                        Action::Update,
                        Action::Delete,
                        Action::Comment,
                        Action::Assign,
                    ],
                );
        }

        builder.build_unchecked()
    }

    /// Parse and validate a TOML policy file body.
    ///
    /// ```toml
    /// [[rules]]
    /// role = "member"
    /// route = "/workspaces/:id/tasks/:id"
    /// actions = ["read", "update"]
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: PolicyFile = toml::from_str(s)?;
        let mut builder = Self::builder();

        for raw in file.rules {
            let role: Role = raw.role.parse().map_err(|_| {
                BastionError::configuration(format!("Unknown role in policy rule: {}", raw.role))
            })?;

            if raw.actions.iter().any(|a| a.trim() == "*") {
                builder = builder.allow_all(role, &raw.route);
                continue;
            }

            let actions = raw
                .actions
                .iter()
                .map(|a| {
                    a.parse::<Action>().map_err(|_| {
                        BastionError::configuration(format!("Unknown action in policy rule: {}", a))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            builder = builder.allow(role, &raw.route, actions);
        }

        builder.build()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|e| {
            BastionError::configuration(format!(
                "Failed to read policy file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&body)
    }

    /// Decide whether `role` may perform `action` on `route`.
    pub fn can_perform(&self, action: Action, role: Role, route: &RouteContext<'_>) -> AccessDecision {
        let normalized = normalize_route(route.route);

        let Some(allowed) = self.lookup(role, &normalized) else {
            debug!(role = %role, route = %normalized, "No policy rule matches");
            return AccessDecision::deny(
                DecisionReason::NoMatchingRule {
                    role,
                    route: normalized.clone(),
                },
                self.required_role_normalized(action, &normalized),
            );
        };

        if !allowed.contains(action) {
            return AccessDecision::deny(
                DecisionReason::InsufficientRole,
                self.required_role_normalized(action, &normalized),
            );
        }

        if role <= Role::Member && action.is_mutating() {
            let owns = route
                .ownership
                .map(|o| o.is_owned_by(route.caller))
                .unwrap_or(false);
            if !owns {
                debug!(
                    role = %role,
                    action = %action,
                    route = %normalized,
                    "Mutating action denied by ownership tie-break"
                );
                return AccessDecision::deny(DecisionReason::NotOwner, Some(Role::Owner));
            }
        }

        AccessDecision::allow()
    }

    /// Least role whose rules allow `action` on `route`, ignoring ownership.
    pub fn required_role(&self, action: Action, route: &str) -> Option<Role> {
        self.required_role_normalized(action, &normalize_route(route))
    }

    /// Effective action set for a role on a route, after wildcard fallback.
    pub fn allowed_actions(&self, role: Role, route: &str) -> ActionSet {
        self.lookup(role, &normalize_route(route))
            .cloned()
            .unwrap_or_else(ActionSet::empty)
    }

    /// All rules, sorted by route then role.
    pub fn rules(&self) -> Vec<PolicyRule> {
        let mut rules: Vec<PolicyRule> = self
            .rules
            .iter()
            .map(|((role, route), actions)| PolicyRule {
                role: *role,
                route: route.clone(),
                actions: actions.clone(),
            })
            .collect();
        rules.sort_by(|a, b| a.route.cmp(&b.route).then(a.role.cmp(&b.role)));
        rules
    }

    fn lookup(&self, role: Role, normalized: &str) -> Option<&ActionSet> {
        self.rules
            .get(&(role, normalized.to_string()))
            .or_else(|| self.best_pattern(role, normalized))
            .or_else(|| self.rules.get(&(role, WILDCARD_ROUTE.to_string())))
    }

    /// Rule of `role` whose pattern covers `normalized`, preferring the one
    /// with the most literal segments. Ties go to the lexically smallest route.
    fn best_pattern(&self, role: Role, normalized: &str) -> Option<&ActionSet> {
        let segments: Vec<&str> = normalized.split('/').collect();
        self.rules
            .iter()
            .filter(|((rule_role, route), _)| *rule_role == role && route != WILDCARD_ROUTE)
            .filter_map(|((_, route), actions)| {
                pattern_specificity(route, &segments).map(|literal| (literal, route, actions))
            })
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)))
            .map(|(_, _, actions)| actions)
    }

    fn required_role_normalized(&self, action: Action, normalized: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|role| {
            self.lookup(*role, normalized)
                .map(|set| set.contains(action))
                .unwrap_or(false)
        })
    }

    fn effective(&self, role: Role, normalized: &str) -> ActionSet {
        self.lookup(role, normalized)
            .cloned()
            .unwrap_or_else(ActionSet::empty)
    }

    /// Reject any route where a lower role is granted something a higher one is not.
    ///
    /// Admin is the top of the chain, so a policy without admin rules covering
    /// the owner's grants is rejected.
    fn validate_monotonic(&self) -> Result<()> {
        const CHAIN: [Role; 4] = [Role::Viewer, Role::Member, Role::Owner, Role::Admin];

        let routes: BTreeSet<&str> = self.rules.keys().map(|(_, route)| route.as_str()).collect();
        for route in routes {
            for pair in CHAIN.windows(2) {
                let (lower, higher) = (pair[0], pair[1]);
                if !self
                    .effective(lower, route)
                    .is_subset_of(&self.effective(higher, route))
                {
                    return Err(BastionError::configuration(format!(
                        "Policy is not monotonic on {}: {} is granted actions that {} is not",
                        route, lower, higher
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for PolicyMatrix {
    fn default() -> Self {
        Self::default_matrix()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Accumulates rules; repeated (role, route) pairs are merged.
#[derive(Debug, Default)]
pub struct PolicyMatrixBuilder {
    rules: HashMap<(Role, String), ActionSet>,
}

impl PolicyMatrixBuilder {
    pub fn allow(mut self, role: Role, route: &str, actions: impl IntoIterator<Item = Action>) -> Self {
        self.rules
            .entry((role, route_key(route)))
            .or_insert_with(ActionSet::empty)
            .extend(actions);
        self
    }

    pub fn allow_all(mut self, role: Role, route: &str) -> Self {
        self.rules.insert((role, route_key(route)), ActionSet::All);
        self
    }

    /// Finish and validate monotonicity.
    pub fn build(self) -> Result<PolicyMatrix> {
        let matrix = self.build_unchecked();
        matrix.validate_monotonic()?;
        Ok(matrix)
    }

    fn build_unchecked(self) -> PolicyMatrix {
        PolicyMatrix { rules: self.rules }
    }
}

/// Number of literal segments when `pattern` covers `segments`, else `None`.
/// A `:id` segment in the pattern matches any single segment.
fn pattern_specificity(pattern: &str, segments: &[&str]) -> Option<usize> {
    let parts: Vec<&str> = pattern.split('/').collect();
    if parts.len() != segments.len() {
        return None;
    }
    let mut literal = 0;
    for (part, segment) in parts.iter().zip(segments) {
        if *part == ID_PLACEHOLDER {
            continue;
        }
        if part != segment {
            return None;
        }
        literal += 1;
    }
    Some(literal)
}

fn route_key(route: &str) -> String {
    if route.trim() == WILDCARD_ROUTE {
        WILDCARD_ROUTE.to_string()
    } else {
        normalize_route(route)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// File format
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    role: String,
    route: String,
    actions: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
