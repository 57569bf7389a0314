//! The scope algebra used to accumulate bearer-token authorization scopes
//! across a sequence of registry requests.
use crate::reference::ContainerRef;
use std::collections::BTreeMap;

/// An action a scope grants against a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Read access.
    Pull,
    /// Write access.
    Push,
    /// Removal access.
    Delete,
    /// All actions; absorbs any other action in the same group.
    Wildcard,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Pull => "pull",
            Action::Push => "push",
            Action::Delete => "delete",
            Action::Wildcard => "*",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pull" => Action::Pull,
            "push" => Action::Push,
            "delete" => Action::Delete,
            _ => Action::Wildcard,
        }
    }
}

// Ordering must be ascending-alphabetical by wire representation ("delete" <
// "pull" < "push" < "*"), not declaration order, since `clean_scopes` sorts
// actions within a group directly with this impl.
impl PartialOrd for Action {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Action {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

/// Append a `repository:<full-repository>:<actions>` scope for `reference`
/// granting `actions`, merging it into `existing`.
pub fn append_repository_scope(existing: &str, reference: &ContainerRef, actions: &[&str]) -> String {
    let joined = actions.join(",");
    let scope = format!("repository:{}:{}", reference.repository(), joined);
    if existing.is_empty() {
        clean_scopes(&scope)
    } else {
        clean_scopes(&format!("{existing} {scope}"))
    }
}

/// Deduplicate and normalize a space-separated list of scope strings.
///
/// Each scope has the shape `resourceType:resourceName:actions`. Scopes
/// sharing a `(resourceType, resourceName)` pair are merged: their actions
/// are unioned, collapsed to `*` if any scope in the group grants `*`,
/// otherwise sorted ascending. Groups are emitted sorted ascending by key.
/// A bare segment with no colon is passed through unchanged, sorted after
/// all well-formed groups.
pub fn clean_scopes(raw: &str) -> String {
    let mut groups: BTreeMap<(String, String), Vec<Action>> = BTreeMap::new();
    let mut bare: Vec<&str> = vec![];

    for scope in raw.split_whitespace() {
        let mut it = scope.splitn(3, ':');
        let (resource_type, resource_name, actions) = match (it.next(), it.next(), it.next()) {
            (Some(t), Some(n), Some(acts)) => (t, n, acts),
            _ => {
                bare.push(scope);
                continue;
            }
        };
        let entry = groups
            .entry((resource_type.to_string(), resource_name.to_string()))
            .or_default();
        for a in actions.split(',').filter(|a| !a.is_empty()) {
            entry.push(Action::parse(a));
        }
    }

    let mut emitted: Vec<String> = groups
        .into_iter()
        .filter(|(_, actions)| !actions.is_empty())
        .map(|((rt, rn), mut actions)| {
            actions.sort();
            actions.dedup();
            let action_str = if actions.contains(&Action::Wildcard) {
                "*".to_string()
            } else {
                actions.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(",")
            };
            format!("{rt}:{rn}:{action_str}")
        })
        .collect();

    emitted.sort();
    emitted.extend(bare.into_iter().map(str::to_string));
    emitted.join(" ")
}
