//! RBAC rule coverage
//!
//! Answers whether a set of owner rules grants everything a set of servant
//! rules asks for. Servant rules are broken down into atomic requests (one
//! group, resource, verb and optional resource name each) and every atomic
//! request must be granted by at least one owner rule.

use k8s_openapi::api::rbac::v1::PolicyRule;

const WILDCARD: &str = "*";

/// Check whether `owner` covers `servant`
///
/// # Returns
/// `(true, [])` when fully covered, otherwise `false` and the atomic rules
/// that no owner rule grants.
pub fn covers(owner: &[PolicyRule], servant: &[PolicyRule]) -> (bool, Vec<PolicyRule>) {
    let mut uncovered: Vec<PolicyRule> = Vec::new();

    for requested in servant.iter().flat_map(breakdown) {
        if owner.iter().any(|rule| rule_allows(rule, &requested)) {
            continue;
        }
        if !uncovered.contains(&requested) {
            uncovered.push(requested);
        }
    }

    (uncovered.is_empty(), uncovered)
}

/// Split a rule into single-verb, single-resource rules
fn breakdown(rule: &PolicyRule) -> Vec<PolicyRule> {
    let mut atoms = Vec::new();
    let groups = rule.api_groups.as_deref().unwrap_or_default();
    let resources = rule.resources.as_deref().unwrap_or_default();
    let names = rule.resource_names.as_deref().unwrap_or_default();

    for group in groups {
        for resource in resources {
            for verb in &rule.verbs {
                if names.is_empty() {
                    atoms.push(resource_rule(group, resource, verb, None));
                } else {
                    for name in names {
                        atoms.push(resource_rule(group, resource, verb, Some(name)));
                    }
                }
            }
        }
    }

    for url in rule.non_resource_urls.as_deref().unwrap_or_default() {
        for verb in &rule.verbs {
            atoms.push(PolicyRule {
                non_resource_urls: Some(vec![url.clone()]),
                verbs: vec![verb.clone()],
                ..Default::default()
            });
        }
    }

    atoms
}

fn resource_rule(group: &str, resource: &str, verb: &str, name: Option<&String>) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(vec![resource.to_string()]),
        verbs: vec![verb.to_string()],
        resource_names: name.map(|n| vec![n.clone()]),
        ..Default::default()
    }
}

/// Whether `rule` grants the atomic `requested` rule
fn rule_allows(rule: &PolicyRule, requested: &PolicyRule) -> bool {
    let Some(verb) = requested.verbs.first() else {
        return true;
    };
    if !has(&rule.verbs, verb) {
        return false;
    }

    if let Some(url) = first(&requested.non_resource_urls) {
        return rule
            .non_resource_urls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|allowed| url_matches(allowed, url));
    }

    let (Some(group), Some(resource)) = (first(&requested.api_groups), first(&requested.resources))
    else {
        return false;
    };

    let groups = rule.api_groups.as_deref().unwrap_or_default();
    if !has(groups, group) {
        return false;
    }

    let resources = rule.resources.as_deref().unwrap_or_default();
    if !resources.iter().any(|allowed| resource_matches(allowed, resource)) {
        return false;
    }

    let names = rule.resource_names.as_deref().unwrap_or_default();
    if names.is_empty() {
        return true;
    }
    first(&requested.resource_names).is_some_and(|name| names.iter().any(|n| n == name))
}

fn first(values: &Option<Vec<String>>) -> Option<&str> {
    values.as_ref()?.first().map(String::as_str)
}

fn has(values: &[String], value: &str) -> bool {
    values.iter().any(|v| v == WILDCARD || v == value)
}

/// `*`, exact match, `pods/*` for any pods subresource, `*/status` for any status subresource
fn resource_matches(allowed: &str, requested: &str) -> bool {
    if allowed == WILDCARD || allowed == requested {
        return true;
    }
    let Some((resource, subresource)) = requested.split_once('/') else {
        return false;
    };
    allowed == format!("{}/*", resource) || allowed == format!("*/{}", subresource)
}

fn url_matches(allowed: &str, requested: &str) -> bool {
    if allowed == WILDCARD || allowed == requested {
        return true;
    }
    allowed
        .strip_suffix('*')
        .is_some_and(|prefix| requested.starts_with(prefix))
}
