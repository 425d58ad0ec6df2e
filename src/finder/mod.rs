//! Heuristic login form discovery.
//!
//! Each field (username, password, submit button) is scored independently
//! over the parsed page. Every scoring rule is expressed as a generated
//! locator; an element collects the score of a locator at most once, so the
//! same evidence reached through two aliases is not counted twice.
//!
//! Candidates are ranked by total score (ties keep discovery order) and the
//! first one the driver reports as visible wins.

pub mod dom;

use std::collections::HashMap;

use crate::driver::{CapabilityDriver, DriverError};
use crate::model::{Field, Locators};

use self::dom::{Document, NodeId};

/// Bonus for elements inside a `<form>`.
const FORM_BONUS: u32 = 100;
/// Bonus for elements labelled by nearby text.
const LABEL_BONUS: u32 = 2;

#[derive(Debug, Clone, Copy)]
enum Property {
    Attr(&'static str),
    Text,
}

struct FieldRules {
    tags: &'static [(&'static str, u32)],
    aliases: &'static [&'static str],
    types: &'static [(&'static str, u32)],
    properties: &'static [(Property, u32)],
}

const INPUT_PROPERTIES: &[(Property, u32)] = &[
    (Property::Attr("name"), 10),
    (Property::Attr("id"), 10),
    (Property::Attr("class"), 2),
    (Property::Attr("autocomplete"), 10),
    (Property::Attr("placeholder"), 3),
];

const USERNAME_RULES: FieldRules = FieldRules {
    tags: &[("input", 8)],
    aliases: &["email", "e-mail", "username", "user", "uid"],
    types: &[("email", 10), ("text", 1)],
    properties: INPUT_PROPERTIES,
};

const PASSWORD_RULES: FieldRules = FieldRules {
    tags: &[("input", 8)],
    aliases: &["password", "pwd"],
    types: &[("password", 10), ("text", 1)],
    properties: INPUT_PROPERTIES,
};

const SUBMIT_RULES: FieldRules = FieldRules {
    tags: &[("button", 8), ("input", 8), ("div", 1)],
    aliases: &["login", "log in", "log-in", "signin", "sign in", "sign-in", "submit"],
    types: &[("submit", 30), ("button", 10)],
    properties: &[
        (Property::Attr("name"), 10),
        (Property::Attr("id"), 10),
        (Property::Attr("class"), 2),
        (Property::Attr("value"), 3),
        (Property::Text, 10),
    ],
};

fn rules_for(field: Field) -> &'static FieldRules {
    match field {
        Field::Username => &USERNAME_RULES,
        Field::Password => &PASSWORD_RULES,
        Field::SubmitButton => &SUBMIT_RULES,
    }
}

/// A scored element together with the locators that contributed to it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: NodeId,
    pub score: u32,
    pub evidence: Vec<String>,
}

#[derive(Default)]
struct Scoring {
    candidates: Vec<Candidate>,
    by_node: HashMap<NodeId, usize>,
}

impl Scoring {
    fn add(&mut self, node: NodeId, locator: &str, score: u32) {
        match self.by_node.get(&node) {
            Some(&slot) => {
                let candidate = &mut self.candidates[slot];
                if candidate.evidence.iter().any(|l| l == locator) {
                    return;
                }
                candidate.evidence.push(locator.to_string());
                candidate.score += score;
            }
            None => {
                self.by_node.insert(node, self.candidates.len());
                self.candidates.push(Candidate {
                    node,
                    score,
                    evidence: vec![locator.to_string()],
                });
            }
        }
    }

    /// Score every element `locator` selects.
    fn add_matches(&mut self, doc: &Document, locator: &str, score: u32) {
        match doc.select(locator) {
            Ok(nodes) => {
                for node in nodes {
                    self.add(node, locator, score);
                }
            }
            Err(e) => tracing::trace!(%locator, error = %e, "skipping unusable locator"),
        }
    }

    fn retain(&mut self, keep: impl Fn(&Candidate) -> bool) {
        self.candidates.retain(keep);
        self.by_node = self
            .candidates
            .iter()
            .enumerate()
            .map(|(slot, c)| (c.node, slot))
            .collect();
    }

    fn into_ranked(mut self) -> Vec<Candidate> {
        // Stable sort: equal scores keep discovery order.
        self.candidates.sort_by(|a, b| b.score.cmp(&a.score));
        self.candidates
    }
}

fn mentions_alias(text: Option<&str>, aliases: &[&str]) -> bool {
    text.map(str::to_lowercase)
        .is_some_and(|t| aliases.iter().any(|alias| t.contains(alias)))
}

fn score_properties(doc: &Document, tag: &str, rules: &FieldRules, scoring: &mut Scoring) {
    let elements = doc.elements_by_tag(tag);
    for alias in rules.aliases {
        for (property, score) in rules.properties {
            for &element in &elements {
                let value = match property {
                    Property::Attr(name) => doc.attr(element, name),
                    Property::Text => doc.own_text(element),
                };
                let Some(value) = value else { continue };
                if !value.to_lowercase().contains(alias) {
                    continue;
                }
                // A quote would break out of the generated string literal.
                if value.contains('\'') || value.contains('"') {
                    continue;
                }
                let locator = match property {
                    Property::Attr(name) => format!("//{tag}[@{name} = '{value}']"),
                    Property::Text => format!("//{tag}[text() = '{value}']"),
                };
                scoring.add_matches(doc, &locator, *score);
            }
        }
    }
}

/// Climb from `node` while the enclosing element still contains no other
/// `tag` element, then look for alias text in that container and its
/// direct children.
fn score_label_text(doc: &Document, tag: &str, aliases: &[&str], scoring: &mut Scoring) {
    for (i, node) in doc.elements_by_tag(tag).into_iter().enumerate() {
        let Some(mut container) = doc.parent_element(node) else {
            continue;
        };
        while let Some(outer) = doc.parent_element(container) {
            let siblings = doc
                .descendants(outer)
                .into_iter()
                .filter(|d| doc.tag(*d) == Some(tag))
                .count();
            if siblings > 1 {
                break;
            }
            container = outer;
        }

        let labelled = mentions_alias(doc.own_text(container), aliases)
            || doc
                .element_children(container)
                .any(|child| mentions_alias(doc.own_text(child), aliases));
        if labelled {
            scoring.add_matches(doc, &format!("(//{tag})[{}]", i + 1), LABEL_BONUS);
        }
    }
}

fn is_marked_hidden(doc: &Document, node: NodeId) -> bool {
    doc.has_attr(node, "hidden") || doc.attr(node, "type") == Some("hidden")
}

/// Rank every candidate element for `field`, best first.
pub fn rank(doc: &Document, field: Field) -> Vec<Candidate> {
    let rules = rules_for(field);
    let mut scoring = Scoring::default();

    for (tag, score) in rules.tags {
        scoring.add_matches(doc, &format!("//{tag}"), *score);
    }
    for (tag, _) in rules.tags {
        for (kind, score) in rules.types {
            scoring.add_matches(doc, &format!("//{tag}[@type='{kind}']"), *score);
        }
        score_properties(doc, tag, rules, &mut scoring);
        score_label_text(doc, tag, rules.aliases, &mut scoring);
    }

    scoring.retain(|c| !is_marked_hidden(doc, c.node));

    let in_form: Vec<NodeId> = scoring
        .candidates
        .iter()
        .map(|c| c.node)
        .filter(|node| doc.ancestors(*node).any(|a| doc.tag(a) == Some("form")))
        .collect();
    for node in in_form {
        scoring.add(node, &doc.absolute_path(node), FORM_BONUS);
    }

    scoring.into_ranked()
}

/// Finds login form fields on the page a driver currently shows.
pub struct LoginFormFinder<'a> {
    driver: &'a dyn CapabilityDriver,
}

impl<'a> LoginFormFinder<'a> {
    pub fn new(driver: &'a dyn CapabilityDriver) -> Self {
        Self { driver }
    }

    /// Snapshot the current page and locate every field. Fields that could
    /// not be found are left `None`.
    pub async fn find(&self) -> Result<Locators, DriverError> {
        let html = self.driver.get_page_html().await?;
        let doc = Document::parse(&html);
        self.find_in(&doc).await
    }

    pub async fn find_in(&self, doc: &Document) -> Result<Locators, DriverError> {
        let mut locators = Locators::default();
        for field in Field::ALL {
            let found = self.first_visible(doc, rank(doc, field)).await?;
            tracing::debug!(?field, locator = ?found, "form field search finished");
            locators.set(field, found);
        }
        Ok(locators)
    }

    async fn first_visible(
        &self,
        doc: &Document,
        ranked: Vec<Candidate>,
    ) -> Result<Option<String>, DriverError> {
        for candidate in ranked {
            let locator = doc.absolute_path(candidate.node);
            if self.driver.is_element_visible(&locator).await? {
                return Ok(Some(locator));
            }
            tracing::trace!(%locator, score = candidate.score, "best candidate not visible");
        }
        Ok(None)
    }
}
