//! `[[[field]]]` placeholder substitution in message title and body.

use std::collections::HashMap;
use std::sync::LazyLock;

use pushfan_core::PushMessage;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[\[([^\]]+)\]\]\]").expect("placeholder pattern is valid")
});

/// Per-visitor field values for personalized sends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldReplacements {
    #[serde(default)]
    pub values: HashMap<String, String>,
    /// When set, a placeholder without a value makes the target undeliverable
    /// instead of being rendered empty.
    #[serde(default)]
    pub replacement_is_mandatory: bool,
}

impl FieldReplacements {
    pub fn new(values: HashMap<String, String>, replacement_is_mandatory: bool) -> Self {
        Self {
            values,
            replacement_is_mandatory,
        }
    }
}

/// Result of personalizing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Personalization {
    /// Content had no placeholders.
    Unchanged,
    Rendered(PushMessage),
    /// Mandatory replacement requested and these fields have no value.
    Unresolved(Vec<String>),
}

/// Returns true when title or body contains at least one placeholder.
pub fn has_placeholders(message: &PushMessage) -> bool {
    PLACEHOLDER.is_match(&message.title) || PLACEHOLDER.is_match(&message.body)
}

/// Substitutes placeholders in title and body.
pub fn personalize(message: &PushMessage, replacements: &FieldReplacements) -> Personalization {
    if !has_placeholders(message) {
        return Personalization::Unchanged;
    }

    if replacements.replacement_is_mandatory {
        let mut missing: Vec<String> = [&message.title, &message.body]
            .into_iter()
            .flat_map(|text| PLACEHOLDER.captures_iter(text))
            .map(|caps| caps[1].trim().to_string())
            .filter(|field| lookup(&replacements.values, field).is_none())
            .collect();
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Personalization::Unresolved(missing);
        }
    }

    let mut rendered = message.clone();
    rendered.title = render(&message.title, &replacements.values);
    rendered.body = render(&message.body, &replacements.values);
    Personalization::Rendered(rendered)
}

fn render(text: &str, values: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures<'_>| {
            lookup(values, caps[1].trim()).unwrap_or_default().to_string()
        })
        .into_owned()
}

/// Field names match case-insensitively.
fn lookup<'a>(values: &'a HashMap<String, String>, field: &str) -> Option<&'a str> {
    values
        .get(field)
        .or_else(|| {
            values
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(field))
                .map(|(_, v)| v)
        })
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn message(title: &str, body: &str) -> PushMessage {
        PushMessage {
            message_id: Uuid::new_v4(),
            domain: "example.com".into(),
            title: title.into(),
            body: body.into(),
            on_click_link: None,
            image_url: None,
        }
    }

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plain_content_is_unchanged() {
        let msg = message("Sale", "Everything must go");
        assert_eq!(
            personalize(&msg, &FieldReplacements::new(HashMap::new(), true)),
            Personalization::Unchanged
        );
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let msg = message("Hi [[[firstName]]]", "Your [[[ Plan ]]] renews soon");
        let reps = FieldReplacements::new(values(&[("firstName", "Ada"), ("plan", "Pro")]), true);

        match personalize(&msg, &reps) {
            Personalization::Rendered(r) => {
                assert_eq!(r.title, "Hi Ada");
                assert_eq!(r.body, "Your Pro renews soon");
                assert_eq!(r.message_id, msg.message_id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_mandatory_missing_field_is_unresolved() {
        let msg = message("Hi [[[firstName]]]", "[[[city]]] and [[[city]]]");
        let reps = FieldReplacements::new(values(&[("firstName", "Ada")]), true);
        assert_eq!(
            personalize(&msg, &reps),
            Personalization::Unresolved(vec!["city".to_string()])
        );
    }

    #[test]
    fn test_optional_missing_field_renders_empty() {
        let msg = message("Hi [[[firstName]]]!", "body");
        match personalize(&msg, &FieldReplacements::default()) {
            Personalization::Rendered(r) => assert_eq!(r.title, "Hi !"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_brackets_without_placeholder_syntax_are_ignored() {
        assert!(!has_placeholders(&message("[[x]] and [[[]]]", "[ [ [y] ] ]")));
    }
}
