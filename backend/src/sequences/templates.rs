// Template rendering - merge-field substitution for message bodies and subjects

use regex::Regex;
use std::collections::HashMap;

use super::{Sequence, SequenceRun};

/// Flat token -> value map used to resolve `{{token}}` merge fields.
#[derive(Debug, Clone, Default)]
pub struct MergeContext {
    values: HashMap<String, String>,
}

impl MergeContext {
    /// Build the merge context for one run: contact identity fields, the
    /// triggering event, the sequence name, and a flattened projection of any
    /// nested context objects (e.g. `shipping.postalCode` ->
    /// `shipping_postal_code`).
    pub fn from_run(run: &SequenceRun, sequence: &Sequence) -> Self {
        let mut ctx = Self::default();

        flatten_into(&mut ctx.values, "", &run.payload);

        let first = ctx.get("first_name").unwrap_or_default();
        let last = ctx.get("last_name").unwrap_or_default();
        let full = format!("{} {}", first, last).trim().to_string();
        ctx.values.insert("full_name".to_string(), full);

        ctx.values
            .insert("trigger_event".to_string(), run.trigger_event.clone());
        ctx.values
            .insert("sequence_name".to_string(), sequence.name.clone());

        ctx
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    /// Replace `{{token}}` placeholders in `template`. Unresolved tokens are
    /// left intact verbatim so broken merge fields stay visible to authors.
    pub fn render(&self, template: &str) -> String {
        let re = Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap();
        let mut result = template.to_string();

        for cap in re.captures_iter(template) {
            if let Some(value) = self.values.get(&cap[1]) {
                result = result.replace(&cap[0], value);
            }
        }

        result
    }

    #[cfg(test)]
    pub fn with_values(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

/// Recursively flatten a json object into snake_case, underscore-joined keys.
/// Scalars stringify; null and array values are dropped.
fn flatten_into(out: &mut HashMap<String, String>, prefix: &str, value: &serde_json::Value) {
    let serde_json::Value::Object(map) = value else {
        return;
    };

    for (key, val) in map {
        let key = if prefix.is_empty() {
            to_snake_case(key)
        } else {
            format!("{}_{}", prefix, to_snake_case(key))
        };

        match val {
            serde_json::Value::Object(_) => flatten_into(out, &key, val),
            serde_json::Value::String(s) => {
                out.insert(key, s.clone());
            }
            serde_json::Value::Number(n) => {
                out.insert(key, n.to_string());
            }
            serde_json::Value::Bool(b) => {
                out.insert(key, b.to_string());
            }
            _ => {}
        }
    }
}

fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, ch) in s.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequences::{RunStatus, SequenceStatus};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_run(payload: serde_json::Value) -> SequenceRun {
        SequenceRun {
            id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            clinic_id: Uuid::new_v4(),
            trigger_event: "checkout_completed".to_string(),
            status: RunStatus::Pending,
            payload,
            current_step_index: 0,
            emails_sent: 0,
            sms_sent: 0,
            emails_opened: 0,
            emails_clicked: 0,
            started_at: None,
            completed_at: None,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    fn sample_sequence(name: &str) -> Sequence {
        Sequence {
            id: Uuid::new_v4(),
            clinic_id: Uuid::new_v4(),
            name: name.to_string(),
            status: SequenceStatus::Active,
            trigger_event: "checkout_completed".to_string(),
            steps: json!([]),
            stats: json!({}),
            stats_refreshed_at: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_context_includes_identity_and_event_fields() {
        let run = sample_run(json!({
            "first_name": "Ada",
            "last_name": "Lovelace",
            "email": "ada@example.com",
            "phone": "+15551230000"
        }));
        let ctx = MergeContext::from_run(&run, &sample_sequence("Post-checkout care"));

        assert_eq!(ctx.get("first_name").as_deref(), Some("Ada"));
        assert_eq!(ctx.get("full_name").as_deref(), Some("Ada Lovelace"));
        assert_eq!(ctx.get("email").as_deref(), Some("ada@example.com"));
        assert_eq!(ctx.get("trigger_event").as_deref(), Some("checkout_completed"));
        assert_eq!(ctx.get("sequence_name").as_deref(), Some("Post-checkout care"));
    }

    #[test]
    fn test_nested_objects_flatten_to_snake_case() {
        let run = sample_run(json!({
            "first_name": "Ada",
            "shipping": {
                "postalCode": "94103",
                "address": {"streetName": "Market St"}
            },
            "orderTotal": 42.5
        }));
        let ctx = MergeContext::from_run(&run, &sample_sequence("s"));

        assert_eq!(ctx.get("shipping_postal_code").as_deref(), Some("94103"));
        assert_eq!(
            ctx.get("shipping_address_street_name").as_deref(),
            Some("Market St")
        );
        assert_eq!(ctx.get("order_total").as_deref(), Some("42.5"));
    }

    #[test]
    fn test_render_replaces_known_tokens() {
        let mut values = HashMap::new();
        values.insert("first_name".to_string(), "Ada".to_string());
        let ctx = MergeContext::with_values(values);

        assert_eq!(ctx.render("Hi {{first_name}}!"), "Hi Ada!");
        assert_eq!(ctx.render("Hi {{ first_name }}!"), "Hi Ada!");
    }

    #[test]
    fn test_unresolved_tokens_left_verbatim() {
        let ctx = MergeContext::with_values(HashMap::new());
        assert_eq!(
            ctx.render("Hi {{first_name}}, your {{order_id}} shipped"),
            "Hi {{first_name}}, your {{order_id}} shipped"
        );
    }

    #[test]
    fn test_full_name_trims_when_partial() {
        let run = sample_run(json!({"first_name": "Ada"}));
        let ctx = MergeContext::from_run(&run, &sample_sequence("s"));
        assert_eq!(ctx.get("full_name").as_deref(), Some("Ada"));
    }
}
