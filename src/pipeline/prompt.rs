//! Prompt construction with a hard character budget.
//!
//! The headers and attachments are always sent whole; the body gets whatever
//! room the budget leaves and is hard-cut to fit. Lengths are in chars.

use tracing::{error, warn};

use crate::error::BudgetOverrunError;
use crate::pipeline::types::StructuredEmail;

/// Classification prompt. Placeholders: `{headers}`, `{body}`, `{attachments}`.
pub const PROMPT_TEMPLATE: &str = r#"Hi, I like you to check and score an email based on the following structured data. Please respond as a single, clean JSON object with the specified properties.

### Email Headers
```json
{headers}
```

### Email Body (converted from HTML to plain text)
```text
{body}
```

### Attachments
```json
{attachments}
```

### INSTRUCTIONS
Based on the data above, please populate the following JSON object:
- sender: simply extract 'from'
- sender_consistent: check if from fields is consistent with headers and is not trying to spool identity
- spf_pass: (boolean) check if there is positive verification in spf headers (leave null if no information is available or for spf-soft fail with ~all)
- dkim_pass: (boolean) check if there is positive verification in dkim headers (leave null if no information is available)
- is_advertise: (boolean) check if email is advertising something and contains an offer
- is_business_approach: (boolean) check if email is a cold sales/business approach (or next message in the approach process where sender reply to self to refresh the approach in the mailbox). Consider typical sales and lead generation scenarios.
- is_personal_approach: (boolean) check if this is non-sales scenario approach from someone who likes to contact in a non-business context.
- is_service_important: (boolean) check if email contains important information related to service: bill, password reset, login link, 2fa code, expiration notice. Consider common services like electricity, bank account, netflix, or similar subscription service
- is_service_not_important: (boolean) check if email contains non critical information from service - like: daily posts update from linked in, AWS invitation for conference, cross sale, tips how to use product, surveys, new offers
- is_scam: (boolean) check if the mail sounds like a scam
- has_calendar_invite: (boolean) check if the mail has invitation to the call or meeting (with calendar appointment attached)
"#;

const HEADERS_PLACEHOLDER: &str = "{headers}";
const BODY_PLACEHOLDER: &str = "{body}";
const ATTACHMENTS_PLACEHOLDER: &str = "{attachments}";

/// A built prompt plus what had to be cut to fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    /// Original body length in chars when the body was truncated.
    pub body_truncated: Option<usize>,
    /// Set when the frame alone overflowed and the whole prompt was hard-cut.
    pub overrun: Option<BudgetOverrunError>,
}

impl Prompt {
    /// Length in chars.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Builds budgeted prompts from a template.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: String,
    budget: usize,
}

impl PromptBuilder {
    /// Builder over the standard template.
    pub fn new(budget: usize) -> Self {
        Self::with_template(PROMPT_TEMPLATE, budget)
    }

    pub fn with_template(template: impl Into<String>, budget: usize) -> Self {
        Self {
            template: template.into(),
            budget,
        }
    }

    /// Render `email` into the template without exceeding the budget.
    pub fn build(&self, email: &StructuredEmail) -> Prompt {
        let headers_json = to_pretty_json(&email.headers);
        let attachments_json = to_pretty_json(&email.attachments);

        let frame_size = render(&self.template, &headers_json, "", &attachments_json)
            .chars()
            .count();
        let max_body_len = self.budget.saturating_sub(frame_size);

        let body_len = email.body.chars().count();
        let (body, body_truncated) = if body_len > max_body_len {
            warn!(body_len, max_body_len, "Body exceeds remaining prompt space, truncating");
            (truncate_chars(&email.body, max_body_len), Some(body_len))
        } else {
            (email.body.as_str(), None)
        };

        let text = render(&self.template, &headers_json, body, &attachments_json);

        if frame_size + body.chars().count() > self.budget {
            let overrun = BudgetOverrunError {
                frame_size,
                budget: self.budget,
            };
            error!(
                frame_size,
                budget = self.budget,
                "Prompt still too long after body truncation, performing hard cut"
            );
            return Prompt {
                text: truncate_chars(&text, self.budget).to_string(),
                body_truncated,
                overrun: Some(overrun),
            };
        }

        Prompt {
            text,
            body_truncated,
            overrun: None,
        }
    }
}

fn to_pretty_json<T: serde::Serialize>(value: &T) -> String {
    // Headers and attachment metadata are plain strings and numbers.
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

/// Substitute the first occurrence of each placeholder in one pass over the
/// template. Inserted values are never scanned for placeholders.
fn render(template: &str, headers: &str, body: &str, attachments: &str) -> String {
    let mut slots: [(&str, &str, bool); 3] = [
        (HEADERS_PLACEHOLDER, headers, false),
        (BODY_PLACEHOLDER, body, false),
        (ATTACHMENTS_PLACEHOLDER, attachments, false),
    ];
    let mut out = String::with_capacity(template.len() + headers.len() + body.len() + attachments.len());
    let mut rest = template;

    loop {
        let next = slots
            .iter()
            .enumerate()
            .filter(|(_, (_, _, used))| !*used)
            .filter_map(|(i, (ph, _, _))| rest.find(*ph).map(|pos| (pos, i)))
            .min();

        let Some((pos, i)) = next else {
            out.push_str(rest);
            return out;
        };

        let (placeholder, value, _) = slots[i];
        out.push_str(&rest[..pos]);
        out.push_str(value);
        rest = &rest[pos + placeholder.len()..];
        slots[i].2 = true;
    }
}

/// First `max` chars of `s`.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
