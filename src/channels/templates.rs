//! Instruction templates handed to the reasoning agent.
//!
//! Every kind has a built-in template. A `<kind>.md` file in the configured
//! templates directory replaces it. Placeholders use `{{name}}` syntax.

use std::path::PathBuf;

use tokio::fs;
use tracing::debug;

use super::kind::ChannelKind;
use crate::error::DispatchError;

const EMAIL_TEMPLATE: &str = r#"You are triaging one inbound email for a human operator.

Read the task file:
  {{task_path}}

Write a short plan to:
  {{plan_path}}

If the email deserves a reply, create an approval file at:
  {{approval_path}}

using exactly this layout:

---
type: email_action
action: send_reply
to: "<recipient address>"
subject: "Re: <original subject>"
source_task: "{{task_name}}"
status: pending_approval
---

# Proposed Reply

<reply text>

If no reply is warranted (newsletters, notifications, spam), do not create
the approval file. Never send anything yourself.
"#;

const DM_TEMPLATE: &str = r#"You are handling one direct message on {{channel}} for a human operator.

Read the task file:
  {{task_path}}

Write a short plan to:
  {{plan_path}}

If the message deserves a response, create an approval file at:
  {{approval_path}}

using exactly this layout:

---
type: {{approval_type}}
thread_id: "<thread_id from the task>"
thread_url: "<thread_url from the task>"
actions: ["reply"]
source_task: "{{task_name}}"
status: pending_approval
---

## Action 1: Reply

<reply text>

Add "like" to the actions list only when the message is friendly and a like
is appropriate. If nothing should be done, do not create the approval file.
Never send anything yourself.
"#;

const TWEET_TEMPLATE: &str = r#"You are reviewing one post on X for engagement.

Read the task file:
  {{task_path}}

Write a short plan to:
  {{plan_path}}

If engagement is worthwhile, create an approval file at:
  {{approval_path}}

using exactly this layout:

---
type: tweet_action
tweet_id: "<tweet_id from the task>"
author: "<author handle>"
actions: ["reply", "like"]
source_task: "{{task_name}}"
status: pending_approval
---

## Action 1: Reply

<reply text, at most 280 characters>

Choose any of "reply", "like", "retweet" for the actions list, or "ignore"
when the post is not worth engaging with. Only include a reply section when
"reply" is listed. Never post anything yourself.
"#;

const LINKEDIN_TEMPLATE: &str = r#"You are reviewing one LinkedIn feed post for engagement.

Read the task file:
  {{task_path}}

Write a short plan to:
  {{plan_path}}

If engagement is worthwhile, create an approval file at:
  {{approval_path}}

using exactly this layout:

---
type: linkedin_action
post_id: "<post_id from the task>"
post_urn: "<post_urn from the task, if present>"
author: "<author name>"
actions: ["comment", "like"]
source_task: "{{task_name}}"
status: pending_approval
---

## Action 1: Comment

<comment text>

Choose any of "comment", "like" for the actions list, or "ignore" when the
post is not worth engaging with. Never post anything yourself.
"#;

const CONTENT_DRAFT_TEMPLATE: &str = r#"You are drafting one original LinkedIn post for a human to review.

Create exactly one file at:
  {{approval_path}}

using exactly this layout:

---
type: linkedin_post_action
source_task: "scheduled_post"
status: pending_approval
---

# Proposed LinkedIn Post

<150 to 300 words on a practical software topic. Open with a strong first
line, keep paragraphs short, use no markdown headings, and end with a
question for readers.>

Do not read other files. Do not publish anything.
"#;

const LEDGER_TEMPLATE: &str = r#"You are reviewing one accounting event (a sale order or an invoice).

Read the task file:
  {{task_path}}

Write a short plan to:
  {{plan_path}}

If the event needs a follow-up with the customer, create an approval file at:
  {{approval_path}}

using exactly this layout:

---
type: ledger_action
record_ref: "<reference from the task>"
partner: "<partner name from the task>"
actions: ["follow_up"]
source_task: "{{task_name}}"
status: pending_approval
---

# Proposed Follow-up

<follow-up message>

If nothing needs to happen, do not create the approval file.
"#;

/// Built-in template for a kind.
pub fn builtin(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Email => EMAIL_TEMPLATE,
        ChannelKind::FacebookDm | ChannelKind::InstagramDm => DM_TEMPLATE,
        ChannelKind::Tweet => TWEET_TEMPLATE,
        ChannelKind::LinkedinPost => LINKEDIN_TEMPLATE,
        ChannelKind::ContentDraft => CONTENT_DRAFT_TEMPLATE,
        ChannelKind::LedgerEvent => LEDGER_TEMPLATE,
    }
}

/// Template lookup with optional on-disk overrides.
#[derive(Debug, Clone, Default)]
pub struct Templates {
    overrides_dir: Option<PathBuf>,
}

impl Templates {
    pub fn new(overrides_dir: Option<PathBuf>) -> Self {
        Self { overrides_dir }
    }

    /// Load the template for `kind`, preferring `<overrides_dir>/<kind>.md`.
    pub async fn load(&self, kind: ChannelKind) -> Result<String, DispatchError> {
        if let Some(dir) = &self.overrides_dir {
            let path = dir.join(format!("{}.md", kind.as_str()));
            match fs::read_to_string(&path).await {
                Ok(text) => {
                    debug!(kind = %kind, path = %path.display(), "Using template override");
                    return Ok(text);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(DispatchError::Template {
                        kind: kind.to_string(),
                        reason: format!("{}: {e}", path.display()),
                    });
                }
            }
        }
        Ok(builtin(kind).to_string())
    }
}

/// Substitute `{{name}}` placeholders. Unknown placeholders are left as is.
pub fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}
