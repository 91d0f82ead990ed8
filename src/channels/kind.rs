//! Channel registry.
//!
//! A task's frontmatter `type` resolves to exactly one [`ChannelKind`]; an
//! unrecognized type resolves to nothing and is never routed to a default.
//! Each kind fixes its approval prefix, its approval `type`, its priority
//! category, the quota [`Channel`] it spends, and the table of action kinds
//! it may request.

use std::fmt;

use serde::{Deserialize, Serialize};

/// External platform that owns a quota counter and a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Facebook,
    Instagram,
    X,
    #[serde(rename = "linkedin")]
    LinkedIn,
    Ledger,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Email,
        Channel::Facebook,
        Channel::Instagram,
        Channel::X,
        Channel::LinkedIn,
        Channel::Ledger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Facebook => "facebook",
            Self::Instagram => "instagram",
            Self::X => "x",
            Self::LinkedIn => "linkedin",
            Self::Ledger => "ledger",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ReplyNeeded,
    SocialEngagement,
    ContentDraft,
    LedgerEvent,
}

/// A single thing the executor can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Reply,
    Like,
    Retweet,
    Comment,
    Post,
    FollowUp,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Like => "like",
            Self::Retweet => "retweet",
            Self::Comment => "comment",
            Self::Post => "post",
            Self::FollowUp => "follow_up",
        }
    }

    /// Parse an entry of an approval's `actions` list.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "reply" => Some(Self::Reply),
            "like" => Some(Self::Like),
            "retweet" | "repost" => Some(Self::Retweet),
            "comment" => Some(Self::Comment),
            "post" => Some(Self::Post),
            "follow_up" | "followup" => Some(Self::FollowUp),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the executor's content for an action lives in the approval body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    /// The action carries no text (likes, retweets).
    None,
    /// A top-level heading such as `# Proposed Reply`.
    Section(&'static str),
    /// A numbered heading such as `## Action 1: Reply`.
    ActionSection(&'static str),
}

/// One row of a kind's action table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSpec {
    pub action: ActionKind,
    /// A failed critical action fails the whole dispatch.
    pub critical: bool,
    pub content: ContentSource,
}

const fn spec(action: ActionKind, critical: bool, content: ContentSource) -> ActionSpec {
    ActionSpec {
        action,
        critical,
        content,
    }
}

const EMAIL_ACTIONS: &[ActionSpec] = &[spec(
    ActionKind::Reply,
    true,
    ContentSource::Section("Proposed Reply"),
)];

const DM_ACTIONS: &[ActionSpec] = &[
    spec(ActionKind::Reply, true, ContentSource::ActionSection("Reply")),
    spec(ActionKind::Like, false, ContentSource::None),
];

const TWEET_ACTIONS: &[ActionSpec] = &[
    spec(ActionKind::Reply, true, ContentSource::ActionSection("Reply")),
    spec(ActionKind::Like, false, ContentSource::None),
    spec(ActionKind::Retweet, false, ContentSource::None),
];

const LINKEDIN_ACTIONS: &[ActionSpec] = &[
    spec(ActionKind::Comment, true, ContentSource::ActionSection("Comment")),
    spec(ActionKind::Like, false, ContentSource::None),
];

const CONTENT_DRAFT_ACTIONS: &[ActionSpec] = &[spec(
    ActionKind::Post,
    true,
    ContentSource::Section("Proposed LinkedIn Post"),
)];

const LEDGER_ACTIONS: &[ActionSpec] = &[spec(
    ActionKind::FollowUp,
    true,
    ContentSource::Section("Proposed Follow-up"),
)];

/// Kind of work item, fixed when the listener writes the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    FacebookDm,
    InstagramDm,
    Tweet,
    LinkedinPost,
    ContentDraft,
    LedgerEvent,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 7] = [
        ChannelKind::Email,
        ChannelKind::FacebookDm,
        ChannelKind::InstagramDm,
        ChannelKind::Tweet,
        ChannelKind::LinkedinPost,
        ChannelKind::ContentDraft,
        ChannelKind::LedgerEvent,
    ];

    /// Resolve a task's frontmatter `type`. A missing type is an email.
    pub fn from_task_type(task_type: Option<&str>) -> Option<Self> {
        let Some(raw) = task_type.map(str::trim).filter(|t| !t.is_empty()) else {
            return Some(Self::Email);
        };
        match raw.to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "facebook_dm" => Some(Self::FacebookDm),
            "instagram_dm" => Some(Self::InstagramDm),
            "tweet" | "watchlist" => Some(Self::Tweet),
            "linkedin_post" => Some(Self::LinkedinPost),
            "odoo_event" => Some(Self::LedgerEvent),
            _ => None,
        }
    }

    /// Resolve an approval's frontmatter `type`.
    pub fn from_approval_type(approval_type: &str) -> Option<Self> {
        let wanted = approval_type.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.approval_type().eq_ignore_ascii_case(wanted))
    }

    /// Resolve the kind encoded in a derived approval filename.
    ///
    /// Content drafts are `ACTION_LINKEDIN_POST_<timestamp>.md`. Any other
    /// name under that prefix is a LinkedIn engagement approval for a task
    /// whose own name starts with `POST_`.
    pub fn from_approval_name(name: &str) -> Option<Self> {
        if let Some(rest) = name.strip_prefix(Self::ContentDraft.approval_prefix()) {
            if is_timestamp_name(rest) {
                return Some(Self::ContentDraft);
            }
        }
        Self::ALL
            .into_iter()
            .filter(|k| *k != Self::ContentDraft && name.starts_with(k.approval_prefix()))
            .max_by_key(|k| k.approval_prefix().len())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::FacebookDm => "facebook_dm",
            Self::InstagramDm => "instagram_dm",
            Self::Tweet => "tweet",
            Self::LinkedinPost => "linkedin_post",
            Self::ContentDraft => "content_draft",
            Self::LedgerEvent => "ledger_event",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Self::Email | Self::FacebookDm | Self::InstagramDm => Category::ReplyNeeded,
            Self::Tweet | Self::LinkedinPost => Category::SocialEngagement,
            Self::ContentDraft => Category::ContentDraft,
            Self::LedgerEvent => Category::LedgerEvent,
        }
    }

    /// Quota and session channel.
    pub fn channel(&self) -> Channel {
        match self {
            Self::Email => Channel::Email,
            Self::FacebookDm => Channel::Facebook,
            Self::InstagramDm => Channel::Instagram,
            Self::Tweet => Channel::X,
            Self::LinkedinPost | Self::ContentDraft => Channel::LinkedIn,
            Self::LedgerEvent => Channel::Ledger,
        }
    }

    pub fn approval_prefix(&self) -> &'static str {
        match self {
            Self::Email => "REPLY_",
            Self::FacebookDm => "ACTION_FACEBOOK_",
            Self::InstagramDm => "ACTION_INSTAGRAM_",
            Self::Tweet => "ACTION_TWEET_",
            Self::LinkedinPost => "ACTION_LINKEDIN_",
            Self::ContentDraft => "ACTION_LINKEDIN_POST_",
            Self::LedgerEvent => "ACTION_LEDGER_",
        }
    }

    pub fn approval_type(&self) -> &'static str {
        match self {
            Self::Email => "email_action",
            Self::FacebookDm => "facebook_action",
            Self::InstagramDm => "instagram_action",
            Self::Tweet => "tweet_action",
            Self::LinkedinPost => "linkedin_action",
            Self::ContentDraft => "linkedin_post_action",
            Self::LedgerEvent => "ledger_action",
        }
    }

    /// Action table: which actions this kind may request and how each
    /// failure is classified.
    pub fn actions(&self) -> &'static [ActionSpec] {
        match self {
            Self::Email => EMAIL_ACTIONS,
            Self::FacebookDm | Self::InstagramDm => DM_ACTIONS,
            Self::Tweet => TWEET_ACTIONS,
            Self::LinkedinPost => LINKEDIN_ACTIONS,
            Self::ContentDraft => CONTENT_DRAFT_ACTIONS,
            Self::LedgerEvent => LEDGER_ACTIONS,
        }
    }

    pub fn action_spec(&self, action: ActionKind) -> Option<&'static ActionSpec> {
        self.actions().iter().find(|s| s.action == action)
    }

    /// Approval filename derived from a task filename.
    pub fn approval_name(&self, task_name: &str) -> String {
        format!("{}{}", self.approval_prefix(), task_name)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `YYYYMMDD_HHMMSS`, with or without a `.md` extension.
fn is_timestamp_name(name: &str) -> bool {
    let stem = name.strip_suffix(".md").unwrap_or(name);
    stem.len() == 15
        && stem
            .bytes()
            .enumerate()
            .all(|(i, b)| if i == 8 { b == b'_' } else { b.is_ascii_digit() })
}

/// Plan artifact filename for a task.
pub fn plan_name(task_name: &str) -> String {
    format!("PLAN_{task_name}")
}

/// Sort key: category priority, then filename.
pub fn priority_key(kind: Option<ChannelKind>, name: &str) -> (u8, String) {
    // Unrecognized kinds sort last; they are only archived.
    let rank = kind.map(|k| k.category() as u8).unwrap_or(u8::MAX);
    (rank, name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_resolution() {
        assert_eq!(ChannelKind::from_task_type(None), Some(ChannelKind::Email));
        assert_eq!(ChannelKind::from_task_type(Some("  ")), Some(ChannelKind::Email));
        assert_eq!(ChannelKind::from_task_type(Some("watchlist")), Some(ChannelKind::Tweet));
        assert_eq!(
            ChannelKind::from_task_type(Some("odoo_event")),
            Some(ChannelKind::LedgerEvent)
        );
        assert_eq!(ChannelKind::from_task_type(Some("carrier_pigeon")), None);
    }

    #[test]
    fn approval_name_resolution() {
        assert_eq!(
            ChannelKind::from_approval_name("ACTION_LINKEDIN_POST_20260101_120000.md"),
            Some(ChannelKind::ContentDraft)
        );
        assert_eq!(
            ChannelKind::from_approval_name("ACTION_LINKEDIN_POST_launch.md"),
            Some(ChannelKind::LinkedinPost)
        );
        assert_eq!(
            ChannelKind::from_approval_name("ACTION_LINKEDIN_POST_20260101_1200.md"),
            Some(ChannelKind::LinkedinPost)
        );
        assert_eq!(
            ChannelKind::from_approval_name("ACTION_LINKEDIN_LINKEDIN_abc.md"),
            Some(ChannelKind::LinkedinPost)
        );
        assert_eq!(
            ChannelKind::from_approval_name("REPLY_EMAIL_1.md"),
            Some(ChannelKind::Email)
        );
        assert_eq!(ChannelKind::from_approval_name("notes.md"), None);
    }

    #[test]
    fn approval_type_round_trips_every_kind() {
        for kind in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_approval_type(kind.approval_type()), Some(kind));
        }
        assert_eq!(ChannelKind::from_approval_type("fax_action"), None);
    }

    #[test]
    fn every_kind_has_exactly_one_critical_text_action() {
        for kind in ChannelKind::ALL {
            let critical: Vec<_> = kind.actions().iter().filter(|s| s.critical).collect();
            assert_eq!(critical.len(), 1, "{kind}");
            assert_ne!(critical[0].content, ContentSource::None, "{kind}");
        }
    }

    #[test]
    fn priority_orders_categories() {
        let mut items = vec![
            priority_key(Some(ChannelKind::LedgerEvent), "a.md"),
            priority_key(Some(ChannelKind::Tweet), "b.md"),
            priority_key(None, "0.md"),
            priority_key(Some(ChannelKind::Email), "z.md"),
            priority_key(Some(ChannelKind::FacebookDm), "c.md"),
        ];
        items.sort();
        let names: Vec<_> = items.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, vec!["c.md", "z.md", "b.md", "a.md", "0.md"]);
    }

    #[test]
    fn action_parsing() {
        assert_eq!(ActionKind::parse("Reply"), Some(ActionKind::Reply));
        assert_eq!(ActionKind::parse("follow-up"), Some(ActionKind::FollowUp));
        assert_eq!(ActionKind::parse("ignore"), None);
    }
}
