//! Notification requests for the email function and the template variables it fills.

use serde::{Deserialize, Serialize};

use crate::capabilities::ValidatedUrl;
use crate::model::{CaseId, CasePriority, CaseStatus, ItemId, ThreadItem, UserRole};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecipientType {
    User,
    Consultant,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub case_id: CaseId,
    pub reply_id: ItemId,
    pub recipient_type: RecipientType,
}

/// Who hears about a new thread item. Internal replies and notes notify nobody.
#[must_use]
pub fn recipient_for(item: &ThreadItem, author_role: UserRole) -> Option<RecipientType> {
    match item {
        ThreadItem::Note(_) => None,
        ThreadItem::Reply(reply) if reply.is_internal => None,
        ThreadItem::Reply(_) => Some(match author_role {
            UserRole::Consultant => RecipientType::User,
            UserRole::User => RecipientType::Consultant,
        }),
    }
}

#[must_use]
pub fn notification_for(item: &ThreadItem, author_role: UserRole) -> Option<NotificationRequest> {
    recipient_for(item, author_role).map(|recipient_type| NotificationRequest {
        case_id: item.case_id().clone(),
        reply_id: item.id().clone(),
        recipient_type,
    })
}

#[must_use]
pub fn case_link(app_url: &ValidatedUrl, case_id: &CaseId) -> String {
    format!("{}/cases/{}", app_url.as_str().trim_end_matches('/'), case_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateContext {
    pub case_title: String,
    pub user_name: String,
    pub case_id: CaseId,
    pub case_status: CaseStatus,
    pub case_priority: CasePriority,
    pub category: Option<String>,
    pub reply_content: String,
    pub case_link: String,
}

impl TemplateContext {
    fn lookup(&self, name: &str) -> Option<&str> {
        Some(match name {
            "case_title" => &self.case_title,
            "user_name" => &self.user_name,
            "case_id" => self.case_id.as_str(),
            "case_status" => self.case_status.as_str(),
            "case_priority" => self.case_priority.as_str(),
            "category" => self.category.as_deref().unwrap_or(""),
            "reply_content" => &self.reply_content,
            "case_link" => &self.case_link,
            _ => return None,
        })
    }
}

/// Single pass: substituted values are never re-scanned, and unknown
/// placeholders stay as written.
#[must_use]
pub fn render_template(template: &str, ctx: &TemplateContext) -> String {
    render_with(template, ctx, |value, out| out.push_str(value))
}

/// Like [`render_template`] but HTML-escapes every substituted value.
#[must_use]
pub fn render_html_template(template: &str, ctx: &TemplateContext) -> String {
    render_with(template, ctx, escape_html)
}

fn render_with(template: &str, ctx: &TemplateContext, emit: impl Fn(&str, &mut String)) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after
            .find('}')
            .filter(|close| !after[..*close].contains('{'))
            .and_then(|close| ctx.lookup(&after[..close]).map(|v| (close, v)));

        match value {
            Some((close, value)) => {
                emit(value, &mut out);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn escape_html(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}
