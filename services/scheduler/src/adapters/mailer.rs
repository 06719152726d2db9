//! services/scheduler/src/adapters/mailer.rs
//!
//! This module contains the email adapter. It implements the `NotificationGateway`
//! port from the `core` crate: it renders a digest into an email, sends it over
//! SMTP with `lettre`, and records the notification.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use repetition_core::domain::{AgeTier, Digest, NotificationType, RepetitionRule, User};
use repetition_core::ports::{NotificationGateway, PortError, PortResult};
use tracing::info;

use crate::adapters::db::{DbAdapter, TokenType};
use crate::config::SmtpConfig;

/// Longest note excerpt shown in an email, in characters.
const SUMMARY_LEN: usize = 140;

//=========================================================================================
// Rendering
//=========================================================================================

/// One note line in the email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteSummary {
    pub tier: AgeTier,
    pub book_label: String,
    pub summary: String,
}

/// A rendered repetition email, independent of the transport.
#[derive(Debug, Clone)]
pub struct DigestEmail {
    pub subject: String,
    pub notes: Vec<NoteSummary>,
    pub book_count: usize,
    pub note_count: usize,
    pub preferences_url: String,
}

impl DigestEmail {
    pub fn build(
        now: DateTime<Utc>,
        rule: &RepetitionRule,
        digest: &Digest,
        token: &str,
        web_url: &str,
    ) -> Self {
        let subject = format!("{} {}", rule.title, now.format("%b %d %Y"));

        let notes = digest
            .notes
            .iter()
            .map(|note| NoteSummary {
                tier: AgeTier::classify(note.added_on, now),
                book_label: note.book_label.clone(),
                summary: excerpt(&note.body),
            })
            .collect();

        let book_count = digest
            .notes
            .iter()
            .map(|n| n.book_label.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            subject,
            notes,
            book_count,
            note_count: digest.notes.len(),
            preferences_url: format!(
                "{}/preferences/repetitions/{}?token={}",
                web_url, rule.uuid, token
            ),
        }
    }

    fn tier_heading(tier: AgeTier) -> &'static str {
        match tier {
            AgeTier::Recent => "Added in the last 3 days",
            AgeTier::ThisWeek => "Added in the last week",
            AgeTier::Older => "From your archive",
        }
    }

    fn in_tier(&self, tier: AgeTier) -> impl Iterator<Item = &NoteSummary> {
        self.notes.iter().filter(move |n| n.tier == tier)
    }

    fn summary_line(&self) -> String {
        format!(
            "{} {} from {} {}.",
            self.note_count,
            if self.note_count == 1 { "note" } else { "notes" },
            self.book_count,
            if self.book_count == 1 { "book" } else { "books" },
        )
    }

    pub fn text_body(&self) -> String {
        let mut out = format!("{}\n\n", self.summary_line());
        for tier in AgeTier::ALL {
            let mut notes = self.in_tier(tier).peekable();
            if notes.peek().is_none() {
                continue;
            }
            out.push_str(Self::tier_heading(tier));
            out.push('\n');
            for note in notes {
                out.push_str(&format!("  - [{}] {}\n", note.book_label, note.summary));
            }
            out.push('\n');
        }
        out.push_str(&format!(
            "Change how often you get this email: {}\n",
            self.preferences_url
        ));
        out
    }

    pub fn html_body(&self) -> String {
        let mut out = format!("<p>{}</p>", escape_html(&self.summary_line()));
        for tier in AgeTier::ALL {
            let mut notes = self.in_tier(tier).peekable();
            if notes.peek().is_none() {
                continue;
            }
            out.push_str(&format!("<h3>{}</h3><ul>", Self::tier_heading(tier)));
            for note in notes {
                out.push_str(&format!(
                    "<li><strong>{}</strong> {}</li>",
                    escape_html(&note.book_label),
                    escape_html(&note.summary)
                ));
            }
            out.push_str("</ul>");
        }
        out.push_str(&format!(
            "<p><a href=\"{}\">Change how often you get this email</a></p>",
            escape_html(&self.preferences_url)
        ));
        out
    }
}

/// The first line of a note body, cut to `SUMMARY_LEN` characters.
fn excerpt(body: &str) -> String {
    let first_line = body.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if first_line.chars().count() <= SUMMARY_LEN {
        return first_line.to_string();
    }
    let cut: String = first_line.chars().take(SUMMARY_LEN).collect();
    format!("{}…", cut.trim_end())
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

#[derive(Clone)]
enum Transport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    /// Logs messages instead of sending them, for local development.
    Log,
}

/// An adapter that implements `NotificationGateway` by email.
#[derive(Clone)]
pub struct SmtpNotifier {
    db: DbAdapter,
    transport: Transport,
    from: Mailbox,
    web_url: String,
}

impl SmtpNotifier {
    /// Creates a new `SmtpNotifier`. Without SMTP settings, mail is only logged.
    pub fn new(
        db: DbAdapter,
        smtp: Option<&SmtpConfig>,
        from: &str,
        web_url: String,
    ) -> Result<Self, crate::error::ServiceError> {
        let transport = match smtp {
            Some(smtp) => {
                let mut builder =
                    AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)?.port(smtp.port);
                if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
                    builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
                }
                Transport::Smtp(builder.build())
            }
            None => Transport::Log,
        };

        let from = from.parse::<Mailbox>().map_err(|e| {
            crate::config::ConfigError::InvalidValue("MAIL_FROM".to_string(), e.to_string())
        })?;

        Ok(Self {
            db,
            transport,
            from,
            web_url,
        })
    }
}

//=========================================================================================
// `NotificationGateway` Trait Implementation
//=========================================================================================

#[async_trait]
impl NotificationGateway for SmtpNotifier {
    async fn notify(
        &self,
        user: &User,
        address: &str,
        digest: &Digest,
        rule: &RepetitionRule,
        now: DateTime<Utc>,
    ) -> PortResult<()> {
        let token = self.db.get_or_create_token(user.id, TokenType::Repetition).await?;
        let email = DigestEmail::build(now, rule, digest, &token, &self.web_url);

        let to = address
            .parse::<Mailbox>()
            .map_err(|e| PortError::Unexpected(format!("invalid recipient '{}': {}", address, e)))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                email.text_body(),
                email.html_body(),
            ))
            .map_err(|e| PortError::Unexpected(format!("making email: {}", e)))?;

        match &self.transport {
            Transport::Smtp(mailer) => {
                mailer
                    .send(message)
                    .await
                    .map_err(|e| PortError::Unexpected(format!("sending email: {}", e)))?;
            }
            Transport::Log => {
                info!(
                    user_id = user.id,
                    subject = %email.subject,
                    notes = email.note_count,
                    "SMTP not configured; logging repetition email instead of sending"
                );
            }
        }

        self.db
            .create_notification(user.id, NotificationType::EmailWeekly)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use repetition_core::domain::{BookDomain, Note};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2009, 11, 10, 12, 2, 0).unwrap()
    }

    fn rule() -> RepetitionRule {
        RepetitionRule {
            id: 1,
            uuid: Uuid::nil(),
            user_id: 1,
            title: "Weekly review".to_string(),
            hour: 12,
            minute: 2,
            frequency: Duration::days(7).num_milliseconds(),
            enabled: true,
            last_active: 0,
            next_active: 0,
            book_domain: BookDomain::All,
            book_ids: Vec::new(),
            note_count: 10,
        }
    }

    fn note(id: i64, label: &str, body: &str, age: Duration) -> Note {
        Note {
            id,
            uuid: Uuid::new_v4(),
            book_id: id,
            book_label: label.to_string(),
            body: body.to_string(),
            added_on: now() - age,
        }
    }

    fn digest(notes: Vec<Note>) -> Digest {
        Digest {
            id: 9,
            uuid: Uuid::new_v4(),
            rule_id: 1,
            user_id: 1,
            notes,
            created_at: now(),
        }
    }

    #[test]
    fn subject_combines_title_and_date() {
        let email = DigestEmail::build(now(), &rule(), &digest(vec![]), "tok", "http://x");
        assert_eq!(email.subject, "Weekly review Nov 10 2009");
    }

    #[test]
    fn counts_distinct_books_and_notes() {
        let d = digest(vec![
            note(1, "rust", "ownership", Duration::hours(1)),
            note(2, "rust", "borrowing", Duration::days(4)),
            note(3, "go", "goroutines", Duration::days(9)),
        ]);
        let email = DigestEmail::build(now(), &rule(), &d, "tok", "http://x");

        assert_eq!(email.book_count, 2);
        assert_eq!(email.note_count, 3);
        let tiers: Vec<AgeTier> = email.notes.iter().map(|n| n.tier).collect();
        assert_eq!(tiers, vec![AgeTier::Recent, AgeTier::ThisWeek, AgeTier::Older]);
    }

    #[test]
    fn bodies_group_notes_by_tier_and_carry_the_token() {
        let d = digest(vec![
            note(1, "rust", "ownership", Duration::days(10)),
            note(2, "go", "channels", Duration::hours(3)),
        ]);
        let email = DigestEmail::build(now(), &rule(), &d, "abc123", "https://notes.example.com");
        let text = email.text_body();

        let recent = text.find("Added in the last 3 days").unwrap();
        let archive = text.find("From your archive").unwrap();
        assert!(recent < archive);
        assert!(!text.contains("Added in the last week"));
        assert!(text.contains("  - [go] channels"));
        assert!(text.contains(
            "https://notes.example.com/preferences/repetitions/00000000-0000-0000-0000-000000000000?token=abc123"
        ));
        assert!(text.starts_with("2 notes from 2 books."));
    }

    #[test]
    fn html_escapes_note_content() {
        let d = digest(vec![note(1, "a<b>", "x & \"y\"", Duration::hours(1))]);
        let html = DigestEmail::build(now(), &rule(), &d, "tok", "http://x").html_body();

        assert!(html.contains("<strong>a&lt;b&gt;</strong> x &amp; &quot;y&quot;"));
        assert!(html.contains("1 note from 1 book."));
    }

    #[test]
    fn text_body_layout() {
        let d = digest(vec![note(1, "rust", "ownership", Duration::days(4))]);
        let email = DigestEmail::build(now(), &rule(), &d, "tok", "http://x");

        assert_eq!(
            email.text_body(),
            "1 note from 1 book.\n\n\
             Added in the last week\n  - [rust] ownership\n\n\
             Change how often you get this email: \
             http://x/preferences/repetitions/00000000-0000-0000-0000-000000000000?token=tok\n"
        );
    }

    #[test]
    fn excerpt_takes_the_first_non_empty_line() {
        assert_eq!(excerpt("\n  first line  \nsecond"), "first line");
        let long = "a".repeat(SUMMARY_LEN + 10);
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), SUMMARY_LEN + 1);
        assert!(cut.ends_with('…'));
    }
}
