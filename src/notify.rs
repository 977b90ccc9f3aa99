use chrono::Utc;
use rusqlite::Connection;
use tracing::warn;

/// The four enrollment mail templates. The variant pair encodes whether the
/// recipient holds an account yet (allowed vs enrolled) and the direction
/// (enroll vs unenroll).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    AllowedEnroll,
    EnrolledEnroll,
    AllowedUnenroll,
    EnrolledUnenroll,
}

impl Template {
    pub fn as_str(self) -> &'static str {
        match self {
            Template::AllowedEnroll => "allowed_enroll",
            Template::EnrolledEnroll => "enrolled_enroll",
            Template::AllowedUnenroll => "allowed_unenroll",
            Template::EnrolledUnenroll => "enrolled_unenroll",
        }
    }
}

/// Everything a template can interpolate. Built once per batch request;
/// `email_address` and `full_name` vary per recipient.
#[derive(Debug, Clone, Default)]
pub struct MailParams {
    pub site_name: String,
    pub registration_url: String,
    pub course_display_name: String,
    pub course_key: String,
    pub course_url: String,
    pub course_about_url: String,
    pub auto_enroll: bool,
    pub email_address: String,
    pub full_name: Option<String>,
}

/// Mail handoff point. Returns whether the notification was accepted; the
/// reconciler records that in the per-identifier status, it never fails the
/// batch over mail.
pub trait Notifier {
    fn send(&mut self, template: Template, params: &MailParams) -> bool;
}

/// Persists rendered mail into the workspace outbox table. Delivery beyond
/// the outbox is the embedding platform's job.
pub struct OutboxNotifier<'a> {
    pub conn: &'a Connection,
}

impl Notifier for OutboxNotifier<'_> {
    fn send(&mut self, template: Template, params: &MailParams) -> bool {
        let (subject, body) = render(template, params);
        match queue_raw(
            self.conn,
            template.as_str(),
            &params.email_address,
            &subject,
            &body,
        ) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "outbox insert failed for {} ({}): {}",
                    params.email_address,
                    template.as_str(),
                    e
                );
                false
            }
        }
    }
}

/// Queues one already-rendered message.
pub fn queue_raw(
    conn: &Connection,
    template: &str,
    recipient: &str,
    subject: &str,
    body: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO mail_outbox(id, template, recipient, subject, body, sent_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        (
            uuid::Uuid::new_v4().to_string(),
            template,
            recipient,
            subject,
            body,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(())
}

/// Swallows everything. Used when a request asks for no student mail.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send(&mut self, _template: Template, _params: &MailParams) -> bool {
        false
    }
}

pub fn render(template: Template, params: &MailParams) -> (String, String) {
    let greeting = match params.full_name.as_deref() {
        Some(name) if !name.is_empty() => format!("Dear {},", name),
        _ => "Dear student,".to_string(),
    };
    match template {
        Template::AllowedEnroll => {
            let subject = format!(
                "You have been invited to register for {}",
                params.course_display_name
            );
            let next_step = if params.auto_enroll {
                format!(
                    "Once you have registered at {}, you will be enrolled automatically and can visit the course at {}.",
                    params.registration_url, params.course_url
                )
            } else {
                format!(
                    "Register at {} and then enroll from the course page at {}.",
                    params.registration_url, params.course_about_url
                )
            };
            let body = format!(
                "{}\n\nYou have been invited to join {} at {}.\n\n{}\n",
                greeting, params.course_display_name, params.site_name, next_step
            );
            (subject, body)
        }
        Template::EnrolledEnroll => {
            let subject = format!("You have been enrolled in {}", params.course_display_name);
            let body = format!(
                "{}\n\nYou have been enrolled in {} at {} by a member of the course staff. \
                 The course should now appear on your dashboard; it is available at {}.\n",
                greeting, params.course_display_name, params.site_name, params.course_url
            );
            (subject, body)
        }
        Template::AllowedUnenroll => {
            let subject = format!(
                "You have been un-enrolled from {}",
                params.course_display_name
            );
            let body = format!(
                "{}\n\nYou had been invited to join {} at {}; that invitation has been withdrawn. \
                 If you believe this is an error, contact the course staff.\n",
                greeting, params.course_display_name, params.site_name
            );
            (subject, body)
        }
        Template::EnrolledUnenroll => {
            let subject = format!(
                "You have been un-enrolled from {}",
                params.course_display_name
            );
            let body = format!(
                "{}\n\nYou have been un-enrolled from {} at {} by a member of the course staff. \
                 The course will no longer appear on your dashboard.\n",
                greeting, params.course_display_name, params.site_name
            );
            (subject, body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> MailParams {
        MailParams {
            site_name: "campus.test".to_string(),
            registration_url: "http://lms/register".to_string(),
            course_display_name: "Circuits".to_string(),
            course_key: "MITx/6.002x/2013".to_string(),
            course_url: "http://lms/courses/MITx/6.002x/2013".to_string(),
            course_about_url: "http://lms/courses/MITx/6.002x/2013/about".to_string(),
            auto_enroll: false,
            email_address: "a@x.com".to_string(),
            full_name: Some("Ada".to_string()),
        }
    }

    #[test]
    fn allowed_enroll_switches_on_auto_enroll() {
        let mut p = params();
        let (_, manual_body) = render(Template::AllowedEnroll, &p);
        assert!(manual_body.contains("enroll from the course page"));

        p.auto_enroll = true;
        let (_, auto_body) = render(Template::AllowedEnroll, &p);
        assert!(auto_body.contains("enrolled automatically"));
    }

    #[test]
    fn outbox_notifier_persists_rendered_mail() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_schema(&conn).unwrap();

        let mut notifier = OutboxNotifier { conn: &conn };
        assert!(notifier.send(Template::EnrolledEnroll, &params()));

        let (template, recipient, subject): (String, String, String) = conn
            .query_row(
                "SELECT template, recipient, subject FROM mail_outbox",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(template, "enrolled_enroll");
        assert_eq!(recipient, "a@x.com");
        assert!(subject.contains("Circuits"));
    }
}
