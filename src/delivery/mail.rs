use crate::reminder::{DISPLAY_FORMAT, Reminder};

const SUBJECT_PREFIX: &str = "Reminder: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
}

pub fn render_mail(reminder: &Reminder, recipient: &str) -> OutgoingMail {
    let mut html_body = format!(
        "<h2>Reminder</h2>
<p><strong>Date and time:</strong> {}</p>
<p><strong>Description:</strong> {}</p>
",
        reminder.fire_at.datetime().format(DISPLAY_FORMAT),
        html_escape::encode_text(&reminder.description)
    );

    if let Some(details) = &reminder.details {
        html_body.push_str(&format!(
            "<p><strong>Details:</strong> {}</p>\n",
            html_escape::encode_text(details).replace('\n', "<br>")
        ));
    }

    OutgoingMail {
        recipient: recipient.to_owned(),
        subject: format!("{SUBJECT_PREFIX}{}", reminder.description),
        html_body,
    }
}
