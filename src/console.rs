use chrono::NaiveDateTime;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use crate::{
    app::{AppError, Notice, ReminderApp, error_chain},
    export::ExportOutcome,
    reminder::{DISPLAY_FORMAT, ReminderForm, ValidationError},
    scheduling::DeliveryEvent,
};

const GREETING: &str = "Reminders. Type /help to see the commands.";
const HELP: &[&str] = &[
    "/new     add a reminder",
    "/send    email the latest reminder",
    "/list    show reminders of this session",
    "/export  write all stored reminders to a PDF file",
    "/cancel  stop the current operation",
    "/quit    exit",
];
const ASK_DESCRIPTION: &str = "Enter the reminder description.";
const ASK_DETAILS: &str = "Enter details, or - to skip.";
const ASK_DATE_TIME: &str = "Enter date and time as DD.MM.YYYY HH:MM, e.g. 01.01.2025 09:00.";
const ASK_RECIPIENT: &str = "Enter the recipient email.";
const SKIP_DETAILS: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Add,
    Send,
}

#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub enum DialogueState {
    #[default]
    Idle,
    WaitingForDescription {
        intent: Intent,
    },
    WaitingForDetails {
        intent: Intent,
        description: String,
    },
    WaitingForDateTime {
        intent: Intent,
        description: String,
        details: String,
    },
    WaitingForRecipient {
        form: Option<ReminderForm>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    New,
    Send,
    List,
    Export,
    Cancel,
    Help,
    Quit,
}

impl Command {
    fn parse(input: &str) -> Option<Self> {
        let command = match input {
            "/new" => Command::New,
            "/send" => Command::Send,
            "/list" => Command::List,
            "/export" => Command::Export,
            "/cancel" => Command::Cancel,
            "/help" => Command::Help,
            "/quit" => Command::Quit,
            _ => return None,
        };
        Some(command)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    Reply(Vec<String>),
    Quit,
}

impl Response {
    fn line(text: impl Into<String>) -> Self {
        Response::Reply(vec![text.into()])
    }
}

pub struct Console {
    app: ReminderApp,
    state: DialogueState,
    last_form: Option<ReminderForm>,
}

impl Console {
    pub fn new(app: ReminderApp) -> Self {
        Self {
            app,
            state: DialogueState::Idle,
            last_form: None,
        }
    }

    /// Reads commands until `/quit` or end of input, printing delivery results
    /// as soon as they arrive. Emails still pending on exit are cancelled.
    pub async fn run<R, W>(
        mut self,
        input: R,
        mut output: W,
        mut events: mpsc::Receiver<DeliveryEvent>,
    ) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        write_lines(&mut output, &[GREETING]).await?;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    match self.handle_line(&line).await {
                        Response::Reply(reply) => write_lines(&mut output, &reply).await?,
                        Response::Quit => break,
                    }
                }
                Some(event) = events.recv() => {
                    let notice = self.app.handle_delivery_event(event);
                    write_lines(&mut output, &[render_notice(&notice)]).await?;
                }
            }
        }

        let cancelled = self.app.shutdown().await;
        if cancelled > 0 {
            let notice = format!("Cancelled {cancelled} pending email(s).");
            write_lines(&mut output, &[notice]).await?;
        }

        log::info!("Console closed");
        Ok(())
    }

    pub async fn handle_line(&mut self, line: &str) -> Response {
        let input = line.trim();

        if input.starts_with('/') {
            return match Command::parse(input) {
                Some(command) => self.handle_command(command).await,
                None => Response::line("Unknown command. Type /help to see the commands."),
            };
        }

        match std::mem::take(&mut self.state) {
            DialogueState::Idle => {
                Response::line("Nothing is in progress. Type /help to see the commands.")
            }
            DialogueState::WaitingForDescription { intent } => {
                if input.is_empty() {
                    self.state = DialogueState::WaitingForDescription { intent };
                    return Response::line(ValidationError::EmptyDescription.to_string());
                }
                self.state = DialogueState::WaitingForDetails {
                    intent,
                    description: input.to_owned(),
                };
                Response::line(ASK_DETAILS)
            }
            DialogueState::WaitingForDetails {
                intent,
                description,
            } => {
                let details = if input == SKIP_DETAILS { "" } else { input };
                self.state = DialogueState::WaitingForDateTime {
                    intent,
                    description,
                    details: details.to_owned(),
                };
                Response::line(ASK_DATE_TIME)
            }
            DialogueState::WaitingForDateTime {
                intent,
                description,
                details,
            } => match NaiveDateTime::parse_from_str(input, DISPLAY_FORMAT) {
                Ok(scheduled_at) => {
                    let form = ReminderForm::new(description, details, scheduled_at);
                    self.last_form = Some(form.clone());
                    match intent {
                        Intent::Add => self.add(form).await,
                        Intent::Send => {
                            self.state = DialogueState::WaitingForRecipient { form: Some(form) };
                            Response::line(ASK_RECIPIENT)
                        }
                    }
                }
                Err(error) => {
                    log::debug!("Rejected date input {:?}: {}", input, error);
                    self.state = DialogueState::WaitingForDateTime {
                        intent,
                        description,
                        details,
                    };
                    Response::line(format!("Could not parse the date. {ASK_DATE_TIME}"))
                }
            },
            DialogueState::WaitingForRecipient { form } => self.send(input, form).await,
        }
    }

    async fn handle_command(&mut self, command: Command) -> Response {
        match command {
            Command::Cancel => {
                self.state = DialogueState::Idle;
                Response::line("Cancelled current operation.")
            }
            Command::Help => Response::Reply(HELP.iter().map(|line| line.to_string()).collect()),
            Command::Quit => Response::Quit,
            Command::New | Command::Send | Command::List | Command::Export
                if self.state != DialogueState::Idle =>
            {
                Response::line(
                    "Unable to handle the command now. Finish the current step or use /cancel.",
                )
            }
            Command::New => {
                self.state = DialogueState::WaitingForDescription {
                    intent: Intent::Add,
                };
                Response::line(ASK_DESCRIPTION)
            }
            Command::Send => self.start_send(),
            Command::List => self.list().await,
            Command::Export => self.export().await,
        }
    }

    fn start_send(&mut self) -> Response {
        if let Some(latest) = self.app.reminders().last() {
            let text = format!("Sending: {}", latest.display_line());
            self.state = DialogueState::WaitingForRecipient { form: None };
            return Response::Reply(vec![text, ASK_RECIPIENT.to_owned()]);
        }

        match self.last_form.clone() {
            Some(form) => {
                let text = format!(
                    "Sending the last entered reminder \"{}\".",
                    form.description
                );
                self.state = DialogueState::WaitingForRecipient { form: Some(form) };
                Response::Reply(vec![text, ASK_RECIPIENT.to_owned()])
            }
            None => {
                self.state = DialogueState::WaitingForDescription {
                    intent: Intent::Send,
                };
                Response::line(ASK_DESCRIPTION)
            }
        }
    }

    async fn add(&mut self, form: ReminderForm) -> Response {
        match self.app.add_reminder(&form).await {
            Ok(reminder) => Response::line(format!("Reminder added: {}", reminder.display_line())),
            Err(error) => Response::line(error_chain(&error)),
        }
    }

    async fn send(&mut self, recipient: &str, form: Option<ReminderForm>) -> Response {
        let added_before = self.app.reminders().len();
        let result = self.app.send_notification(recipient, form.as_ref()).await;

        let mut reply = Vec::new();
        if self.app.reminders().len() > added_before {
            if let Some(reminder) = self.app.reminders().last() {
                reply.push(format!("Reminder added: {}", reminder.display_line()));
            }
        }

        match result {
            Ok(scheduled) => {
                let mut text = format!(
                    "Email to {} scheduled for {}",
                    scheduled.key.recipient,
                    scheduled.key.fire_at.format(DISPLAY_FORMAT)
                );
                if scheduled.replaced {
                    text.push_str(", replacing the earlier one");
                }
                reply.push(text);
            }
            Err(AppError::Validation(ValidationError::EmptyRecipient)) => {
                self.state = DialogueState::WaitingForRecipient { form };
                reply.push(ValidationError::EmptyRecipient.to_string());
            }
            Err(error) => reply.push(error_chain(&error)),
        }

        Response::Reply(reply)
    }

    async fn list(&self) -> Response {
        if self.app.display_text().is_empty() {
            return Response::line("No reminders yet.");
        }

        let mut reply: Vec<_> = self
            .app
            .display_text()
            .lines()
            .map(str::to_owned)
            .collect();
        let pending = self.app.pending_deliveries().await;
        if pending > 0 {
            reply.push(format!("Pending emails: {pending}"));
        }
        Response::Reply(reply)
    }

    async fn export(&self) -> Response {
        match self.app.export_reminders().await {
            Ok(ExportOutcome::Empty) => Response::line("Nothing to export."),
            Ok(ExportOutcome::Written {
                path,
                reminders,
                pages,
                unrendered,
            }) => {
                let mut reply = vec![format!(
                    "Exported {} reminder(s) on {} page(s) to {}",
                    reminders,
                    pages,
                    path.display()
                )];
                if unrendered > 0 {
                    reply.push(format!(
                        "{unrendered} character(s) could not be rendered and were replaced with ?"
                    ));
                }
                Response::Reply(reply)
            }
            Err(error) => Response::line(error_chain(&error)),
        }
    }
}

fn render_notice(notice: &Notice) -> String {
    match notice {
        Notice::Info(text) => text.clone(),
        Notice::Warning(text) => format!("Warning: {text}"),
    }
}

async fn write_lines<W: AsyncWrite + Unpin>(
    output: &mut W,
    lines: &[impl AsRef<str>],
) -> std::io::Result<()> {
    for line in lines {
        output.write_all(line.as_ref().as_bytes()).await?;
        output.write_all(b"\n").await?;
    }
    output.flush().await
}
