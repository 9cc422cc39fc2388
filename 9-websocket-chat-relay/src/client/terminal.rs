use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::{debug, warn};

use super::session::{ClientEvent, ConnectionStatus, ResilientClient, SendError};
use crate::{cli::ClientArgs, message::Inbound};

/// Holds what the user typed until the hub actually accepted it.
#[derive(Debug, Default)]
pub struct Composer {
    draft: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Sent,
    /// Nothing worth sending.
    Empty,
    /// The send failed; the draft is kept for another try.
    Kept,
}

impl Composer {
    pub fn draft(&self) -> &str {
        &self.draft
    }

    /// Takes a typed line. A blank line leaves the current draft alone so it
    /// can be re-submitted.
    pub fn input(&mut self, line: &str) {
        if !line.trim().is_empty() {
            self.draft = line.to_string();
        }
    }

    pub fn submit<F>(&mut self, send: F) -> Submit
    where
        F: FnOnce(&str) -> Result<(), SendError>,
    {
        if self.draft.trim().is_empty() {
            return Submit::Empty;
        }

        match send(&self.draft) {
            Ok(()) => {
                self.draft.clear();
                Submit::Sent
            }
            Err(error) => {
                debug!(%error, draft = %self.draft, "keeping draft after failed send");
                Submit::Kept
            }
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let client = ResilientClient::spawn(args.client_config());
    let (handle, mut events, mut driver) = client.into_parts();
    let mut status = handle.status();

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut composer = Composer::default();

    loop {
        input.clear();
        select! {
            Some(event) = events.recv() => render_event(event).await?,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                render_status(current).await?;
            }
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                let line = input.trim_end();
                if line.eq_ignore_ascii_case("/quit") {
                    write_stdout("*** leaving chat").await?;
                    break;
                }
                composer.input(line);
                if composer.submit(|text| handle.send(text)) == Submit::Kept {
                    write_stdout("*** press enter to retry the last message").await?;
                }
            }
            _ = &mut driver => {
                // The driver only stops on its own after giving up.
                drain_events(&mut events).await?;
                return Ok(());
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    handle.close();
    if let Err(error) = driver.await {
        warn!(%error, "client driver ended abnormally");
    }
    Ok(())
}

async fn drain_events(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> io::Result<()> {
    while let Ok(event) = events.try_recv() {
        render_event(event).await?;
    }
    Ok(())
}

pub fn format_event(event: &ClientEvent) -> String {
    match event {
        ClientEvent::Message(Inbound::Chat(chat)) => format!("<{}> {}", chat.user, chat.text),
        ClientEvent::Message(Inbound::System(notice)) => format!("*** {}", notice.message),
        ClientEvent::Notice(text) => format!("*** {text}"),
    }
}

pub fn format_status(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Connected => "*** status: connected",
        ConnectionStatus::Disconnected => "*** status: disconnected",
    }
}

async fn render_event(event: ClientEvent) -> io::Result<()> {
    write_stdout(&format_event(&event)).await
}

async fn render_status(status: ConnectionStatus) -> io::Result<()> {
    write_stdout(format_status(status)).await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessage, SystemNotice};

    #[test]
    fn successful_submit_clears_draft() {
        let mut composer = Composer::default();
        composer.input("hello");

        let mut sent = Vec::new();
        let outcome = composer.submit(|text| {
            sent.push(text.to_string());
            Ok(())
        });

        assert_eq!(outcome, Submit::Sent);
        assert_eq!(sent, vec!["hello".to_string()]);
        assert_eq!(composer.draft(), "");
    }

    #[test]
    fn failed_submit_keeps_draft_for_retry() {
        let mut composer = Composer::default();
        composer.input("are you there?");

        let outcome = composer.submit(|_| Err(SendError::NotConnected));
        assert_eq!(outcome, Submit::Kept);
        assert_eq!(composer.draft(), "are you there?");

        // A blank line re-submits what was kept.
        composer.input("");
        let outcome = composer.submit(|text| {
            assert_eq!(text, "are you there?");
            Ok(())
        });
        assert_eq!(outcome, Submit::Sent);
    }

    #[test]
    fn blank_input_is_not_sent() {
        let mut composer = Composer::default();
        composer.input("   ");

        let outcome = composer.submit(|_| panic!("nothing should be sent"));
        assert_eq!(outcome, Submit::Empty);
    }

    #[test]
    fn events_render_like_chat_lines() {
        let chat = ClientEvent::Message(Inbound::Chat(ChatMessage::new("匿名", "hello")));
        let system = ClientEvent::Message(Inbound::System(SystemNotice::new("welcome")));
        let local = ClientEvent::Notice("connected to chat".into());

        assert_eq!(format_event(&chat), "<匿名> hello");
        assert_eq!(format_event(&system), "*** welcome");
        assert_eq!(format_event(&local), "*** connected to chat");
        assert_eq!(
            format_status(ConnectionStatus::Disconnected),
            "*** status: disconnected"
        );
    }
}
