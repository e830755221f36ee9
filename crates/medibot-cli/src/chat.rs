//! Line-oriented chat loop over any reader/writer pair.

use crate::engine::{ChatSession, Engine};
use medibot_core::{EmbeddingProvider, Message, Speaker};
use std::io::{self, BufRead, Write};

const HELP: &str = "\
Commands:
  /save         save this conversation
  /new          discard the buffer and start a new conversation
  /history      list saved conversations (newest first)
  /restore <n>  load saved conversation n into the buffer
  /help         show this help
  /quit         leave the chat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Say(String),
    Save,
    New,
    History,
    Restore(usize),
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`; a malformed command
/// yields its usage text.
pub fn parse_line(line: &str) -> Result<Option<ChatCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(ChatCommand::Say(line.to_string())));
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    let arg = parts.next();
    let parsed = match name.as_str() {
        "save" => ChatCommand::Save,
        "new" => ChatCommand::New,
        "history" => ChatCommand::History,
        "restore" => match arg.and_then(|a| a.parse::<usize>().ok()) {
            Some(index) => ChatCommand::Restore(index),
            None => return Err("usage: /restore <n>  (see /history)".to_string()),
        },
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        other => return Err(format!("unknown command /{other}; type /help")),
    };
    Ok(Some(parsed))
}

fn write_message<W: Write>(out: &mut W, bot_name: &str, message: &Message) -> io::Result<()> {
    match message.speaker {
        Speaker::User => writeln!(out, "You: {}", message.text),
        Speaker::Bot => writeln!(out, "{bot_name}: {}", message.text),
    }
}

fn write_transcript<W: Write>(out: &mut W, bot_name: &str, messages: &[Message]) -> io::Result<()> {
    for message in messages {
        write_message(out, bot_name, message)?;
    }
    Ok(())
}

/// Drive a chat session until `/quit` or end of input.
///
/// Engine failures (a save that did not commit, a bad restore index) are
/// reported inline and the session continues with its buffer intact.
pub fn run<P, R, W>(
    engine: &mut Engine<P>,
    session: &mut ChatSession,
    input: R,
    out: &mut W,
) -> io::Result<()>
where
    P: EmbeddingProvider,
    R: BufRead,
    W: Write,
{
    let bot_name = engine.responder().bot_name().to_string();
    writeln!(
        out,
        "{bot_name} ({}). Chatting as {} ({}). Type /help for commands.",
        engine.responder().bot_role(),
        session.user_name,
        session.user_id
    )?;
    write_transcript(out, &bot_name, &session.messages)?;

    let mut unsaved = false;
    for line in input.lines() {
        let command = match parse_line(&line?) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(usage) => {
                writeln!(out, "{usage}")?;
                continue;
            }
        };

        match command {
            ChatCommand::Say(text) => {
                let reply = engine.reply(session, &text);
                writeln!(out, "{bot_name}: {reply}")?;
                unsaved = true;
            }
            ChatCommand::Save => match engine.save(session) {
                Ok(conversation) => {
                    writeln!(out, "Conversation saved ({}).", conversation.label())?;
                    unsaved = false;
                }
                Err(e) if e.is_retryable() => writeln!(
                    out,
                    "Could not save conversation: {e}. Your messages are kept; try /save again."
                )?,
                Err(e) => writeln!(out, "Could not save conversation: {e}")?,
            },
            ChatCommand::New => {
                engine.new_conversation(session);
                unsaved = false;
                writeln!(out, "Started a new conversation.")?;
                write_transcript(out, &bot_name, &session.messages)?;
            }
            ChatCommand::History => match engine.history(session) {
                Ok(conversations) if conversations.is_empty() => {
                    writeln!(out, "No saved conversations.")?
                }
                Ok(conversations) => {
                    for (index, conversation) in conversations.iter().enumerate().rev() {
                        writeln!(
                            out,
                            "  [{index}] {}  ({} messages)",
                            conversation.label(),
                            conversation.messages.len()
                        )?;
                    }
                }
                Err(e) => writeln!(out, "Could not load history: {e}")?,
            },
            ChatCommand::Restore(index) => match engine.restore(session, index) {
                Ok(()) => {
                    unsaved = false;
                    writeln!(out, "Restored conversation {index}.")?;
                    write_transcript(out, &bot_name, &session.messages)?;
                }
                Err(e) => writeln!(out, "Could not restore conversation: {e}")?,
            },
            ChatCommand::Help => writeln!(out, "{HELP}")?,
            ChatCommand::Quit => break,
        }
    }

    if unsaved {
        writeln!(out, "Leaving without saving the last messages.")?;
    }
    tracing::info!(
        session_id = %session.id,
        user_id = %session.user_id,
        messages = session.messages.len(),
        "session closed"
    );
    Ok(())
}
