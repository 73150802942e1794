use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use fittrack_core::chat::{ChatMessage, ChatRole, ChatSession, ChatSnapshot, ChatTransport};

/// Prints a streamed reply as its content grows.
#[derive(Default)]
struct StreamPrinter {
    printed: String,
    finished: bool,
}

impl StreamPrinter {
    fn update(&mut self, reply: &ChatMessage) {
        if self.finished {
            return;
        }
        let mut out = std::io::stdout().lock();
        if let Some(rest) = reply.content.strip_prefix(self.printed.as_str()) {
            let _ = write!(out, "{rest}");
        } else {
            // Content was replaced rather than extended
            let _ = write!(out, "\n{}", reply.content);
        }
        self.printed.clone_from(&reply.content);
        if !reply.is_streaming {
            let _ = writeln!(out);
            self.finished = true;
        }
        let _ = out.flush();
    }
}

fn role_label(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "you",
        ChatRole::Assistant => "coach",
        ChatRole::System => "tool",
    }
}

fn print_message(m: &ChatMessage) {
    println!("{}: {}", role_label(m.role), m.content);
}

/// Send one message and render everything it added to the transcript.
async fn exchange<T: ChatTransport>(
    session: &ChatSession<T>,
    message: &str,
    streaming: bool,
    json: bool,
) -> Result<()> {
    let start = session.messages().len();
    let mut rx = session.subscribe();

    let render_live = streaming && !json;
    let mut printer = StreamPrinter::default();
    let mut printing = false;
    let mut render = |snapshot: &ChatSnapshot| {
        let Some(reply) = snapshot
            .messages
            .iter()
            .skip(start)
            .find(|m| m.id.is_some())
        else {
            return;
        };
        if !printing {
            print!("{}: ", role_label(reply.role));
            printing = true;
        }
        printer.update(reply);
    };

    let send = session.send(message, streaming);
    tokio::pin!(send);
    loop {
        tokio::select! {
            () = &mut send => break,
            Ok(()) = rx.changed() => {
                if render_live {
                    render(&*rx.borrow_and_update());
                }
            }
        }
    }

    let added: Vec<ChatMessage> = session.messages().into_iter().skip(start).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&added)?);
        return Ok(());
    }

    if render_live {
        let last = ChatSnapshot {
            messages: session.messages(),
            is_typing: false,
        };
        render(&last);
        if !printer.finished && printing {
            // Superseded or cut off mid-reply
            println!();
        }
    } else {
        for m in added.iter().filter(|m| m.role != ChatRole::User) {
            print_message(m);
        }
    }
    Ok(())
}

pub(crate) async fn cmd_chat<T: ChatTransport>(
    transport: T,
    message: Option<String>,
    no_stream: bool,
    json: bool,
) -> Result<()> {
    let session = ChatSession::new(transport);
    let streaming = !no_stream;

    if let Some(message) = message {
        if message.trim().is_empty() {
            anyhow::bail!("Message must not be empty");
        }
        return exchange(&session, &message, streaming, json).await;
    }

    if !json {
        eprintln!("Chatting with your coach. Empty line or /quit to exit.");
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if !json {
            eprint!("> ");
            let _ = std::io::stderr().flush();
        }
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() || line == "/quit" {
            break;
        }
        exchange(&session, line, streaming, json).await?;
    }
    session.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(content: &str, is_streaming: bool) -> ChatMessage {
        ChatMessage {
            role: ChatRole::Assistant,
            content: content.to_string(),
            id: Some("r1".to_string()),
            is_streaming,
        }
    }

    #[test]
    fn test_stream_printer_tracks_progress() {
        let mut printer = StreamPrinter::default();
        printer.update(&reply("Eat", true));
        printer.update(&reply("Eat more", true));
        assert_eq!(printer.printed, "Eat more");
        assert!(!printer.finished);

        printer.update(&reply("Eat more greens", false));
        assert!(printer.finished);

        // Updates after the reply finished are ignored
        printer.update(&reply("something else", false));
        assert_eq!(printer.printed, "Eat more greens");
    }

    #[test]
    fn test_role_labels() {
        assert_eq!(role_label(ChatRole::Assistant), "coach");
        assert_eq!(role_label(ChatRole::System), "tool");
    }
}
