//! Terminal front-end: stdin lines in, replies printed as they arrive.

use anyhow::{Context, Result};
use kurisu_backend::adapters::replies_for;
use kurisu_backend::bus::{Handler, MessageBus};
use kurisu_backend::config::KurisuConfig;
use kurisu_backend::message::{Envelope, Sender};
use tokio::io::{AsyncBufReadExt, BufReader};

pub const CONSOLE_ORIGIN: &str = "console";

const QUIT_COMMANDS: [&str; 2] = ["/quit", "/exit"];

#[derive(Debug)]
enum Line {
    Blank,
    Quit,
    Message(Envelope),
}

fn parse_line(raw: &str, user_name: &str) -> Line {
    let text = raw.trim();
    if text.is_empty() {
        return Line::Blank;
    }
    if QUIT_COMMANDS.contains(&text) {
        return Line::Quit;
    }
    Line::Message(Envelope::text(
        CONSOLE_ORIGIN,
        Sender {
            id: CONSOLE_ORIGIN.to_string(),
            name: user_name.to_string(),
        },
        text,
    ))
}

/// Print replies addressed to the console. Keep the handler to unsubscribe later.
pub fn attach_printer(bus: &MessageBus, config: &KurisuConfig) -> Handler {
    let assistant_name = config.assistant_name.clone();
    let printer = replies_for(CONSOLE_ORIGIN, move |envelope: Envelope| {
        let assistant_name = assistant_name.clone();
        async move {
            println!(
                "{}: {}",
                assistant_name,
                envelope.response().unwrap_or_default()
            );
            anyhow::Ok(())
        }
    });
    bus.subscribe(&config.outbound_topic, printer.clone());
    printer
}

/// Read stdin until EOF or a quit command, publishing each line.
pub async fn read_loop(bus: &MessageBus, config: &KurisuConfig) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Talking to {}. Type /quit to leave.", config.assistant_name);

    while let Some(raw) = lines.next_line().await.context("Failed to read stdin")? {
        match parse_line(&raw, &config.user_name) {
            Line::Blank => continue,
            Line::Quit => break,
            Line::Message(envelope) => {
                if !bus.publish(&config.inbound_topic, envelope) {
                    tracing::warn!("Nobody is listening on '{}'", config.inbound_topic);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines() {
        assert!(matches!(parse_line("   ", "Okabe"), Line::Blank));
        assert!(matches!(parse_line("/quit", "Okabe"), Line::Quit));
        assert!(matches!(parse_line(" /exit ", "Okabe"), Line::Quit));

        match parse_line(" hello there ", "Okabe") {
            Line::Message(envelope) => {
                assert_eq!(envelope.origin, CONSOLE_ORIGIN);
                assert_eq!(envelope.sender.name, "Okabe");
                assert_eq!(envelope.content.as_text(), Some("hello there"));
                assert!(envelope.response().is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn printer_subscribes_to_outbound() {
        let bus = MessageBus::new(std::time::Duration::from_millis(10));
        let config = KurisuConfig::default();
        let printer = attach_printer(&bus, &config);
        assert_eq!(bus.listener_count("back_response"), 1);
        bus.unsubscribe("back_response", &printer);
        assert!(!bus.has_topic("back_response"));
    }
}
