//! Console front end: input parsing and message display.
//!
//! Anything starting with `/` is a command; everything else is chat text to
//! broadcast. Parsing is a pure function so it can be tested without a
//! terminal.

use messenger_types::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { host: String, port: u16 },
    Listen { port: u16 },
    ListPeers,
    History,
    Help,
    Quit,
    /// Plain chat input, broadcast to every peer.
    Say(String),
    Unknown(String),
}

/// Parse one line of user input. Returns `None` for blank input.
pub fn parse_command(input: &str) -> Option<Command> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if !input.starts_with('/') {
        return Some(Command::Say(input.to_string()));
    }

    let mut parts = input.split_whitespace();
    let command = parts.next().unwrap_or_default();
    match command {
        "/connect" => {
            let host = parts.next();
            let port = parts.next().and_then(|p| p.parse().ok());
            match (host, port) {
                (Some(host), Some(port)) => Some(Command::Connect {
                    host: host.to_string(),
                    port,
                }),
                _ => Some(Command::Unknown(
                    "usage: /connect <host> <port>".to_string(),
                )),
            }
        }
        "/listen" => match parts.next().and_then(|p| p.parse().ok()) {
            Some(port) => Some(Command::Listen { port }),
            None => Some(Command::Unknown("usage: /listen <port>".to_string())),
        },
        "/peers" => Some(Command::ListPeers),
        "/history" => Some(Command::History),
        "/help" => Some(Command::Help),
        "/quit" | "/exit" => Some(Command::Quit),
        other => Some(Command::Unknown(format!("unknown command: {}", other))),
    }
}

pub fn display_message(message: &Message) {
    println!("{}", message);
}

pub fn display_system(text: &str) {
    println!("[System] {}", text);
}

pub fn show_help() {
    println!("Available commands:");
    println!("  /connect <host> <port>  - Connect to a peer");
    println!("  /listen <port>          - Start listening on another port");
    println!("  /peers                  - List connected peers");
    println!("  /history                - Show recent message history");
    println!("  /quit                   - Exit");
    println!("  anything else           - Send as a message to all peers");
}
