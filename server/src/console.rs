//! Operator console on standard input.
//!
//! Commands: `help`, `stats`, `kick <session>`, `workers <tier> <count>`,
//! `exit` (or `quit`).

use log::{info, warn};
use shared::SessionId;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::runtime::{Tier, WorldServer};

const HELP: &str = "commands:
  stats                     server, queue and worker statistics
  kick <session>            disconnect a session immediately
  workers <tier> <count>    resize a worker tier (dispatch, process, send)
  exit | quit               shut the server down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Stats,
    Kick(SessionId),
    Workers(Tier, usize),
    Exit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();

    match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("help" | "?", []) => Ok(Command::Help),
        ("stats" | "status", []) => Ok(Command::Stats),
        ("exit" | "quit", []) => Ok(Command::Exit),
        ("kick", [id]) => id
            .parse()
            .map(Command::Kick)
            .map_err(|_| format!("not a session id: {}", id)),
        ("workers", [tier, count]) => {
            let tier = tier.parse::<Tier>().map_err(|e| e.to_string())?;
            let count = count
                .parse()
                .map_err(|_| format!("not a worker count: {}", count))?;
            Ok(Command::Workers(tier, count))
        }
        ("kick" | "workers", _) => Err(format!("wrong arguments for '{}', try 'help'", verb)),
        _ => Err(format!("unknown command '{}', try 'help'", verb)),
    }
}

/// Reads commands until `exit` or end of input.
pub async fn run_console(server: Arc<WorldServer>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                // Detached stdin: keep serving until ctrl-c.
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                warn!("Console input failed: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(Command::Help) => println!("{}", HELP),
            Ok(Command::Stats) => println!("{}", server.stats()),
            Ok(Command::Kick(session)) => {
                if server.kick(session) {
                    println!("session {} kicked", session);
                } else {
                    println!("no active session {}", session);
                }
            }
            Ok(Command::Workers(tier, count)) => match server.resize(tier, count).await {
                Ok(size) => println!("{} tier now has {} workers", tier, size),
                Err(e) => println!("{}", e),
            },
            Ok(Command::Exit) => {
                info!("Exit requested from console");
                return;
            }
            Err(message) => println!("{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("stats"), Ok(Command::Stats));
        assert_eq!(parse_command("  HELP "), Ok(Command::Help));
        assert_eq!(parse_command("quit"), Ok(Command::Exit));
        assert_eq!(parse_command("kick 12"), Ok(Command::Kick(12)));
        assert_eq!(
            parse_command("workers process 4"),
            Ok(Command::Workers(Tier::Process, 4))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("").is_err());
        assert!(parse_command("kick").is_err());
        assert!(parse_command("kick abc").is_err());
        assert!(parse_command("workers send").is_err());
        assert!(parse_command("workers render 2")
            .unwrap_err()
            .contains("render"));
        assert!(parse_command("teleport 1 2").unwrap_err().contains("unknown"));
    }
}
