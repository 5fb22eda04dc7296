//! Line-oriented presenter. Owns the user list and renders bus events; stdin lines become posts.

use std::io::Write;

use chrono::{DateTime, Local};
use peerchat_core::{ChatPost, Event};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::bus::PresentationBus;

const LOGO: &str = r"     _____ __ ____  ___   ______________
    / ___// //_/\ \/ / | / / ____/_  __/
    \__ \/ ,<    \  /  |/ / __/   / /
   ___/ / /| |   / / /|  / /___  / /
  /____/_/ |_|  /_/_/ |_/_____/ /_/";

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Post(String),
    Users,
    Quit,
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.trim() {
        "" => Input::Empty,
        "/quit" | "/exit" => Input::Quit,
        "/users" => Input::Users,
        _ => Input::Post(line.to_string()),
    }
}

/// Presentation state. Populated only from bus events.
pub struct Presenter {
    username: String,
    users: Vec<String>,
}

impl Presenter {
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            users: vec![username.clone()],
            username,
        }
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    /// Apply an event and return the line to print, if any.
    pub fn render(&mut self, event: &Event, now: DateTime<Local>) -> Option<String> {
        match event {
            Event::PeerJoined(id) => {
                if !self.users.contains(id) {
                    self.users.push(id.clone());
                }
                Some(format!("{} joined us.", id))
            }
            Event::PeerLeft(id) => {
                self.users.retain(|u| u != id);
                Some(format!("{} left us.", id))
            }
            Event::MessageReceived(post) => Some(format_post(post, now)),
            Event::LogLine(line) => Some(line.clone()),
            Event::MessageToSend(_) | Event::Shutdown => None,
        }
    }

    /// Build the post for a line the user typed.
    pub fn compose(&self, message: String) -> ChatPost {
        ChatPost::new(self.username.clone(), message)
    }
}

pub fn format_post(post: &ChatPost, now: DateTime<Local>) -> String {
    format!("{} <{}> {}", now.format("%H:%M"), post.username, post.message)
}

fn print_line(line: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", line);
    let _ = out.flush();
}

/// Run until the user quits, stdin ends, or the network side goes away.
/// Prompts for a username first when none was configured.
pub async fn run_terminal(username: Option<String>, mut bus: PresentationBus) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let username = match username {
        Some(u) => u,
        None => {
            print_line(LOGO);
            print_line("Welcome to Skynet!");
            loop {
                print_line("User:");
                match lines.next_line().await {
                    Ok(Some(l)) if !l.trim().is_empty() => break l.trim().to_string(),
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => {
                        let _ = bus.handle.send(Event::Shutdown);
                        return;
                    }
                }
            }
        }
    };
    let mut presenter = Presenter::new(username);
    print_line("Type a message and press Enter. /users lists peers, /quit leaves.");

    loop {
        tokio::select! {
            event = bus.events.recv() => match event {
                Some(event) => {
                    if let Some(line) = presenter.render(&event, Local::now()) {
                        print_line(&line);
                    }
                }
                None => break,
            },
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => {
                        let _ = bus.handle.send(Event::Shutdown);
                        break;
                    }
                };
                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Users => print_line(&presenter.users().join(", ")),
                    Input::Quit => {
                        let _ = bus.handle.send(Event::Shutdown);
                        break;
                    }
                    Input::Post(message) => {
                        let post = presenter.compose(message);
                        print_line(&format_post(&post, Local::now()));
                        if let Err(e) = bus.handle.send(Event::MessageToSend(post)) {
                            debug!(error = %e, "post not sent");
                        }
                    }
                }
            }
        }
    }
}
