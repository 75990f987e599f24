//! Interactive command loop.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

use crate::connection::{ConnectionOptions, ServerConnection};

pub const HELP: &str = "\
Commands:
  list           retrieve the server's library listing
  get <i>        save file <i> into the library directory
  stream <i>     play file <i>
  stream+ <i>    play file <i> and save it
  help           show this message
  quit           exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellCommand {
    List,
    Get(u32),
    Stream(u32),
    StreamAndGet(u32),
    Help,
    Quit,
    Empty,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("usage: {0} <index>")]
    MissingIndex(&'static str),

    #[error("{0:?} is not a file index")]
    BadIndex(String),

    #[error("unknown command {0:?}; type help for a list")]
    Unknown(String),
}

impl ShellCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            return Ok(ShellCommand::Empty);
        };
        let index = |name: &'static str, arg: Option<&str>| -> Result<u32, ParseError> {
            let arg = arg.ok_or(ParseError::MissingIndex(name))?;
            arg.parse::<u32>()
                .map_err(|_| ParseError::BadIndex(arg.to_string()))
        };
        match cmd {
            "list" => Ok(ShellCommand::List),
            "get" => Ok(ShellCommand::Get(index("get", words.next())?)),
            "stream" => Ok(ShellCommand::Stream(index("stream", words.next())?)),
            "stream+" => Ok(ShellCommand::StreamAndGet(index("stream+", words.next())?)),
            "help" => Ok(ShellCommand::Help),
            "quit" | "exit" => Ok(ShellCommand::Quit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

pub struct Shell {
    host: String,
    port: u16,
    options: ConnectionOptions,
    conn: Option<ServerConnection>,
}

impl Shell {
    pub fn new(host: impl Into<String>, port: u16, options: ConnectionOptions) -> Self {
        Self {
            host: host.into(),
            port,
            options,
            conn: None,
        }
    }

    /// Connect now rather than on the first command.
    pub fn connect(&mut self) -> Result<()> {
        self.connection().map(|_| ())
    }

    /// Read commands from `input` until `quit` or end of input.
    pub fn run(&mut self, input: impl BufRead, mut out: impl Write) -> Result<()> {
        let mut lines = input.lines();
        loop {
            write!(out, "> ")?;
            out.flush()?;
            let Some(line) = lines.next() else {
                writeln!(out)?;
                return Ok(());
            };
            let line = line.context("read command")?;
            match ShellCommand::parse(&line) {
                Ok(ShellCommand::Quit) => return Ok(()),
                Ok(cmd) => self.execute(cmd, &mut out)?,
                Err(e) => writeln!(out, "{e}")?,
            }
        }
    }

    /// Run one command, reporting its failure on `out`.
    ///
    /// Only a failure to write to `out` is returned as an error.
    pub fn execute(&mut self, cmd: ShellCommand, out: &mut impl Write) -> Result<()> {
        let outcome = match cmd {
            ShellCommand::Empty | ShellCommand::Quit => return Ok(()),
            ShellCommand::Help => {
                writeln!(out, "{HELP}")?;
                return Ok(());
            }
            ShellCommand::List => self.list(out),
            ShellCommand::Get(i) => self
                .connection()
                .and_then(|c| c.get(i))
                .map(|r| format!("saved {} bytes", r.total)),
            ShellCommand::Stream(i) => self
                .connection()
                .and_then(|c| c.stream(i))
                .map(|r| format!("streamed {} bytes", r.total)),
            ShellCommand::StreamAndGet(i) => self
                .connection()
                .and_then(|c| c.stream_and_get(i))
                .map(|r| format!("streamed and saved {} bytes", r.total)),
        };
        match outcome {
            Ok(message) if message.is_empty() => {}
            Ok(message) => writeln!(out, "{message}")?,
            Err(e) => {
                tracing::warn!("command failed: {e:#}");
                writeln!(out, "{e:#}")?;
            }
        }
        Ok(())
    }

    fn list(&mut self, out: &mut impl Write) -> Result<String> {
        let entries = self.connection()?.list()?;
        if entries.is_empty() {
            return Ok("Server library is empty".to_string());
        }
        for (index, name) in entries.iter().enumerate() {
            writeln!(out, "{index}: {name}")?;
        }
        Ok(String::new())
    }

    /// The live connection, reconnecting if the last one was left mid-response.
    fn connection(&mut self) -> Result<&mut ServerConnection> {
        let stale = self
            .conn
            .as_ref()
            .is_none_or(ServerConnection::is_desynchronized);
        if stale {
            // The new session may serve a different catalog, so the old listing is dropped.
            if self.conn.take().is_some() {
                tracing::info!("reconnecting after an interrupted response; run list again");
            }
            let conn = ServerConnection::connect(&self.host, self.port, self.options.clone())?;
            self.conn = Some(conn);
        }
        self.conn
            .as_mut()
            .context("no server connection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_every_command() {
        assert_eq!(ShellCommand::parse("list"), Ok(ShellCommand::List));
        assert_eq!(ShellCommand::parse("get 3"), Ok(ShellCommand::Get(3)));
        assert_eq!(ShellCommand::parse("  stream 0 "), Ok(ShellCommand::Stream(0)));
        assert_eq!(
            ShellCommand::parse("stream+ 12"),
            Ok(ShellCommand::StreamAndGet(12))
        );
        assert_eq!(ShellCommand::parse("help"), Ok(ShellCommand::Help));
        assert_eq!(ShellCommand::parse("quit"), Ok(ShellCommand::Quit));
        assert_eq!(ShellCommand::parse(""), Ok(ShellCommand::Empty));
    }

    #[test]
    fn parse_reports_usage_and_bad_input() {
        assert_eq!(
            ShellCommand::parse("get"),
            Err(ParseError::MissingIndex("get"))
        );
        assert_eq!(
            ShellCommand::parse("stream -1"),
            Err(ParseError::BadIndex("-1".into()))
        );
        assert_eq!(
            ShellCommand::parse("play 1"),
            Err(ParseError::Unknown("play".into()))
        );
    }

    #[test]
    fn help_and_parse_errors_need_no_server() {
        let options = ConnectionOptions {
            list_idle_timeout: std::time::Duration::from_millis(10),
            response_timeout: std::time::Duration::from_millis(10),
            library_dir: std::env::temp_dir(),
            player: crate::sinks::PlayerCommand::from_command_line(
                "cat",
                std::time::Duration::ZERO,
            )
            .unwrap(),
            mux: crate::mux::MuxOptions::default(),
        };
        let mut shell = Shell::new("127.0.0.1", 1, options);
        let mut out = Vec::new();
        shell
            .run(std::io::Cursor::new("help\nbogus\nquit\nlist\n"), &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("stream+ <i>"));
        assert!(text.contains("unknown command \"bogus\""));
        assert!(!text.contains("connect"));
    }
}
