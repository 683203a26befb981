//! Input line parsing
//!
//! Plain lines are chat messages. Lines starting with `/` are client
//! commands.

use std::path::PathBuf;

use thiserror::Error;

/// One parsed input line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// Blank line
    Empty,
    /// Text to send
    Message(String),
    /// Client command
    Command(ClientCommand),
}

/// Slash commands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientCommand {
    /// `/new`
    NewChat,
    /// `/load <id>`
    Load(String),
    /// `/delete <id>`
    Delete(String),
    /// `/rename <id> <title>`
    Rename {
        /// Conversation id as typed
        id: String,
        /// New title
        title: String,
    },
    /// `/list`
    List,
    /// `/stop`
    Stop,
    /// `/image`: toggle image generation for following messages
    ToggleImages,
    /// `/attach <path>`: upload a file for the next message
    Attach(PathBuf),
    /// `/login <username> <password>`
    Login {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// `/guest`
    Guest,
    /// `/logout`
    Logout,
    /// `/help`
    Help,
    /// `/quit`
    Quit,
}

/// Rejected input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    /// The command does not exist
    #[error("unknown command /{0} (try /help)")]
    UnknownCommand(String),

    /// A required argument is missing
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Help text listing the commands
pub const HELP: &str = "\
/new                      start a new chat
/load <id>                open a conversation
/delete <id>              delete a conversation
/rename <id> <title>      rename a conversation
/list                     reload the conversation list
/stop                     stop waiting for the reply
/image                    toggle image generation
/attach <path>            attach a file to the next message
/login <user> <password>  sign in
/guest                    continue as guest
/logout                   sign out
/quit                     exit";

/// Parse one line of input
///
/// # Errors
///
/// Returns an error for unknown commands or missing arguments.
pub fn parse_line(line: &str) -> Result<Input, InputError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Ok(Input::Message(trimmed.to_string()));
    };

    let (name, args) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(n, a)| (n, a.trim()));

    let command = match name {
        "new" => ClientCommand::NewChat,
        "load" => ClientCommand::Load(single_arg(args, "/load <id>")?),
        "delete" => ClientCommand::Delete(single_arg(args, "/delete <id>")?),
        "rename" => {
            let (id, title) = args
                .split_once(char::is_whitespace)
                .ok_or(InputError::Usage("/rename <id> <title>"))?;
            ClientCommand::Rename {
                id: id.to_string(),
                title: title.trim().to_string(),
            }
        }
        "list" => ClientCommand::List,
        "stop" => ClientCommand::Stop,
        "image" => ClientCommand::ToggleImages,
        "attach" => {
            if args.is_empty() {
                return Err(InputError::Usage("/attach <path>"));
            }
            ClientCommand::Attach(PathBuf::from(args))
        }
        "login" => {
            let mut parts = args.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(username), Some(password)) => ClientCommand::Login {
                    username: username.to_string(),
                    password: password.to_string(),
                },
                _ => return Err(InputError::Usage("/login <user> <password>")),
            }
        }
        "guest" => ClientCommand::Guest,
        "logout" => ClientCommand::Logout,
        "help" => ClientCommand::Help,
        "quit" | "exit" => ClientCommand::Quit,
        other => return Err(InputError::UnknownCommand(other.to_string())),
    };
    Ok(Input::Command(command))
}

fn single_arg(args: &str, usage: &'static str) -> Result<String, InputError> {
    args.split_whitespace()
        .next()
        .map(ToString::to_string)
        .ok_or(InputError::Usage(usage))
}
