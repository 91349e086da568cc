//! Parses console lines into client commands.

use shared::snake::Direction;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create,
    List,
    Join(String),
    Leave,
    Ready,
    Start,
    Kick(String),
    Promote(String),
    Auth(String),
    Steer(Direction),
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),
}

pub const HELP: &str = "\
commands:
  create              create a lobby and become its owner
  list                refresh the lobby list
  join <code>         join a lobby
  leave               leave the current lobby
  ready               toggle ready
  start               start the countdown (owner)
  kick <client>       remove a member (owner)
  promote <client>    hand over ownership (owner)
  auth <token>        authenticate
  w/a/s/d, up/left/down/right   steer
  quit";

fn argument(
    name: &'static str,
    arg: Option<&str>,
) -> Result<String, CommandError> {
    arg.map(str::to_string)
        .ok_or(CommandError::MissingArgument(name))
}

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err(CommandError::Empty);
    };
    let arg = words.next();

    let command = match head.to_ascii_lowercase().as_str() {
        "create" => Command::Create,
        "list" | "ls" => Command::List,
        "join" => Command::Join(argument("join", arg)?.to_ascii_uppercase()),
        "leave" => Command::Leave,
        "ready" => Command::Ready,
        "start" => Command::Start,
        "kick" => Command::Kick(argument("kick", arg)?),
        "promote" => Command::Promote(argument("promote", arg)?),
        "auth" => Command::Auth(argument("auth", arg)?),
        "w" => Command::Steer(Direction::Up),
        "a" => Command::Steer(Direction::Left),
        "s" => Command::Steer(Direction::Down),
        "d" => Command::Steer(Direction::Right),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => match other.parse::<Direction>() {
            Ok(direction) => Command::Steer(direction),
            Err(_) => return Err(CommandError::Unknown(head.to_string())),
        },
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lobby_commands() {
        assert_eq!(parse_command("create"), Ok(Command::Create));
        assert_eq!(parse_command("  list "), Ok(Command::List));
        assert_eq!(parse_command("join ab12cd"), Ok(Command::Join("AB12CD".to_string())));
        assert_eq!(
            parse_command("kick 127.0.0.1:5000"),
            Ok(Command::Kick("127.0.0.1:5000".to_string()))
        );
        assert_eq!(parse_command("START"), Ok(Command::Start));
    }

    #[test]
    fn test_steering() {
        assert_eq!(parse_command("w"), Ok(Command::Steer(Direction::Up)));
        assert_eq!(parse_command("d"), Ok(Command::Steer(Direction::Right)));
        assert_eq!(parse_command("Left"), Ok(Command::Steer(Direction::Left)));
        assert_eq!(parse_command("DOWN"), Ok(Command::Steer(Direction::Down)));
    }

    #[test]
    fn test_errors() {
        assert_eq!(parse_command("   "), Err(CommandError::Empty));
        assert_eq!(parse_command("join"), Err(CommandError::MissingArgument("join")));
        assert_eq!(
            parse_command("dance"),
            Err(CommandError::Unknown("dance".to_string()))
        );
    }
}
