//! Admin shell (§11 supplemented feature): an interactive REPL for the
//! operator, running on a blocking task so `rustyline`'s synchronous I/O
//! never blocks the async runtime. Talks to the rest of the system only
//! through `AdminHandle` — it never touches `Supervisor`'s shared state
//! directly.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{error, info};

use crate::supervisor::AdminHandle;

/// Parsed form of one input line. Unknown input produces `Unknown` rather
/// than an error — the shell should never crash on a typo.
enum Command {
    Quit,
    ShowLog,
    HideLog,
    AddUser,
    ShowTemp,
    BotGo,
    BotStop,
    BotSay { user: String, message: String },
    Help,
    Blank,
    Unknown(String),
}

fn parse(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Blank;
    }
    let mut parts = line.splitn(3, char::is_whitespace);
    match (parts.next(), parts.next(), parts.next()) {
        (Some("quit"), ..) | (Some("exit"), ..) => Command::Quit,
        (Some("showlog"), ..) => Command::ShowLog,
        (Some("hidelog"), ..) => Command::HideLog,
        (Some("adduser"), ..) => Command::AddUser,
        (Some("showtemp"), ..) => Command::ShowTemp,
        (Some("help"), ..) => Command::Help,
        (Some("bot"), Some("go"), _) => Command::BotGo,
        (Some("bot"), Some("stop"), _) => Command::BotStop,
        (Some("bot"), Some("say"), Some(rest)) => {
            let mut it = rest.splitn(2, char::is_whitespace);
            let user = it.next().unwrap_or_default().to_string();
            let message = it.next().unwrap_or_default().to_string();
            Command::BotSay { user, message }
        }
        _ => Command::Unknown(line.to_string()),
    }
}

const HELP_TEXT: &str = "\
commands: quit, showlog, hidelog, adduser, showtemp, bot go|stop|say <user> <message>, help";

/// Runs the REPL to completion (on `quit` or EOF) on the current thread.
/// `main` spawns this inside `tokio::task::spawn_blocking`.
pub fn run(handle: AdminHandle) {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            error!(error = %e, "admin shell: failed to start readline editor");
            return;
        }
    };

    println!("kegbot admin shell. type 'help' for commands.");
    loop {
        match rl.readline("kegbot> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                if handle_command(&handle, &mut rl, parse(&line)) {
                    return;
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                info!("admin shell: input closed, shutting down");
                handle.quit();
                return;
            }
            Err(e) => {
                error!(error = %e, "admin shell: readline error");
                return;
            }
        }
    }
}

/// Returns `true` when the shell should exit.
fn handle_command(handle: &AdminHandle, rl: &mut DefaultEditor, cmd: Command) -> bool {
    let rt = match tokio::runtime::Handle::try_current() {
        Ok(rt) => rt,
        Err(_) => {
            error!("admin shell: no tokio runtime available to run this command on");
            return false;
        }
    };

    match cmd {
        Command::Blank => {}
        Command::Quit => {
            handle.quit();
            return true;
        }
        Command::ShowLog => {
            handle.showlog();
            println!("log output enabled");
        }
        Command::HideLog => {
            handle.hidelog();
            println!("log output hidden");
        }
        Command::Help => println!("{HELP_TEXT}"),
        Command::ShowTemp => match rt.block_on(handle.current_temperature()) {
            Ok(Some(c)) => println!("fridge: {:.1}C / {:.1}F", c, crate::thermo::celsius_to_fahrenheit(c)),
            Ok(None) => println!("no temperature reading yet"),
            Err(e) => println!("error reading temperature: {e}"),
        },
        Command::AddUser => add_user_flow(handle, rl, &rt),
        Command::BotGo => handle.bot_go(),
        Command::BotStop => handle.bot_stop(),
        Command::BotSay { user, message } => handle.bot_say(&user, &message),
        Command::Unknown(line) => println!("unknown command: {line} ('help' for a list)"),
    }
    false
}

/// `adduser`'s interactive Q&A, matching the original shell's prompts for
/// name / weight / gender / token id.
fn add_user_flow(handle: &AdminHandle, rl: &mut DefaultEditor, rt: &tokio::runtime::Handle) {
    let name = match rl.readline("  name: ") {
        Ok(s) => s.trim().to_string(),
        Err(_) => return,
    };
    let weight_lbs: f64 = match rl.readline("  weight (lbs, 0 if unknown): ") {
        Ok(s) => s.trim().parse().unwrap_or(0.0),
        Err(_) => return,
    };
    let gender = match rl.readline("  gender (male/female): ") {
        Ok(s) => s.trim().to_lowercase(),
        Err(_) => return,
    };
    let token_id: u64 = match rl.readline("  token id (hex, e.g. a1): ") {
        Ok(s) => match u64::from_str_radix(s.trim().trim_start_matches("0x"), 16) {
            Ok(t) => t,
            Err(_) => {
                println!("invalid token id, aborting");
                return;
            }
        },
        Err(_) => return,
    };

    match rt.block_on(handle.add_user(&name, weight_lbs, &gender, token_id)) {
        Ok(id) => println!("added user {name} (id {id}), bound to token {token_id:#x}"),
        Err(e) => println!("failed to add user: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert!(matches!(parse("quit"), Command::Quit));
        assert!(matches!(parse(" showlog "), Command::ShowLog));
        assert!(matches!(parse("hidelog"), Command::HideLog));
        assert!(matches!(parse("adduser"), Command::AddUser));
        assert!(matches!(parse("showtemp"), Command::ShowTemp));
        assert!(matches!(parse("bot go"), Command::BotGo));
        assert!(matches!(parse("bot stop"), Command::BotStop));
        assert!(matches!(parse(""), Command::Blank));
    }

    #[test]
    fn parses_bot_say_with_user_and_message() {
        match parse("bot say ace glad you're enjoying the keg") {
            Command::BotSay { user, message } => {
                assert_eq!(user, "ace");
                assert_eq!(message, "glad you're enjoying the keg");
            }
            _ => panic!("expected BotSay"),
        }
    }

    #[test]
    fn unrecognized_input_is_unknown_not_an_error() {
        assert!(matches!(parse("drop table users"), Command::Unknown(_)));
    }
}
