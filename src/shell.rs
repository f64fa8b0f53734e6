use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{error::ReadlineError, Config, Context, Editor, Helper};
use std::fmt::Write as _;

use crate::runtime::Supervisor;
use crate::worker::Worker;

const COMMANDS: [&str; 5] = ["status", "output", "stop", "exit", "help"];
const HISTORY_PATH: &str = "logs/history.txt";



/*
    @@@
    @CmdCompleter;
    . Plugs into rustyline to provide prefix-based tab completion over the fixed list of shell commands.
*/
struct CmdCompleter {
    commands: Vec<String>,
}
impl Helper for CmdCompleter {}
impl Hinter for CmdCompleter {
    type Hint = String;
}
impl Highlighter for CmdCompleter {}
impl Validator for CmdCompleter {}
impl Completer for CmdCompleter {
    type Candidate = Pair;
    fn complete(&self, line: &str, _pos: usize, _ctx: &Context<'_>) -> Result<(usize, Vec<Pair>), ReadlineError> {
        let matches = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(line))
            .map(|cmd| Pair { display: cmd.clone(), replacement: cmd.clone() })
            .collect();
        Ok((0, matches))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Status,
    Output,
    Stop,
    Exit,
    Help,
    Empty,
    Unknown(String),
}

pub fn parse_command(line: &str) -> ShellCommand {
    match line.trim() {
        "" => ShellCommand::Empty,
        "status" => ShellCommand::Status,
        "output" => ShellCommand::Output,
        "stop" => ShellCommand::Stop,
        "exit" | "quit" => ShellCommand::Exit,
        "help" => ShellCommand::Help,
        other => ShellCommand::Unknown(other.to_string()),
    }
}

/// One line per slot: index, program, pid, restarts, state, start time.
pub fn render_status(workers: &[std::sync::Arc<Worker>]) -> String {
    let mut out = String::new();
    for w in workers {
        let pid = w.pid().map_or_else(|| "-".to_string(), |p| p.to_string());
        let started = w
            .started_at()
            .map_or_else(|| "-".to_string(), |t| t.format("%H:%M:%S").to_string());
        let _ = writeln!(
            out,
            "[{}] {:<20} pid={:<8} restarts={} state={:?} started={}",
            w.slot(),
            w.spec().to_string(),
            pid,
            w.restarts(),
            w.state(),
            started
        );
    }
    out
}



/*
    @@@
    @run_shell();
    . Interactive control over a running supervisor: status, output, stop, exit.
    . Returns on `exit`, Ctrl-C or EOF; the caller decides what to do with still-running processes.
*/
pub async fn run_shell(supervisor: &Supervisor) -> rustyline::Result<()> {
    let config = Config::builder().build();
    let mut rl: Editor<CmdCompleter, DefaultHistory> = Editor::with_config(config)?;
    rl.set_helper(Some(CmdCompleter {
        commands: COMMANDS.iter().map(|c| c.to_string()).collect(),
    }));
    let _ = rl.load_history(HISTORY_PATH);

    loop {
        match rl.readline("supervisor> ") {
            Ok(line) => {
                rl.add_history_entry(line.trim())?;
                match parse_command(&line) {
                    ShellCommand::Status => {
                        print!("{}", render_status(&supervisor.workers().await));
                        println!(
                            "completed={} crashed={} exhausted={} total={} done={}",
                            supervisor.success_count().await,
                            supervisor.crash_count().await,
                            supervisor.exhausted_count().await,
                            supervisor.total(),
                            supervisor.is_done().await
                        );
                    }
                    ShellCommand::Output => {
                        for (program, text) in supervisor.read_stdout().await {
                            println!("--- {} (stdout) ---\n{}", program, text);
                        }
                        for (program, text) in supervisor.read_stderr().await {
                            println!("--- {} (stderr) ---\n{}", program, text);
                        }
                    }
                    ShellCommand::Stop => supervisor.stop_all().await,
                    ShellCommand::Exit => break,
                    ShellCommand::Help => println!("commands: {}", COMMANDS.join(", ")),
                    ShellCommand::Empty => {}
                    ShellCommand::Unknown(other) => println!("Unknown command: {}", other),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(HISTORY_PATH);
    Ok(())
}
