use std::{
    fmt::Display,
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal,
};
use log::debug;

use super::context::AppContext;
use crate::models::task::Lane;
use crate::worker::task::Task;

const PROMPT: &str = ">>> ";
const TICK: Duration = Duration::from_millis(100);

/// Leaves raw mode when the CLI returns, also on error.
struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Interactive front-end. Between keystrokes it pumps the event loop so
/// finish callbacks run here, on the UI thread.
pub fn run_cli(mut app: AppContext) -> io::Result<()> {
    println!("pykit started. Type 'help' for commands or 'exit' to quit.");
    let _raw = RawMode::enable()?;
    let mut history: Vec<String> = Vec::new();
    let mut history_index: usize = 0;
    let mut last_activity: Option<String> = None;

    'app_loop: loop {
        prompt("")?;
        let mut input = String::new();
        loop {
            if app.pump() > 0 || activity(&app) != last_activity {
                last_activity = activity(&app);
                if show_updates(&app, last_activity.as_deref())? {
                    prompt(&input)?;
                }
            }

            if !event::poll(TICK)? {
                continue;
            }
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Enter => {
                    print!("\r\n");
                    break;
                }
                KeyCode::Up => {
                    history_index = history_index.saturating_sub(1);
                    if let Some(command) = history.get(history_index) {
                        input = command.clone();
                        prompt(&input)?;
                    }
                }
                KeyCode::Down => {
                    if history_index < history.len() {
                        history_index += 1;
                    }
                    input = history.get(history_index).cloned().unwrap_or_default();
                    prompt(&input)?;
                }
                KeyCode::Char(c) => {
                    input.push(c);
                    print!("{}", c);
                    io::stdout().flush()?;
                }
                KeyCode::Backspace => {
                    input.pop();
                    prompt(&input)?;
                }
                KeyCode::Esc => {
                    input.clear();
                    prompt(&input)?;
                }
                _ => {}
            }
        }

        let line = input.trim().to_string();
        if line.is_empty() {
            continue 'app_loop;
        }
        history.push(line.clone());
        history_index = history.len();
        debug!("command: {}", line);

        if let Flow::Exit = execute_command(&mut app, &line)? {
            break 'app_loop;
        }
    }
    Ok(())
}

fn execute_command(app: &mut AppContext, line: &str) -> io::Result<Flow> {
    let mut args = line.split_whitespace();
    let Some(command) = args.next() else {
        return Ok(Flow::Continue);
    };
    let names: Vec<String> = args.map(str::to_string).collect();

    match command {
        "help" => print_help(),
        "envs" => {
            if app.interpreters().is_empty() {
                println!("\rNo interpreters configured, using {}.", app.packages().env_description());
            }
            for (i, python) in app.interpreters().iter().enumerate() {
                println!("\r{}\t{}", i, python.display());
            }
        }
        "use" => match names.first().map(|n| n.parse::<usize>()) {
            Some(Ok(index)) => match app.use_interpreter(index) {
                Ok(Some(python)) => println!("\rNow using {}.", python.display()),
                Ok(None) => println!("\rNo interpreter with index {}.", index),
                Err(e) => println!("\r{}", e),
            },
            Some(Err(_)) => println!("\rInvalid interpreter index."),
            None => println!("\rInterpreter index must be specified."),
        },
        "search" => report(app.search_interpreters().map(Some)),
        "list" => report(app.packages().refresh().map(Some)),
        "outdated" => report(app.packages().check_outdated().map(Some)),
        "install" => report(app.packages().install(names)),
        "uninstall" => report(app.packages().uninstall(names)),
        "upgrade" => report(app.packages().upgrade(names)),
        "upgrade-all" => report(app.packages().upgrade_all()),
        "download" => match names.split_first() {
            Some((dest, packages)) => {
                report(app.packages().download(packages.to_vec(), PathBuf::from(dest)))
            }
            None => println!("\rDestination directory must be specified."),
        },
        "mirrors" => {
            let mirrors = app.mirrors();
            if mirrors.is_empty() {
                println!("\rNo mirrors saved.");
            }
            for (name, url) in &mirrors {
                println!("\r{:<15} {}", name, url);
            }
        }
        "mirror-add" => match names.as_slice() {
            [name, url] => match app.add_mirror(name, url) {
                Ok(()) => println!("\rMirror '{}' saved.", name),
                Err(e) => println!("\r{}", e),
            },
            _ => println!("\rUsage: mirror-add <name> <url>"),
        },
        "mirror-del" => match names.first() {
            Some(name) => match app.remove_mirror(name) {
                Ok(url) => println!("\rRemoved mirror '{}' ({}).", name, url),
                Err(e) => println!("\r{}", e),
            },
            None => println!("\rMirror name must be specified."),
        },
        "mirror-use" => match names.first() {
            Some(name) => report(app.use_mirror(name).map(Some)),
            None => println!("\rMirror name or URL must be specified."),
        },
        "index" => report(app.show_index().map(Some)),
        "table" => print_table(app),
        "build" => {
            let config = app.config().freeze;
            match app.freezer_mut().build(&config) {
                Ok(task) => println!("\rBuild started as task {}.", task.id()),
                Err(e) => println!("\r{}", e),
            }
        }
        "check-imports" => {
            let config = app.config().freeze;
            report(app.freezer().check_imports(&config).map(Some));
        }
        "install-missing" => report(app.freezer().install_missing()),
        "reinstall-pyinstaller" => report(app.freezer().reinstall_pyinstaller().map(Some)),
        "output" => {
            for line in app.freezer().take_output() {
                println!("\r{}", line);
            }
        }
        "tasks" => {
            let packages = app.packages().registry();
            println!(
                "\rpackages: {} running ({} serial, {} concurrent)",
                packages.live_count(),
                packages.lane_count(Lane::SERIAL),
                packages.lane_count(Lane::CONCURRENT)
            );
            println!("\rfreezer:  {} running", app.freezer().registry().live_count());
        }
        "wait" => {
            println!("\rWaiting for running tasks, Esc to stop waiting...");
            // finish callbacks are queued for this thread, so pump while waiting
            while !app.can_close() {
                app.event_loop().pump_timeout(TICK);
                if escape_pressed()? {
                    println!("\rStopped waiting, tasks keep running.");
                    break;
                }
            }
            app.pump();
            show_updates(app, None)?;
        }
        "stop" => {
            let stopped = app.packages().stop_all() + app.freezer().stop_all();
            println!("\rStopped {} tasks.", stopped);
        }
        "exit" => {
            let closed = app.close(|| {
                confirm("Tasks are still running. Kill them and exit? [y/N] ").unwrap_or(false)
            });
            if closed {
                println!("\rExiting the program...");
                return Ok(Flow::Exit);
            }
        }
        other => println!("\rUnknown command: {}. Please try again.", other),
    }
    Ok(Flow::Continue)
}

fn report<E: Display>(started: Result<Option<Task>, E>) {
    match started {
        Ok(Some(task)) => println!("\rStarted task {}.", task.id()),
        Ok(None) => println!("\rNothing to do."),
        Err(e) => println!("\r{}", e),
    }
}

fn print_table(app: &AppContext) {
    let table = app.packages().table();
    if table.is_empty() {
        println!("\rNo packages loaded, run 'list' first.");
        return;
    }
    println!("\r{:<30} {:<15} {:<15} {}", "Package", "Version", "Latest", "Status");
    println!("\r{}", "-".repeat(72));
    for (name, row) in &table {
        println!("\r{:<30} {:<15} {:<15} {}", name, row.version, row.latest, row.status.label());
    }
}

fn print_help() {
    for line in [
        "envs                  list configured interpreters",
        "use <n>               switch to interpreter n",
        "search                look for new interpreters on PATH",
        "mirrors               list saved index mirrors",
        "mirror-add <n> <url>  save an index mirror",
        "mirror-del <n>        forget an index mirror",
        "mirror-use <n|url>    set the global index URL",
        "index                 show the effective index URL",
        "list                  reload installed packages",
        "outdated              check for newer releases",
        "install <names..>     install packages",
        "uninstall <names..>   remove packages",
        "upgrade <names..>     upgrade packages",
        "upgrade-all           upgrade every outdated package",
        "download <dir> <n..>  download packages into dir",
        "table                 show the package table",
        "build                 freeze the configured entry script",
        "output                show new build output",
        "check-imports         find project imports that are not installed",
        "install-missing       install what check-imports found",
        "reinstall-pyinstaller reinstall the freezing tool",
        "tasks                 show running tasks",
        "wait                  wait until every task finished",
        "stop                  stop every running task",
        "exit                  quit",
    ] {
        println!("\r{}", line);
    }
}

/// Prints pending notices and the current activity.
/// Returns whether anything was printed over the prompt.
fn show_updates(app: &AppContext, activity: Option<&str>) -> io::Result<bool> {
    let notices = app.take_notices();
    if notices.is_empty() && activity.is_none() {
        return Ok(false);
    }
    clear_line()?;
    for notice in notices {
        println!("\r{}", notice);
    }
    if let Some(activity) = activity {
        println!("\r{}", activity);
    }
    Ok(true)
}

fn activity(app: &AppContext) -> Option<String> {
    app.packages().activity().or_else(|| app.freezer().activity())
}

/// Drains pending key events, true if one of them was Esc.
fn escape_pressed() -> io::Result<bool> {
    while event::poll(Duration::ZERO)? {
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Press && key.code == KeyCode::Esc {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn confirm(question: &str) -> io::Result<bool> {
    print!("\r{}", question);
    io::stdout().flush()?;
    loop {
        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            let answer = matches!(key.code, KeyCode::Char('y') | KeyCode::Char('Y'));
            print!("\r\n");
            return Ok(answer);
        }
    }
}

fn prompt(input: &str) -> io::Result<()> {
    clear_line()?;
    print!("\r{}{}", PROMPT, input);
    io::stdout().flush()
}

fn clear_line() -> io::Result<()> {
    execute!(
        io::stdout(),
        cursor::MoveToColumn(0),
        terminal::Clear(terminal::ClearType::CurrentLine)
    )
}
