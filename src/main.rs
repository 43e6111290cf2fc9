use clap::Parser;
use color_eyre::eyre::{Context, bail};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use comproc::cli::{Cli, Command};
use comproc::client::Client;
use comproc::logfmt::LogFormatter;
use comproc::protocol::{LogEntry, METHOD_LOG, ServiceStatus};
use comproc::{config, daemon, paths};
use owo_colors::OwoColorize;
use std::io::IsTerminal;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::time::Duration;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config_path = std::path::absolute(&cli.file)
        .wrap_err_with(|| format!("invalid config path: {}", cli.file.display()))?;
    let socket_path = paths::socket_path(&config_path);

    match cli.command {
        Command::Daemon => {
            let cfg = config::load(&config_path)?;
            daemon::run(cfg, socket_path).await
        }
        Command::Up { services, follow } => run_up(&socket_path, &config_path, services, follow),
        Command::Down => run_down(&socket_path),
        Command::Stop { services } => run_stop(&socket_path, services),
        Command::Status => run_status(&socket_path, &config_path),
        Command::Restart { services } => run_restart(&socket_path, services),
        Command::Logs {
            services,
            lines,
            follow,
        } => run_logs(&socket_path, services, lines, follow),
        Command::Attach { service } => run_attach(&socket_path, &service),
    }
}

fn run_up(
    socket_path: &Path,
    config_path: &Path,
    services: Vec<String>,
    follow: bool,
) -> color_eyre::Result<()> {
    ensure_daemon(socket_path, config_path)?;

    let mut client = Client::connect(socket_path)?;
    let result = client.up(&services)?;

    if !result.started.is_empty() {
        println!("{} {}", "Started:".green(), result.started.join(", "));
    }
    if !result.failed.is_empty() {
        println!("{} {}", "Failed:".red(), result.failed.join(", "));
        bail!("some services failed to start");
    }

    if follow {
        stream_logs(&mut client, &services, 100, true)?;
    }
    Ok(())
}

/// Spawn a detached daemon for this config if none is listening yet, and
/// wait for its socket to come up. The config is validated here first so
/// errors surface in the foreground instead of a dead background process.
fn ensure_daemon(socket_path: &Path, config_path: &Path) -> color_eyre::Result<()> {
    if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
        return Ok(());
    }

    config::load(config_path)?;

    let exe = std::env::current_exe().wrap_err("failed to get executable path")?;
    std::process::Command::new(exe)
        .arg("--file")
        .arg(config_path)
        .arg("__daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .process_group(0)
        .spawn()
        .wrap_err("failed to start daemon")?;

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    bail!("timeout waiting for daemon to start");
}

fn run_down(socket_path: &Path) -> color_eyre::Result<()> {
    let Ok(mut client) = Client::connect(socket_path) else {
        // Daemon not running, nothing to do
        return Ok(());
    };

    let result = client.shutdown()?;
    if !result.stopped.is_empty() {
        println!("{} {}", "Stopped:".green(), result.stopped.join(", "));
    }
    Ok(())
}

fn run_stop(socket_path: &Path, services: Vec<String>) -> color_eyre::Result<()> {
    let Ok(mut client) = Client::connect(socket_path) else {
        println!("No services running");
        return Ok(());
    };

    let result = client.down(&services)?;
    if !result.stopped.is_empty() {
        println!("{} {}", "Stopped:".green(), result.stopped.join(", "));
    }
    Ok(())
}

fn run_status(socket_path: &Path, config_path: &Path) -> color_eyre::Result<()> {
    let Ok(mut client) = Client::connect(socket_path) else {
        return show_offline_status(config_path);
    };

    let result = client.status()?;
    if result.services.is_empty() {
        println!("No services");
        return Ok(());
    }
    print_status_table(&result.services);
    Ok(())
}

/// With no daemon around, show every configured service as stopped.
fn show_offline_status(config_path: &Path) -> color_eyre::Result<()> {
    let Ok(cfg) = config::load(config_path) else {
        println!("No services defined");
        return Ok(());
    };

    let services: Vec<ServiceStatus> = cfg
        .service_names()
        .into_iter()
        .map(|name| ServiceStatus {
            name,
            state: "stopped".to_string(),
            pid: None,
            restarts: 0,
            started_at: None,
            exit_code: None,
        })
        .collect();
    print_status_table(&services);
    Ok(())
}

fn state_color(state: &str) -> Color {
    match state {
        "running" => Color::Green,
        "starting" | "stopping" => Color::Yellow,
        "failed" => Color::Red,
        _ => Color::Reset,
    }
}

fn print_status_table(services: &[ServiceStatus]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("name").add_attribute(Attribute::Bold),
        Cell::new("state").add_attribute(Attribute::Bold),
        Cell::new("pid").add_attribute(Attribute::Bold),
        Cell::new("restarts").add_attribute(Attribute::Bold),
        Cell::new("started").add_attribute(Attribute::Bold),
        Cell::new("exit code").add_attribute(Attribute::Bold),
    ]);

    for svc in services {
        let pid = svc.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let started = svc.started_at.clone().unwrap_or_else(|| "-".into());
        let exit_code = svc
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into());
        let restarts = svc.restarts.to_string();
        let restarts_cell = if svc.restarts > 0 {
            Cell::new(&restarts).fg(Color::Yellow)
        } else {
            Cell::new(&restarts)
        };
        table.add_row(vec![
            Cell::new(&svc.name).fg(Color::Cyan),
            Cell::new(&svc.state).fg(state_color(&svc.state)),
            Cell::new(&pid),
            restarts_cell,
            Cell::new(&started),
            Cell::new(&exit_code),
        ]);
    }
    println!("{table}");
}

fn run_restart(socket_path: &Path, services: Vec<String>) -> color_eyre::Result<()> {
    let Ok(mut client) = Client::connect(socket_path) else {
        println!("No services running");
        return Ok(());
    };

    let result = client.restart(&services)?;
    if !result.restarted.is_empty() {
        println!("{} {}", "Restarted:".green(), result.restarted.join(", "));
    }
    if !result.failed.is_empty() {
        println!("{} {}", "Failed:".red(), result.failed.join(", "));
        bail!("some services failed to restart");
    }
    Ok(())
}

fn run_logs(
    socket_path: &Path,
    services: Vec<String>,
    lines: usize,
    follow: bool,
) -> color_eyre::Result<()> {
    let Ok(mut client) = Client::connect(socket_path) else {
        return Ok(());
    };
    stream_logs(&mut client, &services, lines, follow)
}

fn stream_logs(
    client: &mut Client,
    services: &[String],
    lines: usize,
    follow: bool,
) -> color_eyre::Result<()> {
    let mut formatter = make_formatter(client)?;

    let result = client.logs(services, lines, follow)?;
    for entry in &result.lines {
        formatter.print_line(&entry.service, &entry.line);
    }

    if !follow {
        return Ok(());
    }

    loop {
        let Ok(notification) = client.read_notification() else {
            return Ok(());
        };
        if notification.method == METHOD_LOG
            && let Ok(entry) = notification.parse_params::<LogEntry>()
        {
            formatter.print_line(&entry.service, &entry.line);
        }
    }
}

fn run_attach(socket_path: &Path, service: &str) -> color_eyre::Result<()> {
    let mut client =
        Client::connect(socket_path).wrap_err("daemon is not running")?;
    let mut formatter = make_formatter(&mut client)?;

    let result = client.attach(service)?;
    for entry in &result.lines {
        formatter.print_line(&entry.service, &entry.line);
    }

    // Forward our stdin as notifications while the main thread prints logs
    let mut stdin_tx = client.stdin_sender()?;
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if stdin_tx.send(&line).is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        let Ok(notification) = client.read_notification() else {
            return Ok(());
        };
        if notification.method == METHOD_LOG
            && let Ok(entry) = notification.parse_params::<LogEntry>()
        {
            formatter.print_line(&entry.service, &entry.line);
        }
    }
}

/// Formatter aligned to the full service set, colored only on a terminal.
fn make_formatter(client: &mut Client) -> color_eyre::Result<LogFormatter<std::io::Stdout>> {
    let status = client.status()?;
    let names: Vec<String> = status.services.into_iter().map(|s| s.name).collect();
    Ok(LogFormatter::new(
        std::io::stdout(),
        &names,
        std::io::stdout().is_terminal(),
    ))
}
